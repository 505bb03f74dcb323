//! Reference resolution against local configuration and remote state.
//!
//! During planning a field is resolved from whatever is already known; if the
//! value only exists after the resource is deployed the resolution is
//! [`Resolution::Delayed`] and retried by Apply once the owning resource's
//! deploy call has completed.

use serde_json::Value;
use tracing::debug;

use crate::error::{KeelError, ResolveError, Result};
use crate::planner::{ActionType, DeploymentUnit, FieldPath};
use crate::state::StateStore;

use super::reference::{contains_reference, find_references};

/// Field name that resolves to the resource's remote identifier.
pub const ID_FIELD: &str = "id";

/// Outcome of a plan-time resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The value is known now.
    Resolved(Value),
    /// The value is only known after the resource is deployed.
    Delayed,
}

impl Resolution {
    /// Returns the resolved value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Delayed => None,
        }
    }
}

/// Where a field may be read from.
#[derive(Debug, Clone, Copy)]
struct Sources {
    local: bool,
    remote: bool,
}

impl Sources {
    fn of(unit: &DeploymentUnit, field: &str) -> Result<Self> {
        let schema = unit.adapter().schema();
        let sources = Self {
            local: schema.local.contains(field),
            remote: schema.remote.contains(field),
        };
        if sources.local || sources.remote {
            Ok(sources)
        } else {
            Err(ResolveError::SchemaMismatch {
                key: unit.key().to_string(),
                field: field.to_string(),
            }
            .into())
        }
    }
}

/// Resolves `field` of the unit's resource at plan time.
///
/// `desired` is the resource's desired state with upstream references
/// already substituted where possible.
///
/// # Errors
///
/// Returns an error if the field is in neither schema, a required value is
/// missing, a remote read fails, or the resolution would be delayed for an
/// unchanged resource.
pub async fn resolve_local_or_remote(
    unit: &DeploymentUnit,
    store: &StateStore,
    desired: &Value,
    field: &str,
) -> Result<Resolution> {
    let action = unit.action();
    let resolution = plan_time(unit, store, desired, field, action).await?;

    if resolution == Resolution::Delayed && action == ActionType::Noop {
        return Err(ResolveError::DelayedOnNoop {
            key: unit.key().to_string(),
            field: field.to_string(),
        }
        .into());
    }
    debug!(
        "{}.{field} -> {}",
        unit.key(),
        if resolution == Resolution::Delayed {
            "delayed"
        } else {
            "resolved"
        }
    );
    Ok(resolution)
}

async fn plan_time(
    unit: &DeploymentUnit,
    store: &StateStore,
    desired: &Value,
    field: &str,
    action: ActionType,
) -> Result<Resolution> {
    if field == ID_FIELD {
        if !action.keeps_id() {
            return Ok(Resolution::Delayed);
        }
        return stored_id(unit, store).await.map(Resolution::Resolved);
    }

    let sources = Sources::of(unit, field)?;
    let local = lookup(desired, field);

    // A local value that still holds a reference is only known once that
    // reference resolves.
    if sources.local
        && let Some(value) = local
        && contains_reference(value)
    {
        return Ok(Resolution::Delayed);
    }

    match (sources.local, sources.remote) {
        (true, false) => local
            .cloned()
            .map(Resolution::Resolved)
            .ok_or_else(|| missing(unit, field)),
        (false, true) => remote_if_unchanged(unit, store, field, action).await,
        _ => match local {
            Some(value) => Ok(Resolution::Resolved(value.clone())),
            None => remote_if_unchanged(unit, store, field, action).await,
        },
    }
}

/// Resolves `field` of the unit's resource after it has been deployed.
///
/// `desired` is the state that was deployed.
///
/// # Errors
///
/// Returns an error if the field is in neither schema, has no value, still
/// holds an unresolved reference, or the remote read fails.
pub async fn resolve_remote(
    unit: &DeploymentUnit,
    store: &StateStore,
    desired: &Value,
    field: &str,
) -> Result<Value> {
    if field == ID_FIELD {
        return stored_id(unit, store).await;
    }

    let sources = Sources::of(unit, field)?;
    if sources.local
        && let Some(value) = lookup(desired, field)
    {
        if let Some(reference) = first_reference(value) {
            return Err(ResolveError::Unresolved {
                key: unit.key().to_string(),
                reference,
            }
            .into());
        }
        return Ok(value.clone());
    }
    if !sources.remote {
        return Err(missing(unit, field));
    }

    let remote = unit.remote_state(store).await?;
    lookup(&remote, field)
        .cloned()
        .ok_or_else(|| missing(unit, field))
}

async fn remote_if_unchanged(
    unit: &DeploymentUnit,
    store: &StateStore,
    field: &str,
    action: ActionType,
) -> Result<Resolution> {
    if action != ActionType::Noop {
        return Ok(Resolution::Delayed);
    }
    let remote = unit.remote_state(store).await?;
    lookup(&remote, field)
        .cloned()
        .map(Resolution::Resolved)
        .ok_or_else(|| missing(unit, field))
}

async fn stored_id(unit: &DeploymentUnit, store: &StateStore) -> Result<Value> {
    match store.get(unit.key()).await {
        Some(entry) if !entry.id.is_empty() => Ok(Value::String(entry.id)),
        _ => Err(ResolveError::MissingId {
            key: unit.key().to_string(),
        }
        .into()),
    }
}

/// Returns the value at `field`, treating null as absent.
fn lookup<'a>(state: &'a Value, field: &str) -> Option<&'a Value> {
    FieldPath::parse(field)?
        .get(state)
        .filter(|v| !v.is_null())
}

fn first_reference(value: &Value) -> Option<String> {
    if !contains_reference(value) {
        return None;
    }
    find_references(value)
        .ok()
        .and_then(|refs| refs.into_iter().next())
        .map(|r| r.text().to_string())
        .or_else(|| Some(value.to_string()))
}

fn missing(unit: &DeploymentUnit, field: &str) -> KeelError {
    ResolveError::MissingValue {
        key: unit.key().to_string(),
        field: field.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Created, FieldSet, ResourceSchema};
    use crate::state::ResourceEntry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Jobs {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for Jobs {
        fn group(&self) -> &str {
            "jobs"
        }
        async fn do_create(&self, _state: &Value) -> Result<Created> {
            Ok(Created::new("1"))
        }
        async fn do_read(&self, id: &str) -> Result<Value> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"url": format!("https://x/{id}"), "name": "remote-name"}))
        }
        async fn do_update(&self, _id: &str, _state: &Value) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn do_delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn schema(&self) -> ResourceSchema {
            ResourceSchema {
                local: FieldSet::of(["name", "tags", "settings"]),
                remote: FieldSet::of(["url", "name"]),
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
        adapter: Arc<Jobs>,
    }

    async fn fixture(saved: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();
        if let Some(id) = saved {
            store
                .save_state("jobs.foo", ResourceEntry::new(id, json!({})))
                .await
                .unwrap();
        }
        Fixture {
            _dir: dir,
            store,
            adapter: Arc::new(Jobs::default()),
        }
    }

    fn unit(f: &Fixture, action: ActionType) -> DeploymentUnit {
        DeploymentUnit::new("jobs.foo", f.adapter.clone()).with_action(action)
    }

    #[tokio::test]
    async fn test_id_follows_keeps_id() {
        let f = fixture(Some("7")).await;
        for action in ActionType::ALL {
            if matches!(action, ActionType::Unset | ActionType::Delete) {
                continue;
            }
            let result =
                resolve_local_or_remote(&unit(&f, action), &f.store, &json!({}), "id").await;
            if action.keeps_id() {
                assert_eq!(result.unwrap(), Resolution::Resolved(json!("7")), "{action}");
            } else {
                assert_eq!(result.unwrap(), Resolution::Delayed, "{action}");
            }
        }
    }

    #[tokio::test]
    async fn test_id_requires_stored_entry() {
        let f = fixture(None).await;
        let err = resolve_local_or_remote(&unit(&f, ActionType::Update), &f.store, &json!({}), "id")
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::MissingId { .. })));
    }

    #[tokio::test]
    async fn test_local_only_field() {
        let f = fixture(None).await;
        let desired = json!({"tags": {"team": "data"}});
        let target = unit(&f, ActionType::Create);
        let result = resolve_local_or_remote(&target, &f.store, &desired, "tags.team")
            .await
            .unwrap();
        assert_eq!(result, Resolution::Resolved(json!("data")));
    }

    #[tokio::test]
    async fn test_local_value_with_reference_is_delayed() {
        let f = fixture(None).await;
        let desired = json!({"settings": "${resources.jobs.bar.id}"});
        let target = unit(&f, ActionType::Create);
        let result = resolve_local_or_remote(&target, &f.store, &desired, "settings")
            .await
            .unwrap();
        assert_eq!(result, Resolution::Delayed);
    }

    #[tokio::test]
    async fn test_remote_only_field() {
        let f = fixture(Some("7")).await;

        let changed = unit(&f, ActionType::Update);
        let result = resolve_local_or_remote(&changed, &f.store, &json!({}), "url").await.unwrap();
        assert_eq!(result, Resolution::Delayed);
        assert_eq!(f.adapter.reads.load(Ordering::SeqCst), 0);

        let unchanged = unit(&f, ActionType::Noop);
        for _ in 0..2 {
            let result = resolve_local_or_remote(&unchanged, &f.store, &json!({}), "url")
                .await
                .unwrap();
            assert_eq!(result, Resolution::Resolved(json!("https://x/7")));
        }
        assert_eq!(f.adapter.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_schemas_prefer_local() {
        let f = fixture(Some("7")).await;
        let result = resolve_local_or_remote(
            &unit(&f, ActionType::Update),
            &f.store,
            &json!({"name": "local-name"}),
            "name",
        )
        .await
        .unwrap();
        assert_eq!(result, Resolution::Resolved(json!("local-name")));

        let result = resolve_local_or_remote(
            &unit(&f, ActionType::Noop),
            &f.store,
            &json!({"name": null}),
            "name",
        )
        .await
        .unwrap();
        assert_eq!(result, Resolution::Resolved(json!("remote-name")));

        let target = unit(&f, ActionType::Update);
        let result = resolve_local_or_remote(&target, &f.store, &json!({}), "name")
            .await
            .unwrap();
        assert_eq!(result, Resolution::Delayed);
    }

    #[tokio::test]
    async fn test_unknown_field_is_schema_mismatch() {
        let f = fixture(Some("7")).await;
        let target = unit(&f, ActionType::Noop);
        let err = resolve_local_or_remote(&target, &f.store, &json!({}), "owner")
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::SchemaMismatch { .. })));
    }

    #[tokio::test]
    async fn test_delayed_on_noop_is_an_error() {
        let f = fixture(Some("7")).await;
        let desired = json!({"settings": "${resources.jobs.bar.id}"});
        let target = unit(&f, ActionType::Noop);
        let err = resolve_local_or_remote(&target, &f.store, &desired, "settings")
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::DelayedOnNoop { .. })));
    }

    #[tokio::test]
    async fn test_resolve_remote_after_deploy() {
        let f = fixture(Some("9")).await;
        let deployed = unit(&f, ActionType::Create);
        deployed.set_remote_state(Some(json!({"url": "https://x/9"}))).await;

        assert_eq!(
            resolve_remote(&deployed, &f.store, &json!({}), "id").await.unwrap(),
            json!("9")
        );
        assert_eq!(
            resolve_remote(&deployed, &f.store, &json!({}), "url").await.unwrap(),
            json!("https://x/9")
        );
        assert_eq!(
            resolve_remote(&deployed, &f.store, &json!({"tags": ["a"]}), "tags").await.unwrap(),
            json!(["a"])
        );
        assert_eq!(f.adapter.reads.load(Ordering::SeqCst), 0);

        let err = resolve_remote(
            &deployed,
            &f.store,
            &json!({"settings": "${resources.jobs.bar.id}"}),
            "settings",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::Unresolved { .. })));
    }
}
