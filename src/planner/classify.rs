//! Action classification.
//!
//! Turns the saved state, the desired state and (optionally) the remote state
//! of one resource into a single [`ActionType`]: the most severe action any
//! of its changed fields calls for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{Adapter, trigger_for};
use crate::error::{KeelError, PlanError, Result};
use crate::state::ResourceEntry;

use super::action::ActionType;
use super::diff::{Change, diff};

/// A changed field and the action it calls for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
    /// Path of the changed field.
    pub path: String,
    /// Action this change calls for.
    pub action: ActionType,
    /// Previous value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// New value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// True when the change was detected against the remote state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remote: bool,
}

/// Outcome of classifying one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Overall action.
    pub action: ActionType,
    /// Per-field reasons.
    pub changes: Vec<PlannedChange>,
}

impl Classification {
    const fn of(action: ActionType) -> Self {
        Self {
            action,
            changes: Vec::new(),
        }
    }
}

/// Classifies a resource.
///
/// `remote` enables drift detection: fields present in `desired` are also
/// compared with the remote state, using the adapter's remote trigger table.
///
/// # Errors
///
/// Returns an error if the saved entry has an empty ID, the adapter returns a
/// structural action for a change, or the result requires an ID-changing
/// update the adapter does not support.
pub fn classify(
    key: &str,
    adapter: &dyn Adapter,
    saved: Option<&ResourceEntry>,
    desired: &Value,
    remote: Option<&Value>,
) -> Result<Classification> {
    let Some(saved) = saved else {
        return Ok(Classification::of(ActionType::Create));
    };
    if saved.id.is_empty() {
        return Err(PlanError::EmptyId {
            key: key.to_string(),
        }
        .into());
    }

    let keyed = adapter.keyed_slices();
    let mut changes = Vec::new();

    let local = diff(&saved.state, desired, &keyed);
    classify_changes(key, adapter, local, remote, true, &mut changes)?;

    if let Some(remote_state) = remote {
        // Only fields the configuration sets can drift.
        let drift: Vec<Change> = diff(remote_state, desired, &keyed)
            .into_iter()
            .filter(|c| c.new.is_some())
            .collect();
        classify_changes(key, adapter, drift, remote, false, &mut changes)?;
    }

    let action = changes
        .iter()
        .map(|c| c.action)
        .max()
        .unwrap_or(ActionType::Noop);

    if action == ActionType::UpdateWithId && !adapter.supports_update_with_id() {
        return Err(PlanError::UpdateWithIdUnsupported {
            key: key.to_string(),
            group: adapter.group().to_string(),
        }
        .into());
    }

    Ok(Classification { action, changes })
}

fn classify_changes(
    key: &str,
    adapter: &dyn Adapter,
    changes: Vec<Change>,
    remote: Option<&Value>,
    is_local: bool,
    out: &mut Vec<PlannedChange>,
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let triggers = adapter.field_triggers(is_local);

    for change in changes {
        let action = adapter
            .classify_change(&change, remote, is_local)
            .or_else(|| trigger_for(&triggers, &change.path))
            .unwrap_or(ActionType::Update);

        if action.is_structural() {
            return Err(KeelError::internal(format!(
                "{key}: change to {} was classified as {action}",
                change.path
            )));
        }

        out.push(PlannedChange {
            path: change.path,
            action,
            old: change.old,
            new: change.new,
            remote: !is_local,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Created;
    use crate::planner::KeyedSlices;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct Jobs {
        triggers: BTreeMap<String, ActionType>,
        remote_triggers: BTreeMap<String, ActionType>,
        update_with_id: bool,
    }

    #[async_trait]
    impl Adapter for Jobs {
        fn group(&self) -> &str {
            "jobs"
        }
        async fn do_create(&self, _state: &Value) -> Result<Created> {
            Ok(Created::new("1"))
        }
        async fn do_read(&self, _id: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn do_update(&self, _id: &str, _state: &Value) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn do_delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn supports_update_with_id(&self) -> bool {
            self.update_with_id
        }
        fn field_triggers(&self, is_local: bool) -> BTreeMap<String, ActionType> {
            if is_local {
                self.triggers.clone()
            } else {
                self.remote_triggers.clone()
            }
        }
        fn classify_change(
            &self,
            change: &Change,
            _remote: Option<&Value>,
            _is_local: bool,
        ) -> Option<ActionType> {
            // Shrinking storage cannot be done in place.
            if change.path == "storage.size"
                && let (Some(old), Some(new)) = (&change.old, &change.new)
                && new.as_u64() < old.as_u64()
            {
                return Some(ActionType::Recreate);
            }
            None
        }
        fn keyed_slices(&self) -> KeyedSlices {
            KeyedSlices::new().with("tasks", "task_key")
        }
    }

    fn jobs(triggers: &[(&str, ActionType)]) -> Jobs {
        Jobs {
            triggers: triggers
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            ..Jobs::default()
        }
    }

    fn saved(state: Value) -> ResourceEntry {
        ResourceEntry::new("1", state)
    }

    #[test]
    fn test_missing_entry_is_create() {
        let result = classify("jobs.foo", &jobs(&[]), None, &json!({}), None).unwrap();
        assert_eq!(result.action, ActionType::Create);
    }

    #[test]
    fn test_empty_id_is_fatal() {
        let entry = ResourceEntry::new("", json!({}));
        let err = classify("jobs.foo", &jobs(&[]), Some(&entry), &json!({}), None).unwrap_err();
        assert!(matches!(err, KeelError::Plan(PlanError::EmptyId { .. })));
    }

    #[test]
    fn test_unchanged_is_noop() {
        let state = json!({"name": "a", "tasks": [{"task_key": "x"}, {"task_key": "y"}]});
        let reordered = json!({"name": "a", "tasks": [{"task_key": "y"}, {"task_key": "x"}]});
        let result =
            classify("jobs.foo", &jobs(&[]), Some(&saved(state)), &reordered, None).unwrap();
        assert_eq!(result.action, ActionType::Noop);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_trigger_table_and_default() {
        let adapter = jobs(&[("name", ActionType::Update), ("cluster", ActionType::Resize)]);

        let result = classify(
            "jobs.foo",
            &adapter,
            Some(&saved(json!({"cluster": {"size": 1}}))),
            &json!({"cluster": {"size": 2}}),
            None,
        )
        .unwrap();
        assert_eq!(result.action, ActionType::Resize);

        let result = classify(
            "jobs.foo",
            &adapter,
            Some(&saved(json!({"description": "a"}))),
            &json!({"description": "b"}),
            None,
        )
        .unwrap();
        assert_eq!(result.action, ActionType::Update);
    }

    #[test]
    fn test_max_severity_wins() {
        let adapter = jobs(&[
            ("name", ActionType::Update),
            ("cluster", ActionType::Resize),
            ("storage", ActionType::Recreate),
        ]);
        let result = classify(
            "jobs.foo",
            &adapter,
            Some(&saved(json!({"name": "a", "cluster": 1, "storage": "s3://a"}))),
            &json!({"name": "b", "cluster": 2, "storage": "s3://b"}),
            None,
        )
        .unwrap();
        assert_eq!(result.action, ActionType::Recreate);
        assert_eq!(result.changes.len(), 3);
    }

    #[test]
    fn test_adapter_classifier_runs_first() {
        let adapter = jobs(&[("storage", ActionType::Resize)]);
        let grow = classify(
            "jobs.foo",
            &adapter,
            Some(&saved(json!({"storage": {"size": 10}}))),
            &json!({"storage": {"size": 20}}),
            None,
        )
        .unwrap();
        assert_eq!(grow.action, ActionType::Resize);

        let shrink = classify(
            "jobs.foo",
            &adapter,
            Some(&saved(json!({"storage": {"size": 20}}))),
            &json!({"storage": {"size": 10}}),
            None,
        )
        .unwrap();
        assert_eq!(shrink.action, ActionType::Recreate);
    }

    #[test]
    fn test_update_with_id_requires_support() {
        let mut adapter = jobs(&[("schema", ActionType::UpdateWithId)]);
        let entry = saved(json!({"schema": 1}));
        let desired = json!({"schema": 2});

        let err = classify("jobs.foo", &adapter, Some(&entry), &desired, None).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Plan(PlanError::UpdateWithIdUnsupported { .. })
        ));

        adapter.update_with_id = true;
        let result = classify("jobs.foo", &adapter, Some(&entry), &desired, None).unwrap();
        assert_eq!(result.action, ActionType::UpdateWithId);
    }

    #[test]
    fn test_remote_drift_uses_remote_triggers() {
        let mut adapter = jobs(&[]);
        adapter
            .remote_triggers
            .insert(String::from("region"), ActionType::Recreate);

        let entry = saved(json!({"name": "a", "region": "eu"}));
        let desired = json!({"name": "a", "region": "eu"});
        let remote = json!({"name": "a", "region": "us", "url": "https://x"});

        let result = classify("jobs.foo", &adapter, Some(&entry), &desired, Some(&remote)).unwrap();
        assert_eq!(result.action, ActionType::Recreate);
        assert_eq!(result.changes.len(), 1);
        assert!(result.changes[0].remote);
        assert_eq!(result.changes[0].path, "region");
    }
}
