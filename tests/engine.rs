//! End-to-end tests of the plan/apply engine against in-memory adapters.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use keel_deploy::adapter::{Adapter, AdapterRegistry, Created, FieldSet, ResourceSchema};
use keel_deploy::config::ConfigParser;
use keel_deploy::error::{AdapterError, Result};
use keel_deploy::graph::NodeOutcome;
use keel_deploy::planner::ActionType;
use keel_deploy::reconciler::Reconciler;
use keel_deploy::state::{ResourceEntry, StateStore, quarantine_path, wal_path};

/// Fake control plane for one resource group.
#[derive(Debug)]
struct FakeApi {
    group: &'static str,
    next_id: AtomicUsize,
    objects: Mutex<BTreeMap<String, Value>>,
    rejected: BTreeSet<&'static str>,
    calls: Mutex<Vec<String>>,
    reads: AtomicUsize,
}

impl FakeApi {
    fn new(group: &'static str, first_id: usize) -> Self {
        Self {
            group,
            next_id: AtomicUsize::new(first_id),
            objects: Mutex::new(BTreeMap::new()),
            rejected: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
        }
    }

    fn rejecting(mut self, name: &'static str) -> Self {
        self.rejected.insert(name);
        self
    }

    fn seed(&self, id: &str, state: Value) {
        let mut remote = state;
        remote["url"] = json!(self.url(id));
        self.objects.lock().unwrap().insert(id.to_string(), remote);
    }

    fn url(&self, id: &str) -> String {
        format!("https://api.test/{}/{id}", self.group)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn store(&self, id: &str, state: &Value) -> Value {
        let mut remote = state.clone();
        remote["url"] = json!(self.url(id));
        self.objects
            .lock()
            .unwrap()
            .insert(id.to_string(), remote.clone());
        remote
    }

    fn admit(&self, state: &Value) -> Result<()> {
        let name = state["name"].as_str().unwrap_or_default();
        if self.rejected.contains(name) {
            return Err(AdapterError::api_error(400, format!("{name} is not allowed")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for FakeApi {
    fn group(&self) -> &str {
        self.group
    }

    async fn do_create(&self, state: &Value) -> Result<Created> {
        self.admit(state)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.calls.lock().unwrap().push(format!("create {id}"));
        let remote = self.store(&id, state);
        Ok(Created {
            id,
            remote_state: Some(remote),
        })
    }

    async fn do_read(&self, id: &str) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                AdapterError::NotFound {
                    message: id.to_string(),
                }
                .into()
            })
    }

    async fn do_update(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        self.admit(state)?;
        self.calls.lock().unwrap().push(format!("update {id}"));
        Ok(Some(self.store(id, state)))
    }

    async fn do_delete(&self, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("delete {id}"));
        self.objects.lock().unwrap().remove(id);
        Ok(())
    }

    fn field_triggers(&self, is_local: bool) -> BTreeMap<String, ActionType> {
        if is_local {
            BTreeMap::from([
                (String::from("name"), ActionType::Update),
                (String::from("storage"), ActionType::Recreate),
            ])
        } else {
            BTreeMap::new()
        }
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema {
            local: FieldSet::Any,
            remote: FieldSet::of(["url"]),
        }
    }
}

struct Env {
    dir: TempDir,
    jobs: Arc<FakeApi>,
    buckets: Arc<FakeApi>,
    store: Arc<StateStore>,
    reconciler: Reconciler,
}

impl Env {
    async fn new(jobs: FakeApi) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).await.unwrap());
        let jobs = Arc::new(jobs);
        let buckets = Arc::new(FakeApi::new("buckets", 500));
        let registry = AdapterRegistry::new()
            .with(jobs.clone())
            .unwrap()
            .with(buckets.clone())
            .unwrap();
        let reconciler = Reconciler::new(Arc::new(registry), store.clone());
        Self {
            dir,
            jobs,
            buckets,
            store,
            reconciler,
        }
    }

    /// Reopens the state from disk as a fresh process would.
    async fn reopen(&self) -> Reconciler {
        let store = StateStore::open(self.store.path()).await.unwrap();
        let registry = AdapterRegistry::new()
            .with(self.jobs.clone())
            .unwrap()
            .with(self.buckets.clone())
            .unwrap();
        Reconciler::new(Arc::new(registry), Arc::new(store))
    }
}

fn desired(yaml: &str) -> BTreeMap<String, Value> {
    let content = format!("project:\n  name: e2e\nresources:\n{yaml}");
    ConfigParser::new()
        .parse_yaml(&content, None)
        .unwrap()
        .resource_map()
}

#[tokio::test]
async fn test_update_keeps_id_and_commits_state() {
    let env = Env::new(FakeApi::new("jobs", 100)).await;
    env.jobs.seed("1", json!({"name": "old"}));
    env.store
        .save_state("jobs.foo", ResourceEntry::new("1", json!({"name": "old"})))
        .await
        .unwrap();
    assert_eq!(env.store.finalize().await.unwrap(), 1);

    let resources = desired("  jobs:\n    foo:\n      name: new\n");
    let plan = env.reconciler.plan(&resources).await.unwrap();
    assert_eq!(plan.action("jobs.foo"), Some(ActionType::Update));
    assert_eq!(plan.get("jobs.foo").unwrap().changes[0].path, "name");

    let report = env.reconciler.apply(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(report.serial, 2);

    let foo = env.store.get("jobs.foo").await.unwrap();
    assert_eq!(foo.id, "1");
    assert_eq!(foo.state, json!({"name": "new"}));
    assert_eq!(env.jobs.calls(), vec!["update 1"]);
    assert!(!wal_path(env.store.path()).exists());

    let reopened = env.reopen().await;
    assert_eq!(reopened.store().serial().await, 2);
    assert!(reopened.plan(&resources).await.unwrap().is_noop());
}

#[tokio::test]
async fn test_noop_apply_makes_no_calls_and_bumps_serial() {
    let env = Env::new(FakeApi::new("jobs", 1)).await;
    let resources = desired("  jobs:\n    a:\n      name: a\n    b:\n      name: b\n");

    let mut serials = Vec::new();
    for _ in 0..3 {
        let plan = env.reconciler.plan(&resources).await.unwrap();
        let report = env.reconciler.apply(&plan).await.unwrap();
        assert!(report.is_success());
        serials.push(report.serial);
    }

    assert_eq!(serials, vec![1, 2, 3]);
    let mut calls = env.jobs.calls();
    calls.sort();
    assert_eq!(calls, vec!["create 1", "create 2"]);
}

#[tokio::test]
async fn test_id_reference_is_known_when_the_owner_keeps_its_id() {
    let env = Env::new(FakeApi::new("jobs", 100)).await;
    env.jobs.seed("1", json!({"name": "old"}));
    env.store
        .save_state("jobs.foo", ResourceEntry::new("1", json!({"name": "old"})))
        .await
        .unwrap();
    env.store.finalize().await.unwrap();

    let resources = desired(
        "  jobs:\n    foo:\n      name: new\n    bar:\n      name: bar\n      upstream: ${resources.jobs.foo.id}\n",
    );
    let plan = env.reconciler.plan(&resources).await.unwrap();
    assert_eq!(plan.action("jobs.foo"), Some(ActionType::Update));
    assert_eq!(plan.action("jobs.bar"), Some(ActionType::Create));

    let bar = plan.get("jobs.bar").unwrap();
    assert_eq!(bar.new_state.as_ref().unwrap()["upstream"], json!("1"));
    assert_eq!(bar.depends_on[0].node, "jobs.foo");
}

#[tokio::test]
async fn test_id_reference_is_delayed_through_a_recreate() {
    let env = Env::new(FakeApi::new("jobs", 100)).await;
    env.jobs.seed("1", json!({"name": "foo", "storage": "a"}));
    env.store
        .save_state(
            "jobs.foo",
            ResourceEntry::new("1", json!({"name": "foo", "storage": "a"})),
        )
        .await
        .unwrap();
    env.store.finalize().await.unwrap();

    let resources = desired(
        "  jobs:\n    foo:\n      name: foo\n      storage: b\n    bar:\n      name: bar\n      upstream: ${resources.jobs.foo.id}\n",
    );
    let plan = env.reconciler.plan(&resources).await.unwrap();
    assert_eq!(plan.action("jobs.foo"), Some(ActionType::Recreate));
    assert_eq!(
        plan.get("jobs.bar").unwrap().new_state.as_ref().unwrap()["upstream"],
        json!("${resources.jobs.foo.id}")
    );

    let report = env.reconciler.apply(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(env.jobs.calls(), vec!["delete 1", "create 100", "create 101"]);

    let bar = env.store.get("jobs.bar").await.unwrap();
    assert_eq!(bar.state["upstream"], json!("100"));
}

#[tokio::test]
async fn test_remote_field_across_groups() {
    let env = Env::new(FakeApi::new("jobs", 1)).await;
    let resources = desired(
        "  buckets:\n    raw:\n      name: raw\n  jobs:\n    ingest:\n      name: ingest\n      target: \"write to ${resources.buckets.raw.url}\"\n",
    );

    let plan = env.reconciler.plan(&resources).await.unwrap();
    let report = env.reconciler.apply(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");
    let ingest = env.store.get("jobs.ingest").await.unwrap();
    assert_eq!(
        ingest.state["target"],
        json!("write to https://api.test/buckets/500")
    );

    // The bucket is unchanged, so its url is read back from the remote.
    let renamed = desired(
        "  buckets:\n    raw:\n      name: raw\n  jobs:\n    ingest:\n      name: ingest-v2\n      target: \"write to ${resources.buckets.raw.url}\"\n",
    );
    let plan = env.reconciler.plan(&renamed).await.unwrap();
    assert_eq!(plan.action("buckets.raw"), Some(ActionType::Noop));
    assert_eq!(plan.action("jobs.ingest"), Some(ActionType::Update));
    assert_eq!(env.buckets.reads.load(Ordering::SeqCst), 1);
    assert_eq!(plan.get("jobs.ingest").unwrap().changes.len(), 1);
}

#[tokio::test]
async fn test_failed_node_only_blocks_its_dependents() {
    let env = Env::new(FakeApi::new("jobs", 1).rejecting("bad")).await;
    let resources = desired(
        "  jobs:\n    a:\n      name: bad\n    b:\n      name: b\n      upstream: ${resources.jobs.a.id}\n    c:\n      name: c\n",
    );

    let plan = env.reconciler.plan(&resources).await.unwrap();
    let report = env.reconciler.apply(&plan).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.outcomes.get("jobs.a"), Some(&NodeOutcome::Failed));
    assert!(matches!(
        report.outcomes.get("jobs.b"),
        Some(NodeOutcome::DependencyFailed { .. })
    ));
    assert_eq!(report.outcomes.get("jobs.c"), Some(&NodeOutcome::Succeeded));
    assert!(report.errors["jobs.a"].contains("bad is not allowed"));

    let keys: Vec<String> = env.store.entries().await.into_keys().collect();
    assert_eq!(keys, vec!["jobs.c"]);
    assert!(!wal_path(env.store.path()).exists());

    // Only the failed resources are left to do.
    let plan = env.reconciler.plan(&resources).await.unwrap();
    assert_eq!(plan.changed_keys().collect::<Vec<_>>(), vec!["jobs.a", "jobs.b"]);
}

#[tokio::test]
async fn test_interrupted_session_is_recovered() {
    let env = Env::new(FakeApi::new("jobs", 1)).await;
    let resources = desired("  jobs:\n    a:\n      name: a\n    b:\n      name: b\n");
    let plan = env.reconciler.plan(&resources).await.unwrap();
    assert_eq!(plan.action("jobs.a"), Some(ActionType::Create));

    // The mutation for jobs.a reached the WAL, the one for jobs.b was cut off.
    env.jobs.seed("7", json!({"name": "a"}));
    env.store
        .save_state("jobs.a", ResourceEntry::new("7", json!({"name": "a"})))
        .await
        .unwrap();
    let wal = wal_path(env.store.path());
    let mut bytes = std::fs::read(&wal).unwrap();
    bytes.extend_from_slice(b"{\"k\":\"jobs.b\",\"v\":{\"id\":\"8");
    std::fs::write(&wal, &bytes).unwrap();

    let recovered = env.reopen().await;
    assert!(quarantine_path(recovered.store().path()).exists());
    let plan = recovered.plan(&resources).await.unwrap();
    assert_eq!(plan.action("jobs.a"), Some(ActionType::Noop));
    assert_eq!(plan.action("jobs.b"), Some(ActionType::Create));

    let report = recovered.apply(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(report.serial, 1);
    assert_eq!(recovered.store().get("jobs.a").await.unwrap().id, "7");
    assert!(env.dir.path().join("state.json").exists());
}

#[tokio::test]
async fn test_destroy_after_apply_empties_state() {
    let env = Env::new(FakeApi::new("jobs", 1)).await;
    let resources = desired(
        "  buckets:\n    raw:\n      name: raw\n  jobs:\n    ingest:\n      name: ingest\n      target: ${resources.buckets.raw.url}\n",
    );
    let plan = env.reconciler.plan(&resources).await.unwrap();
    env.reconciler.apply(&plan).await.unwrap();

    let plan = env.reconciler.plan_destroy().await.unwrap();
    let report = env.reconciler.apply(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert!(env.store.entries().await.is_empty());
    assert_eq!(env.jobs.calls().last().map(String::as_str), Some("delete 1"));
    assert_eq!(env.buckets.calls().last().map(String::as_str), Some("delete 500"));
    assert!(env.jobs.objects.lock().unwrap().is_empty());
}
