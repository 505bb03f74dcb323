//! Plan and apply engine.
//!
//! The reconciler compares the desired resources with the state store,
//! produces a [`Plan`] by walking the dependency graph, and applies a plan by
//! walking the graph again and running one [`DeploymentUnit`] per resource.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, AdapterRegistry};
use crate::config::{ConfigHasher, EngineConfig};
use crate::error::{KeelError, PlanError, ResolveError, Result};
use crate::graph::{Direction, Graph, NodeOutcome, RunReport, Scheduler};
use crate::planner::{ActionType, DeploymentUnit, Plan, PlanEntry, classify};
use crate::refs::{
    Reference, Resolution, contains_reference, find_references, resolve_local_or_remote,
    resolve_remote, substitute,
};
use crate::state::{DependsOnEntry, StateStore, split_key};

/// Engine options.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Workers used while planning.
    pub plan_parallelism: usize,
    /// Workers used while applying.
    pub apply_parallelism: usize,
    /// Read remote state while planning.
    pub refresh: bool,
    /// Stops starting new resources once it reads `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ReconcileOptions {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            plan_parallelism: engine.plan_parallelism,
            apply_parallelism: engine.apply_parallelism,
            refresh: engine.refresh,
            cancel: None,
        }
    }
}

/// Plans and applies deployments against one state store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    registry: Arc<AdapterRegistry>,
    store: Arc<StateStore>,
    options: ReconcileOptions,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(registry: Arc<AdapterRegistry>, store: Arc<StateStore>) -> Self {
        Self {
            registry,
            store,
            options: ReconcileOptions::default(),
        }
    }

    /// Sets the engine options.
    #[must_use]
    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn scheduler(&self, parallelism: usize) -> Scheduler {
        let scheduler = Scheduler::new(parallelism);
        match &self.options.cancel {
            Some(cancel) => scheduler.with_cancel(cancel.clone()),
            None => scheduler,
        }
    }

    /// Computes the plan that brings the state store to `resources`.
    ///
    /// `resources` maps `<group>.<name>` keys to configuration. Keys only
    /// present in the state store are planned as deletes.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is malformed, a group has no adapter, a
    /// reference is malformed or points at an unknown resource, the graph has
    /// a cycle, or any resource fails to plan.
    pub async fn plan(&self, resources: &BTreeMap<String, Value>) -> Result<Plan> {
        info!("Planning {} resource(s)", resources.len());
        let config_hash = ConfigHasher::new().hash_resources(resources);

        let mut desired = BTreeMap::new();
        let mut depends_on = BTreeMap::new();
        let mut incoming: BTreeMap<String, Vec<Reference>> = BTreeMap::new();
        for (key, config) in resources {
            let adapter = self.adapter_for(key)?;
            let state = adapter.prepare_state(config)?;

            let mut deps = Vec::new();
            for reference in find_references(&state)? {
                let target = reference.target();
                if !resources.contains_key(&target) {
                    return Err(PlanError::UnknownReference {
                        key: key.clone(),
                        target,
                        label: reference.text().to_string(),
                    }
                    .into());
                }
                deps.push(DependsOnEntry {
                    node: target.clone(),
                    label: reference.text().to_string(),
                });
                incoming.entry(target).or_default().push(reference);
            }
            desired.insert(key.clone(), state);
            depends_on.insert(key.clone(), deps);
        }

        let mut deletes = BTreeMap::new();
        for (key, entry) in self.store.entries().await {
            if !desired.contains_key(&key) {
                self.adapter_for(&key)?;
                deletes.insert(key, entry.depends_on);
            }
        }

        let mut graph = Graph::new();
        for key in desired.keys().chain(deletes.keys()) {
            graph.add_node(key.as_str());
        }
        for (key, deps) in &depends_on {
            for dep in deps {
                graph.add_dependency(key, &dep.node, &dep.label, Direction::Deploy)?;
            }
        }
        for (key, deps) in &deletes {
            let present: Vec<&DependsOnEntry> =
                deps.iter().filter(|d| graph.contains(&d.node)).collect();
            for dep in present {
                graph.add_dependency(key, &dep.node, &dep.label, Direction::Destroy)?;
            }
        }

        let planner = Arc::new(PlanWalk {
            registry: self.registry.clone(),
            store: self.store.clone(),
            refresh: self.options.refresh,
            desired,
            depends_on,
            deletes,
            incoming,
            resolved: Mutex::new(BTreeMap::new()),
            entries: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
        });

        let walk = planner.clone();
        let report = self
            .scheduler(self.options.plan_parallelism)
            .run(&graph, move |key, failed| {
                let walk = walk.clone();
                async move { walk.run_node(key, failed).await }
            })
            .await?;

        let errors = std::mem::take(&mut *planner.errors.lock().await);
        if !report.is_success() {
            let failed = report.unsuccessful().count();
            let message = errors
                .iter()
                .next()
                .map(|(key, e)| format!("{key}: {e}"))
                .unwrap_or_else(|| String::from("planning was cancelled"));
            return Err(PlanError::Incomplete { failed, message }.into());
        }

        let mut plan = Plan::new(config_hash);
        plan.entries = std::mem::take(&mut *planner.entries.lock().await);
        info!("{plan}");
        Ok(plan)
    }

    /// Computes a plan that deletes every resource in the state store.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored key is malformed or its group has no
    /// adapter.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let mut plan = Plan::new(ConfigHasher::new().hash_resources(&BTreeMap::new()));
        for (key, entry) in self.store.entries().await {
            self.adapter_for(&key)?;
            let mut planned = PlanEntry::new(ActionType::Delete);
            planned.depends_on = entry.depends_on;
            plan.entries.insert(key, planned);
        }
        info!("{plan}");
        Ok(plan)
    }

    /// Commits a session recovered from the WAL at open time when there is
    /// nothing to apply. Returns the new serial, or `None` if no session was
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be committed.
    pub async fn commit_recovered(&self) -> Result<Option<u64>> {
        if !self.store.has_pending_session().await {
            return Ok(None);
        }
        info!("Committing recovered state session");
        self.store.finalize().await.map(Some)
    }

    /// Applies a plan and commits the state session exactly once.
    ///
    /// Node failures do not abort the run: they are reported in the
    /// [`ApplyReport`] and propagated to dependent resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan's graph is invalid or the state cannot
    /// be committed.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        info!("Applying plan: {plan}");
        let walked = self.walk_apply(plan).await;
        let serial = self.store.finalize().await?;
        let (outcomes, errors) = walked?;

        let report = ApplyReport {
            actions: plan.entries.iter().map(|(k, e)| (k.clone(), e.action)).collect(),
            outcomes,
            errors,
            serial,
        };
        if report.is_success() {
            info!("{report}");
        } else {
            warn!("{report}");
        }
        Ok(report)
    }

    async fn walk_apply(&self, plan: &Plan) -> Result<(RunReport, BTreeMap<String, String>)> {
        let mut graph = Graph::new();
        for key in plan.entries.keys() {
            graph.add_node(key.as_str());
        }
        let mut incoming: BTreeMap<String, Vec<Reference>> = BTreeMap::new();
        for (key, entry) in &plan.entries {
            let direction = Direction::for_action(entry.action);
            let present: Vec<&DependsOnEntry> = entry
                .depends_on
                .iter()
                .filter(|d| graph.contains(&d.node))
                .collect();
            for dep in present {
                graph.add_dependency(key, &dep.node, &dep.label, direction)?;
                if entry.action != ActionType::Delete {
                    incoming
                        .entry(dep.node.clone())
                        .or_default()
                        .push(Reference::parse(&dep.label)?);
                }
            }
        }

        let walk = Arc::new(ApplyWalk {
            registry: self.registry.clone(),
            store: self.store.clone(),
            entries: plan.entries.clone(),
            incoming,
            resolved: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
        });

        let handler_walk = walk.clone();
        let report = self
            .scheduler(self.options.apply_parallelism)
            .run(&graph, move |key, failed| {
                let walk = handler_walk.clone();
                async move { walk.run_node(key, failed).await }
            })
            .await?;

        let errors = std::mem::take(&mut *walk.errors.lock().await);
        Ok((report, errors))
    }

    fn adapter_for(&self, key: &str) -> Result<Arc<dyn Adapter>> {
        adapter_for(&self.registry, key)
    }
}

fn adapter_for(registry: &AdapterRegistry, key: &str) -> Result<Arc<dyn Adapter>> {
    let (group, _) = split_key(key).ok_or_else(|| PlanError::InvalidKey {
        key: key.to_string(),
    })?;
    registry.get(group)
}

/// Shared context of one planning walk.
struct PlanWalk {
    registry: Arc<AdapterRegistry>,
    store: Arc<StateStore>,
    refresh: bool,
    desired: BTreeMap<String, Value>,
    depends_on: BTreeMap<String, Vec<DependsOnEntry>>,
    deletes: BTreeMap<String, Vec<DependsOnEntry>>,
    /// References pointing at each resource.
    incoming: BTreeMap<String, Vec<Reference>>,
    /// Reference text → value, for references known at plan time.
    resolved: Mutex<BTreeMap<String, Value>>,
    entries: Mutex<BTreeMap<String, PlanEntry>>,
    errors: Mutex<BTreeMap<String, String>>,
}

impl PlanWalk {
    async fn run_node(&self, key: String, failed: Option<String>) -> bool {
        if let Some(dependency) = failed {
            debug!("Not planning {key}: {dependency} failed to plan");
            return false;
        }
        match self.plan_node(&key).await {
            Ok(entry) => {
                debug!("Planned {key}: {}", entry.action);
                self.entries.lock().await.insert(key, entry);
                true
            }
            Err(e) => {
                error!("Failed to plan {key}: {e}");
                self.errors.lock().await.insert(key, e.to_string());
                false
            }
        }
    }

    async fn plan_node(&self, key: &str) -> Result<PlanEntry> {
        if let Some(deps) = self.deletes.get(key) {
            let mut entry = PlanEntry::new(ActionType::Delete);
            entry.depends_on.clone_from(deps);
            return Ok(entry);
        }

        let adapter = adapter_for(&self.registry, key)?;
        let config = self
            .desired
            .get(key)
            .ok_or_else(|| KeelError::internal(format!("{key} is not part of the plan")))?;
        let desired = substitute(config, &*self.resolved.lock().await)?;

        let mut saved = self.store.get(key).await;
        let mut remote = None;
        if self.refresh
            && let Some(entry) = &saved
            && !entry.id.is_empty()
        {
            match adapter.do_read(&entry.id).await {
                Ok(state) => remote = Some(state),
                Err(e) if e.is_not_found() => {
                    warn!("{key} ({}) no longer exists remotely, planning create", entry.id);
                    saved = None;
                }
                Err(e) => return Err(e),
            }
        }

        let classification = classify(
            key,
            adapter.as_ref(),
            saved.as_ref(),
            &desired,
            remote.as_ref(),
        )?;
        let unit = DeploymentUnit::new(key, adapter).with_action(classification.action);
        unit.set_remote_state(remote).await;

        for reference in self.incoming.get(key).into_iter().flatten() {
            let resolution =
                resolve_local_or_remote(&unit, &self.store, &desired, reference.field()).await?;
            if let Resolution::Resolved(value) = resolution {
                self.resolved
                    .lock()
                    .await
                    .insert(reference.text().to_string(), value);
            }
        }

        Ok(PlanEntry {
            action: classification.action,
            depends_on: self.depends_on.get(key).cloned().unwrap_or_default(),
            new_state: Some(desired),
            changes: classification.changes,
        })
    }
}

/// Shared context of one apply walk.
struct ApplyWalk {
    registry: Arc<AdapterRegistry>,
    store: Arc<StateStore>,
    entries: BTreeMap<String, PlanEntry>,
    incoming: BTreeMap<String, Vec<Reference>>,
    resolved: Mutex<BTreeMap<String, Value>>,
    errors: Mutex<BTreeMap<String, String>>,
}

impl ApplyWalk {
    async fn run_node(&self, key: String, failed: Option<String>) -> bool {
        if let Some(dependency) = failed {
            warn!("Skipping {key}: {dependency} did not complete");
            return false;
        }
        match self.apply_node(&key).await {
            Ok(()) => true,
            Err(e) => {
                error!("{e}");
                self.errors.lock().await.insert(key, e.to_string());
                false
            }
        }
    }

    async fn apply_node(&self, key: &str) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| KeelError::internal(format!("{key} is not part of the plan")))?;
        let action = entry.action;
        let adapter = adapter_for(&self.registry, key)?;
        let unit = DeploymentUnit::new(key, adapter).with_action(action);

        let new_state = match &entry.new_state {
            Some(state) if action.has_changes() && action != ActionType::Delete => {
                let state = substitute(state, &*self.resolved.lock().await)
                    .map_err(|e| KeelError::deploy(key, action, e))?;
                if let Some(reference) = find_references(&state)?.into_iter().next() {
                    return Err(KeelError::deploy(
                        key,
                        action,
                        ResolveError::Unresolved {
                            key: key.to_string(),
                            reference: reference.text().to_string(),
                        }
                        .into(),
                    ));
                }
                Some(state)
            }
            other => other.clone(),
        };

        unit.deploy(&self.store, new_state.as_ref(), &entry.depends_on)
            .await?;

        if !action.has_changes() || action == ActionType::Delete {
            return Ok(());
        }
        let deployed = new_state.unwrap_or(Value::Null);
        for reference in self.incoming.get(key).into_iter().flatten() {
            if self.resolved.lock().await.contains_key(reference.text()) {
                continue;
            }
            let value = resolve_remote(&unit, &self.store, &deployed, reference.field())
                .await
                .map_err(|e| KeelError::deploy(key, action, e))?;
            if contains_reference(&value) {
                continue;
            }
            debug!("Resolved {reference} after deploying {key}");
            self.resolved
                .lock()
                .await
                .insert(reference.text().to_string(), value);
        }
        Ok(())
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Planned action per resource.
    pub actions: BTreeMap<String, ActionType>,
    /// Outcome per resource.
    pub outcomes: RunReport,
    /// Error message per failed resource.
    pub errors: BTreeMap<String, String>,
    /// Serial of the committed state.
    pub serial: u64,
}

impl ApplyReport {
    /// Returns true if every resource succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.is_success()
    }

    /// Returns the number of resources with each outcome kind:
    /// `(succeeded, failed, skipped, cancelled)`.
    #[must_use]
    pub fn tally(&self) -> (usize, usize, usize, usize) {
        let mut tally = (0, 0, 0, 0);
        for outcome in self.outcomes.outcomes.values() {
            match outcome {
                NodeOutcome::Succeeded => tally.0 += 1,
                NodeOutcome::Failed => tally.1 += 1,
                NodeOutcome::DependencyFailed { .. } => tally.2 += 1,
                NodeOutcome::Cancelled => tally.3 += 1,
            }
        }
        tally
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (succeeded, failed, skipped, cancelled) = self.tally();
        let status = if self.is_success() { "complete" } else { "failed" };
        write!(
            f,
            "Apply {status}: {succeeded} succeeded, {failed} failed, {skipped} skipped"
        )?;
        if cancelled > 0 {
            write!(f, ", {cancelled} cancelled")?;
        }
        write!(f, ". State serial {}.", self.serial)?;

        for (key, outcome) in self.outcomes.unsuccessful() {
            match self.errors.get(key) {
                Some(message) => write!(f, "\n  {key}: {message}")?,
                None => write!(f, "\n  {key}: {outcome}")?,
            }
        }
        Ok(())
    }
}
