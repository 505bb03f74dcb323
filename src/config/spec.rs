//! Configuration types for the deployment engine.
//!
//! This module defines all the structs that map to the `keel.deploy.yaml` file.
//! These types are declarative: adapters describe how each resource group maps
//! onto the remote control plane, resources describe the desired state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use validator::Validate;

use crate::planner::ActionType;

/// Default state file location, relative to the configuration directory.
pub const DEFAULT_STATE_PATH: &str = ".keel/state.json";

/// The root configuration structure for a Keel deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct DeployConfig {
    /// Project-level configuration.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// State file configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,
    /// Remote control plane connection.
    #[serde(default)]
    #[validate(nested)]
    pub remote: Option<RemoteConfig>,
    /// Adapter definitions by resource group.
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterConfig>,
    /// Desired resources: group → name → configuration.
    #[serde(default)]
    pub resources: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 32))]
    pub environment: String,
}

/// State file configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Snapshot file path. The WAL, quarantine and lock files live next to it.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct EngineConfig {
    /// Workers used while planning.
    #[serde(default = "default_plan_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub plan_parallelism: usize,
    /// Workers used while applying.
    #[serde(default = "default_apply_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub apply_parallelism: usize,
    /// Compare remote state with the desired state while planning.
    #[serde(default)]
    pub refresh: bool,
}

/// Remote control plane connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RemoteConfig {
    /// Base URL of the API.
    #[validate(url)]
    pub base_url: String,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
}

/// Mapping of one resource group onto a REST collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Collection path, appended to the remote base URL.
    pub path: String,
    /// Response field holding the resource identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Field → action table for configuration changes.
    #[serde(default)]
    pub triggers: BTreeMap<String, ActionType>,
    /// Field → action table for remote drift.
    #[serde(default)]
    pub remote_triggers: BTreeMap<String, ActionType>,
    /// List field pattern → key field.
    #[serde(default)]
    pub keyed_slices: BTreeMap<String, String>,
    /// Fields accepted in configuration. `None` accepts any field.
    #[serde(default)]
    pub local_fields: Option<Vec<String>>,
    /// Fields only the remote state carries.
    #[serde(default)]
    pub remote_fields: Vec<String>,
    /// Whether updates may assign a new identifier.
    #[serde(default)]
    pub update_with_id: bool,
    /// Whether denied deletes are tolerated.
    #[serde(default)]
    pub permission_object: bool,
    /// Readiness polling after create and update.
    #[serde(default)]
    pub ready: Option<ReadyConfig>,
}

/// Readiness polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadyConfig {
    /// Field of the remote state to watch.
    pub field: String,
    /// Value that marks the resource as ready.
    pub value: Value,
    /// Maximum wait in seconds.
    #[serde(default = "default_ready_timeout")]
    pub timeout_secs: u64,
    /// Poll interval in seconds.
    #[serde(default = "default_ready_interval")]
    pub interval_secs: u64,
}

// Default value functions

const fn default_plan_parallelism() -> usize {
    1
}

const fn default_apply_parallelism() -> usize {
    10
}

const fn default_timeout() -> u64 {
    30
}

const fn default_ready_timeout() -> u64 {
    600
}

const fn default_ready_interval() -> u64 {
    5
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_id_field() -> String {
    String::from("id")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plan_parallelism: default_plan_parallelism(),
            apply_parallelism: default_apply_parallelism(),
            refresh: false,
        }
    }
}

impl DeployConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the desired resources keyed by `<group>.<name>`.
    #[must_use]
    pub fn resource_map(&self) -> BTreeMap<String, Value> {
        self.resources
            .iter()
            .flat_map(|(group, items)| {
                items
                    .iter()
                    .map(move |(name, value)| (format!("{group}.{name}"), value.clone()))
            })
            .collect()
    }

    /// Returns the total number of desired resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.values().map(BTreeMap::len).sum()
    }

    /// Returns the snapshot path, resolved against `base` when relative.
    #[must_use]
    pub fn state_path(&self, base: &std::path::Path) -> PathBuf {
        let path = self
            .state
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH));
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }
}
