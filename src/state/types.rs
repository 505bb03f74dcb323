//! Persisted state types.
//!
//! These types make up the snapshot file (`Database`) and the write-ahead log
//! (`WalHeader` followed by `WalEntry` lines).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current version of the snapshot format.
pub const STATE_VERSION: u32 = 1;

/// Version of this binary, recorded in every snapshot.
pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A declared dependency on another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependsOnEntry {
    /// Key of the resource depended on.
    pub node: String,
    /// Reference text that introduced the dependency.
    pub label: String,
}

/// Last deployed state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Remote identifier. Never empty once persisted.
    #[serde(rename = "__id__")]
    pub id: String,
    /// Deployed state snapshot.
    pub state: Value,
    /// Dependencies at the time of deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependsOnEntry>,
}

impl ResourceEntry {
    /// Creates an entry without dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, state: Value) -> Self {
        Self {
            id: id.into(),
            state,
            depends_on: Vec::new(),
        }
    }

    /// Returns the `etag` field of the state, if it is a string.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.state.get("etag").and_then(Value::as_str)
    }
}

/// The snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    /// Snapshot format version.
    pub state_version: u32,
    /// Version of the binary that wrote the snapshot.
    pub cli_version: String,
    /// Identity of this state history, assigned once.
    pub lineage: String,
    /// Incremented by exactly one per committed session.
    pub serial: u64,
    /// Entries by resource key.
    #[serde(default)]
    pub state: BTreeMap<String, ResourceEntry>,
}

impl Database {
    /// Creates an empty database with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state_version: STATE_VERSION,
            cli_version: CLI_VERSION.to_string(),
            lineage: uuid::Uuid::new_v4().to_string(),
            serial: 0,
            state: BTreeMap::new(),
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

/// First line of the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalHeader {
    /// Lineage of the snapshot the session started from.
    pub lineage: String,
    /// Serial the session commits to (`snapshot.serial + 1`).
    pub serial: u64,
}

/// One mutation recorded in the WAL. `v: None` is a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Resource key.
    pub k: String,
    /// New entry, absent for a delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ResourceEntry>,
}

/// Identifier and entity tag of an exported resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedResource {
    /// Remote identifier.
    pub id: String,
    /// Entity tag, when the state carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Exported view: group → name → resource.
pub type ExportedState = BTreeMap<String, BTreeMap<String, ExportedResource>>;

/// Splits a `<group>.<name>` key.
#[must_use]
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('.')
        .filter(|(group, name)| !group.is_empty() && !name.is_empty())
}
