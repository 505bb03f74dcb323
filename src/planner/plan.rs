//! Deployment plan types.
//!
//! A [`Plan`] maps every resource key to the action Apply will take. Plans
//! are immutable once handed to Apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::state::DependsOnEntry;

use super::action::ActionType;
use super::classify::PlannedChange;

/// Planned work for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Action to take.
    pub action: ActionType,
    /// Resources this one references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependsOnEntry>,
    /// Desired state with references resolved where possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<Value>,
    /// Field changes behind the action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<PlannedChange>,
}

impl PlanEntry {
    /// Creates an entry with no dependencies, state or changes.
    #[must_use]
    pub const fn new(action: ActionType) -> Self {
        Self {
            action,
            depends_on: Vec::new(),
            new_state: None,
            changes: Vec::new(),
        }
    }
}

/// A complete deployment plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired resources this plan is based on.
    pub config_hash: String,
    /// Planned work by resource key.
    pub entries: BTreeMap<String, PlanEntry>,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(config_hash: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Returns the entry for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PlanEntry> {
        self.entries.get(key)
    }

    /// Returns the action planned for a key.
    #[must_use]
    pub fn action(&self, key: &str) -> Option<ActionType> {
        self.entries.get(key).map(|e| e.action)
    }

    /// Returns true if no resource needs a remote call.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.entries.values().all(|e| !e.action.has_changes())
    }

    /// Returns the number of resources per action.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<ActionType, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.action).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the keys whose action has changes, in key order.
    pub fn changed_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.action.has_changes())
            .map(|(k, _)| k.as_str())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            return write!(f, "No changes. {} resource(s) up to date.", self.entries.len());
        }
        let parts: Vec<String> = self
            .counts()
            .into_iter()
            .filter(|(action, _)| action.has_changes())
            .map(|(action, count)| format!("{count} to {action}"))
            .collect();
        write!(f, "Plan: {}.", parts.join(", "))
    }
}
