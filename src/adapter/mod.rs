//! Resource adapters.
//!
//! An adapter maps one resource group (jobs, pipelines, schemas, ...) onto
//! the remote control plane. The planner and the deployment units only talk
//! to resources through the [`Adapter`] trait; adapters are looked up in an
//! explicit [`AdapterRegistry`] built at startup.

mod client;
mod registry;
mod rest;

pub use client::RestClient;
pub use registry::AdapterRegistry;
pub use rest::RestAdapter;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{AdapterError, Result};
use crate::planner::{ActionType, Change, KeyedSlices, normalize_pattern};

/// Outcome of an operation that assigns a remote identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Remote identifier of the resource.
    pub id: String,
    /// Remote state returned by the call, if any.
    pub remote_state: Option<Value>,
}

impl Created {
    /// Creates an outcome without remote state.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_state: None,
        }
    }
}

/// Set of field paths accepted by a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    /// Every path is accepted.
    Any,
    /// Only the listed fields and their descendants are accepted.
    Fields(BTreeSet<String>),
}

impl FieldSet {
    /// Creates a field set from a list of field patterns.
    #[must_use]
    pub fn of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }

    /// Creates a field set that accepts nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self::Fields(BTreeSet::new())
    }

    /// Returns true if the path, or one of its ancestors, is in the set.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Fields(fields) => {
                let pattern = normalize_pattern(path);
                ancestors(&pattern).any(|p| fields.contains(p))
            }
        }
    }
}

/// Local (configuration) and remote (server-side) schemas of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Fields that can appear in the desired configuration.
    pub local: FieldSet,
    /// Fields that only the remote state carries.
    pub remote: FieldSet,
}

impl Default for ResourceSchema {
    fn default() -> Self {
        Self {
            local: FieldSet::Any,
            remote: FieldSet::none(),
        }
    }
}

/// Typed CRUD mapping of one resource group to the remote control plane.
#[async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Resource group served by this adapter.
    fn group(&self) -> &str;

    /// Turns configuration into the state that is diffed and persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be converted.
    fn prepare_state(&self, config: &Value) -> Result<Value> {
        Ok(config.clone())
    }

    /// Creates the resource.
    async fn do_create(&self, state: &Value) -> Result<Created>;

    /// Reads the remote state of the resource.
    async fn do_read(&self, id: &str) -> Result<Value>;

    /// Updates the resource in place.
    async fn do_update(&self, id: &str, state: &Value) -> Result<Option<Value>>;

    /// Returns true if [`Adapter::do_update_with_id`] is implemented.
    fn supports_update_with_id(&self) -> bool {
        false
    }

    /// Updates the resource, possibly assigning a new identifier.
    async fn do_update_with_id(&self, id: &str, state: &Value) -> Result<Created> {
        let _ = (id, state);
        Err(AdapterError::unsupported("update_with_id").into())
    }

    /// Resizes the resource in place. Defaults to a regular update.
    async fn do_resize(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        self.do_update(id, state).await
    }

    /// Deletes the resource.
    async fn do_delete(&self, id: &str) -> Result<()>;

    /// Waits until a created resource is ready and returns its remote state.
    async fn wait_after_create(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        let _ = (id, state);
        Ok(None)
    }

    /// Waits until an updated resource is ready and returns its remote state.
    async fn wait_after_update(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        let _ = (id, state);
        Ok(None)
    }

    /// Static field → action table. `is_local` selects the table used for
    /// configuration changes (`true`) or remote drift (`false`).
    fn field_triggers(&self, is_local: bool) -> BTreeMap<String, ActionType> {
        let _ = is_local;
        BTreeMap::new()
    }

    /// Custom per-change classification. `None` means no opinion.
    fn classify_change(
        &self,
        change: &Change,
        remote_state: Option<&Value>,
        is_local: bool,
    ) -> Option<ActionType> {
        let _ = (change, remote_state, is_local);
        None
    }

    /// List fields compared by key instead of by position.
    fn keyed_slices(&self) -> KeyedSlices {
        KeyedSlices::new()
    }

    /// Local and remote schemas used by reference resolution.
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::default()
    }

    /// Returns true if the resource is a permission object whose deletion may
    /// be denied without blocking the deployment.
    fn is_permission_object(&self) -> bool {
        false
    }
}

/// Looks up the trigger for a change path, falling back to its ancestors.
#[must_use]
pub fn trigger_for(triggers: &BTreeMap<String, ActionType>, path: &str) -> Option<ActionType> {
    if triggers.is_empty() {
        return None;
    }
    let pattern = normalize_pattern(path);
    ancestors(&pattern).find_map(|p| triggers.get(p).copied())
}

/// Yields `a.b[*].c`, `a.b[*]`, `a.b`, `a`.
fn ancestors(pattern: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(pattern);
    std::iter::from_fn(move || {
        let current = next?;
        next = current
            .rfind(['.', '['])
            .filter(|&i| i > 0)
            .map(|i| &current[..i]);
        Some(current)
    })
}
