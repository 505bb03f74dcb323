//! Per-resource deployment state machine.
//!
//! A [`DeploymentUnit`] drives one resource through its planned action,
//! calling the adapter and recording every successful mutation in the state
//! store before updating its cached remote state.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::Adapter;
use crate::error::{KeelError, ResolveError, Result};
use crate::state::{DependsOnEntry, ResourceEntry, StateStore};

use super::action::ActionType;

/// Transient per-resource context for planning and applying.
#[derive(Debug)]
pub struct DeploymentUnit {
    key: String,
    adapter: Arc<dyn Adapter>,
    action: ActionType,
    /// Last remote state seen, fetched at most once unless a mutation
    /// returns a newer one.
    remote_state: Mutex<Option<Value>>,
}

impl DeploymentUnit {
    /// Creates a unit with no action decided yet.
    #[must_use]
    pub fn new(key: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            key: key.into(),
            adapter,
            action: ActionType::Unset,
            remote_state: Mutex::new(None),
        }
    }

    /// Sets the action.
    #[must_use]
    pub const fn with_action(mut self, action: ActionType) -> Self {
        self.action = action;
        self
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the planned action.
    #[must_use]
    pub const fn action(&self) -> ActionType {
        self.action
    }

    /// Returns the adapter.
    #[must_use]
    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Seeds the cached remote state.
    pub async fn set_remote_state(&self, remote: Option<Value>) {
        *self.remote_state.lock().await = remote;
    }

    /// Returns the cached remote state without fetching.
    pub async fn cached_remote_state(&self) -> Option<Value> {
        self.remote_state.lock().await.clone()
    }

    /// Returns the remote state, reading it through the adapter on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource has no stored ID or the read fails.
    pub async fn remote_state(&self, store: &StateStore) -> Result<Value> {
        let mut cached = self.remote_state.lock().await;
        if let Some(remote) = cached.as_ref() {
            return Ok(remote.clone());
        }

        let entry = store.get(&self.key).await.ok_or_else(|| ResolveError::MissingId {
            key: self.key.clone(),
        })?;
        debug!("Reading remote state of {} ({})", self.key, entry.id);
        let remote = self.adapter.do_read(&entry.id).await?;
        *cached = Some(remote.clone());
        Ok(remote)
    }

    /// Runs the planned action. Failures are attributed to this unit's key
    /// and action.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Deploy`] wrapping the first failure.
    pub async fn deploy(
        &self,
        store: &StateStore,
        new_state: Option<&Value>,
        depends_on: &[DependsOnEntry],
    ) -> Result<()> {
        self.run(store, new_state, depends_on)
            .await
            .map_err(|e| KeelError::deploy(&self.key, self.action, e))
    }

    async fn run(
        &self,
        store: &StateStore,
        new_state: Option<&Value>,
        depends_on: &[DependsOnEntry],
    ) -> Result<()> {
        match self.action {
            ActionType::Unset | ActionType::Noop => Ok(()),
            ActionType::Delete => self.delete(store).await,
            action => {
                let state = new_state.ok_or_else(|| {
                    KeelError::internal(format!("{} has no desired state for {action}", self.key))
                })?;
                match action {
                    ActionType::Create => self.create(store, state, depends_on).await,
                    ActionType::Recreate => self.recreate(store, state, depends_on).await,
                    _ => self.update(store, state, depends_on).await,
                }
            }
        }
    }

    async fn create(
        &self,
        store: &StateStore,
        state: &Value,
        depends_on: &[DependsOnEntry],
    ) -> Result<()> {
        let created = self.adapter.do_create(state).await?;
        info!("Created {} ({})", self.key, created.id);

        store
            .save_state(&self.key, self.entry(&created.id, state, depends_on))
            .await?;

        let waited = self.adapter.wait_after_create(&created.id, state).await?;
        self.set_remote_state(waited.or(created.remote_state)).await;
        Ok(())
    }

    async fn recreate(
        &self,
        store: &StateStore,
        state: &Value,
        depends_on: &[DependsOnEntry],
    ) -> Result<()> {
        if let Some(entry) = store.get(&self.key).await {
            match self.adapter.do_delete(&entry.id).await {
                Ok(()) => info!("Deleted {} ({}) for recreation", self.key, entry.id),
                Err(e) if e.is_not_found() => {
                    info!("{} ({}) was already gone", self.key, entry.id);
                }
                Err(e) => return Err(e),
            }
            store.delete_state(&self.key).await?;
            self.set_remote_state(None).await;
        }
        self.create(store, state, depends_on).await
    }

    async fn update(
        &self,
        store: &StateStore,
        state: &Value,
        depends_on: &[DependsOnEntry],
    ) -> Result<()> {
        let entry = store.get(&self.key).await.ok_or_else(|| ResolveError::MissingId {
            key: self.key.clone(),
        })?;

        let (id, returned) = match self.action {
            ActionType::Resize => (
                entry.id.clone(),
                self.adapter.do_resize(&entry.id, state).await?,
            ),
            ActionType::UpdateWithId => {
                let updated = self.adapter.do_update_with_id(&entry.id, state).await?;
                (updated.id, updated.remote_state)
            }
            _ => (
                entry.id.clone(),
                self.adapter.do_update(&entry.id, state).await?,
            ),
        };
        if id == entry.id {
            info!("Updated {} ({id})", self.key);
        } else {
            info!("Updated {} ({} -> {id})", self.key, entry.id);
        }

        store
            .save_state(&self.key, self.entry(&id, state, depends_on))
            .await?;

        let waited = self.adapter.wait_after_update(&id, state).await?;
        self.set_remote_state(waited.or(returned)).await;
        Ok(())
    }

    async fn delete(&self, store: &StateStore) -> Result<()> {
        let Some(entry) = store.get(&self.key).await else {
            debug!("{} has no saved state, nothing to delete", self.key);
            return Ok(());
        };

        match self.adapter.do_delete(&entry.id).await {
            Ok(()) => info!("Deleted {} ({})", self.key, entry.id),
            Err(e) if e.is_not_found() => {
                info!("{} ({}) was already gone", self.key, entry.id);
            }
            Err(e) if e.is_permission_denied() && self.adapter.is_permission_object() => {
                warn!("Could not delete {} ({}): {e}", self.key, entry.id);
            }
            Err(e) => return Err(e),
        }

        store.delete_state(&self.key).await?;
        self.set_remote_state(None).await;
        Ok(())
    }

    fn entry(&self, id: &str, state: &Value, depends_on: &[DependsOnEntry]) -> ResourceEntry {
        ResourceEntry {
            id: id.to_string(),
            state: state.clone(),
            depends_on: depends_on.to_vec(),
        }
    }
}
