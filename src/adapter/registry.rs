//! Registry of resource adapters.
//!
//! The registry is built once at startup and shared by reference with the
//! planner and the executor. Adapter shapes are validated on registration so
//! a misconfigured adapter fails before any resource is touched.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{ConfigParser, DeployConfig};
use crate::error::{ConfigError, PlanError, Result};
use crate::planner::ActionType;

use super::{Adapter, RestAdapter, RestClient};

/// Adapters indexed by resource group.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Validates and registers an adapter under its group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group is already registered or the adapter
    /// declares triggers it cannot honor.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let group = adapter.group().to_string();
        if group.is_empty() || group.contains('.') {
            return Err(invalid(&group, "group name must be non-empty and contain no dots"));
        }
        if self.adapters.contains_key(&group) {
            return Err(invalid(&group, "group is already registered"));
        }

        for is_local in [true, false] {
            for (field, action) in adapter.field_triggers(is_local) {
                if action.is_structural() {
                    return Err(invalid(
                        &group,
                        format!("trigger for {field} names structural action {action}"),
                    ));
                }
                if action == ActionType::UpdateWithId && !adapter.supports_update_with_id() {
                    return Err(invalid(
                        &group,
                        format!("trigger for {field} requires update_with_id support"),
                    ));
                }
            }
        }

        debug!("Registered adapter for group {group}");
        self.adapters.insert(group, adapter);
        Ok(())
    }

    /// Builds a registry with one [`RestAdapter`] per configured group.
    ///
    /// # Errors
    ///
    /// Returns an error if adapters are configured without a `remote`
    /// section, the token variable is missing, or an adapter is invalid.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let mut registry = Self::new();
        if config.adapters.is_empty() {
            return Ok(registry);
        }

        let remote = config.remote.as_ref().ok_or_else(|| {
            ConfigError::validation("a remote section is required to use adapters", "remote")
        })?;
        let token = ConfigParser::get_token(remote.token_env.as_deref())?;
        let client = RestClient::new(&remote.base_url, token, remote.timeout_secs)?;

        for (group, adapter) in &config.adapters {
            registry.register(Arc::new(RestAdapter::new(
                group.clone(),
                adapter.clone(),
                client.clone(),
            )))?;
        }
        Ok(registry)
    }

    /// Builder-style variant of [`AdapterRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn with(mut self, adapter: Arc<dyn Adapter>) -> Result<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    /// Returns the adapter for a group.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter serves the group.
    pub fn get(&self, group: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters.get(group).cloned().ok_or_else(|| {
            PlanError::UnsupportedResourceType {
                group: group.to_string(),
            }
            .into()
        })
    }

    /// Returns true if a group has an adapter.
    #[must_use]
    pub fn contains(&self, group: &str) -> bool {
        self.adapters.contains_key(group)
    }

    /// Returns the registered groups.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

fn invalid(group: &str, message: impl Into<String>) -> crate::error::KeelError {
    PlanError::InvalidAdapter {
        group: group.to_string(),
        message: message.into(),
    }
    .into()
}
