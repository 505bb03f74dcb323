//! Generic adapter for JSON-over-HTTP resource collections.
//!
//! A [`RestAdapter`] is configured per resource group from the `adapters`
//! section of the configuration and maps the adapter contract onto a REST
//! collection:
//!
//! | Operation          | Request                       |
//! |--------------------|-------------------------------|
//! | create             | `POST {path}`                 |
//! | read               | `GET {path}/{id}`             |
//! | update             | `PUT {path}/{id}`             |
//! | update with new ID | `PUT {path}/{id}`             |
//! | resize             | `PATCH {path}/{id}`           |
//! | delete             | `DELETE {path}/{id}`          |

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{AdapterConfig, ReadyConfig};
use crate::error::{AdapterError, Result};
use crate::planner::{ActionType, FieldPath, KeyedSlices, key_text};

use super::{Adapter, Created, FieldSet, ResourceSchema, RestClient};

/// Adapter for one REST collection.
#[derive(Debug, Clone)]
pub struct RestAdapter {
    /// Resource group served.
    group: String,
    /// Collection mapping.
    config: AdapterConfig,
    /// HTTP client.
    client: RestClient,
}

impl RestAdapter {
    /// Creates a new adapter for a resource group.
    #[must_use]
    pub fn new(group: impl Into<String>, config: AdapterConfig, client: RestClient) -> Self {
        Self {
            group: group.into(),
            config,
            client,
        }
    }

    fn item_path(&self, id: &str) -> String {
        format!("{}/{id}", self.config.path.trim_end_matches('/'))
    }

    fn extract_id(&self, response: &Value) -> Option<String> {
        response.get(&self.config.id_field).and_then(key_text)
    }

    /// Polls the resource until the ready field reaches the expected value.
    async fn wait_ready(&self, id: &str, ready: &ReadyConfig) -> Result<Value> {
        let field = FieldPath::parse(&ready.field).ok_or_else(|| AdapterError::InvalidResponse {
            message: format!("invalid ready field path: {}", ready.field),
        })?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(ready.timeout_secs);
        let interval = Duration::from_secs(ready.interval_secs.max(1));

        info!(
            "Waiting for {}/{id} to reach {}={}",
            self.group, ready.field, ready.value
        );

        loop {
            let remote = self.client.get(&self.item_path(id)).await?;
            if field.get(&remote) == Some(&ready.value) {
                debug!("{}/{id} is ready", self.group);
                return Ok(remote);
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(AdapterError::Timeout {
                    id: id.to_string(),
                    expected_state: format!("{}={}", ready.field, ready.value),
                }
                .into());
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn wait(&self, id: &str) -> Result<Option<Value>> {
        match &self.config.ready {
            Some(ready) => self.wait_ready(id, ready).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Keeps object responses as remote state; discards empty or scalar bodies.
fn remote_state(response: Value) -> Option<Value> {
    response.is_object().then_some(response)
}

#[async_trait]
impl Adapter for RestAdapter {
    fn group(&self) -> &str {
        &self.group
    }

    async fn do_create(&self, state: &Value) -> Result<Created> {
        let response = self.client.post(&self.config.path, state).await?;
        let id = self
            .extract_id(&response)
            .ok_or_else(|| AdapterError::InvalidResponse {
                message: format!(
                    "create response for {} has no '{}' field",
                    self.group, self.config.id_field
                ),
            })?;
        debug!("Created {}/{id}", self.group);
        Ok(Created {
            id,
            remote_state: remote_state(response),
        })
    }

    async fn do_read(&self, id: &str) -> Result<Value> {
        self.client.get(&self.item_path(id)).await
    }

    async fn do_update(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        let response = self.client.put(&self.item_path(id), state).await?;
        Ok(remote_state(response))
    }

    fn supports_update_with_id(&self) -> bool {
        self.config.update_with_id
    }

    async fn do_update_with_id(&self, id: &str, state: &Value) -> Result<Created> {
        if !self.config.update_with_id {
            return Err(AdapterError::unsupported("update_with_id").into());
        }
        let response = self.client.put(&self.item_path(id), state).await?;
        let new_id = self.extract_id(&response).unwrap_or_else(|| id.to_string());
        if new_id != id {
            info!("{}/{id} was replaced by {new_id}", self.group);
        }
        Ok(Created {
            id: new_id,
            remote_state: remote_state(response),
        })
    }

    async fn do_resize(&self, id: &str, state: &Value) -> Result<Option<Value>> {
        let response = self.client.patch(&self.item_path(id), state).await?;
        Ok(remote_state(response))
    }

    async fn do_delete(&self, id: &str) -> Result<()> {
        self.client.delete(&self.item_path(id)).await
    }

    async fn wait_after_create(&self, id: &str, _state: &Value) -> Result<Option<Value>> {
        self.wait(id).await
    }

    async fn wait_after_update(&self, id: &str, _state: &Value) -> Result<Option<Value>> {
        self.wait(id).await
    }

    fn field_triggers(&self, is_local: bool) -> BTreeMap<String, ActionType> {
        if is_local {
            self.config.triggers.clone()
        } else {
            self.config.remote_triggers.clone()
        }
    }

    fn keyed_slices(&self) -> KeyedSlices {
        KeyedSlices::from(self.config.keyed_slices.clone())
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema {
            local: self
                .config
                .local_fields
                .as_ref()
                .map_or(FieldSet::Any, |fields| FieldSet::of(fields.iter().cloned())),
            remote: FieldSet::of(self.config.remote_fields.iter().cloned()),
        }
    }

    fn is_permission_object(&self) -> bool {
        self.config.permission_object
    }
}
