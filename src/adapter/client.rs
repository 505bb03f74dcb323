//! HTTP client for JSON control-plane APIs.
//!
//! This module provides the transport used by [`super::RestAdapter`]: JSON
//! requests with bearer authentication, bounded retries for transient
//! failures, and mapping of HTTP statuses onto [`AdapterError`].

use reqwest::{Client, Method, StatusCode, header};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{AdapterError, KeelError, Result};

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// JSON-over-HTTP API client.
#[derive(Debug, Clone)]
pub struct RestClient {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Optional bearer token.
    token: Option<String>,
    /// Base delay between retries.
    retry_delay: Duration,
}

impl RestClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AdapterError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a `GET` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.execute(Method::GET, path, None).await
    }

    /// Sends a `POST` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::POST, path, Some(body)).await
    }

    /// Sends a `PUT` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::PUT, path, Some(body)).await
    }

    /// Sends a `PATCH` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::PATCH, path, Some(body)).await
    }

    /// Sends a `DELETE` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.execute(Method::DELETE, path, None).await.map(|_| ())
    }

    /// Executes a request with retries for transient failures. A `POST` is
    /// only retried when the remote cannot have acted on it.
    async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {method} {path}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.execute_once(method.clone(), path, body).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if should_retry(&method, &e) {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AdapterError::network("Max retries exceeded").into()))
    }

    /// Executes a single request.
    async fn execute_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                AdapterError::connect_failed(e.to_string())
            } else {
                AdapterError::network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(AdapterError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => AdapterError::NotFound { message: body },
                StatusCode::FORBIDDEN => AdapterError::PermissionDenied { message: body },
                StatusCode::UNAUTHORIZED => {
                    AdapterError::api_error(status.as_u16(), "Authentication failed")
                }
                _ => AdapterError::api_error(status.as_u16(), body),
            }
            .into());
        }

        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::network(format!("Failed to read response: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| {
            AdapterError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
            .into()
        })
    }
}

fn should_retry(method: &Method, err: &KeelError) -> bool {
    if *method == Method::POST {
        return matches!(err, KeelError::Adapter(e) if !e.may_have_landed());
    }
    is_transient(err)
}

/// Rate limits, network failures and server errors are retried.
fn is_transient(err: &KeelError) -> bool {
    err.is_retryable()
        || matches!(
            err,
            KeelError::Adapter(AdapterError::ApiRequestFailed { status, .. }) if *status >= 500
        )
}
