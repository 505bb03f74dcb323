//! Error types for the Keel deployment engine.
//!
//! This module provides the error hierarchy for every stage of a deployment:
//! configuration, state persistence, planning, graph scheduling, reference
//! resolution, and calls into resource adapters.

use std::path::PathBuf;
use thiserror::Error;

use crate::planner::ActionType;

/// The main error type for the Keel deployment engine.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Reference resolution errors.
    #[error("Reference error: {0}")]
    Resolve(#[from] ResolveError),

    /// Errors returned by a resource adapter.
    #[error("{0}")]
    Adapter(#[from] AdapterError),

    /// A node-level failure, attributed to the resource and attempted action.
    #[error("cannot {action} {key}: {source}")]
    Deploy {
        /// Resource key of the failing node.
        key: String,
        /// Action that was being attempted.
        action: ActionType,
        /// Underlying failure.
        #[source]
        source: Box<KeelError>,
    },

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The WAL was written for a serial the snapshot never reached.
    #[error("WAL serial {wal_serial} is ahead of expected serial {expected}; state file is behind the WAL")]
    WalAhead {
        /// Serial recorded in the WAL header.
        wal_serial: u64,
        /// Serial the snapshot would commit next.
        expected: u64,
    },

    /// The WAL belongs to a different state lineage.
    #[error("WAL lineage {wal} does not match state lineage {state}")]
    LineageMismatch {
        /// Lineage recorded in the WAL header.
        wal: String,
        /// Lineage recorded in the snapshot.
        state: String,
    },

    /// A WAL entry written by the current session could not be read back.
    #[error("Corrupted WAL entry at line {line}: {message}")]
    CorruptedWalEntry {
        /// One-based line number in the WAL file.
        line: usize,
        /// Description of the parse failure.
        message: String,
    },

    /// Attempted to persist an entry without a remote identifier.
    #[error("Refusing to save state for {key} with an empty ID")]
    EmptyId {
        /// Resource key.
        key: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Reading or writing a state file failed.
    #[error("State I/O failed: {message}")]
    Io {
        /// Description including the file path.
        message: String,
    },

    /// A mutation was attempted on a store opened for reading.
    #[error("State {path} was opened read-only")]
    ReadOnly {
        /// Snapshot path.
        path: String,
    },

    /// State version is newer than this binary understands.
    #[error("State version mismatch: expected at most {expected}, found {found}")]
    VersionMismatch {
        /// Highest supported state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A saved entry has no remote identifier.
    #[error("State entry for {key} has an empty ID")]
    EmptyId {
        /// Resource key.
        key: String,
    },

    /// No adapter is registered for the resource group.
    #[error("Unsupported resource type: {group}")]
    UnsupportedResourceType {
        /// Resource group name.
        group: String,
    },

    /// A resource key is malformed.
    #[error("Invalid resource key: {key}")]
    InvalidKey {
        /// The malformed key.
        key: String,
    },

    /// A reference points at a resource that is not part of the configuration.
    #[error("{key} references unknown resource {target} via {label}")]
    UnknownReference {
        /// Referencing resource.
        key: String,
        /// Missing target resource key.
        target: String,
        /// Reference text.
        label: String,
    },

    /// The classifier chose an ID-changing update the adapter cannot perform.
    #[error("{key}: adapter for {group} does not support update_with_id")]
    UpdateWithIdUnsupported {
        /// Resource key.
        key: String,
        /// Resource group.
        group: String,
    },

    /// An adapter declared an invalid shape at registration.
    #[error("Invalid adapter for {group}: {message}")]
    InvalidAdapter {
        /// Resource group.
        group: String,
        /// Description of the problem.
        message: String,
    },

    /// Planning did not complete for every resource.
    #[error("Planning failed for {failed} resource(s): {message}")]
    Incomplete {
        /// Number of failed nodes.
        failed: usize,
        /// First failure message.
        message: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A cycle was found.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// Rendered cycle path.
        cycle: String,
    },

    /// An edge references a node that does not exist.
    #[error("Edge {from} -> {to} references unknown node")]
    UnknownNode {
        /// Edge source.
        from: String,
        /// Edge destination.
        to: String,
    },
}

/// Reference resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A reference string is malformed.
    #[error("Invalid reference: {reference}")]
    InvalidReference {
        /// Reference text.
        reference: String,
    },

    /// The field is not part of either the local or remote schema.
    #[error("Field {field} of {key} is not in the local or remote schema")]
    SchemaMismatch {
        /// Resource key.
        key: String,
        /// Field path.
        field: String,
    },

    /// A no-op resource produced a delayed resolution.
    #[error("Field {field} of {key} cannot be delayed: resource is unchanged")]
    DelayedOnNoop {
        /// Resource key.
        key: String,
        /// Field path.
        field: String,
    },

    /// The resource ID was required but missing.
    #[error("Resource {key} has no ID")]
    MissingId {
        /// Resource key.
        key: String,
    },

    /// The field has no value after deployment.
    #[error("Field {field} of {key} has no value")]
    MissingValue {
        /// Resource key.
        key: String,
        /// Field path.
        field: String,
    },

    /// A composite value cannot be embedded inside a string.
    #[error("Cannot embed non-scalar value of {reference} into a string")]
    NotEmbeddable {
        /// Reference text.
        reference: String,
    },

    /// A reference remained unresolved when the resource was deployed.
    #[error("Unresolved reference {reference} in {key}")]
    Unresolved {
        /// Resource key.
        key: String,
        /// Reference text.
        reference: String,
    },
}

/// Errors raised by resource adapters and the remote control plane.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The remote resource does not exist.
    #[error("Resource not found: {message}")]
    NotFound {
        /// Description from the remote.
        message: String,
    },

    /// The caller lacks permission for the operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description from the remote.
        message: String,
    },

    /// API request failed.
    #[error("API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from API.
        message: String,
    },

    /// Rate limited.
    #[error("API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// The connection was never established, so the request was not sent.
    #[error("Connection failed: {message}")]
    ConnectFailed {
        /// Description of the connection failure.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Timeout waiting for a resource.
    #[error("Timeout waiting for {id} to reach {expected_state}")]
    Timeout {
        /// Remote identifier.
        id: String,
        /// Expected state that was not reached.
        expected_state: String,
    },

    /// The adapter does not implement the operation.
    #[error("Operation {operation} is not supported by this adapter")]
    Unsupported {
        /// Operation name.
        operation: String,
    },
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

impl KeelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps an error with the resource key and action it belongs to.
    #[must_use]
    pub fn deploy(key: impl Into<String>, action: ActionType, source: Self) -> Self {
        Self::Deploy {
            key: key.into(),
            action,
            source: Box::new(source),
        }
    }

    /// Returns the adapter error at the root of this error, if any.
    #[must_use]
    pub fn as_adapter(&self) -> Option<&AdapterError> {
        match self {
            Self::Adapter(e) => Some(e),
            Self::Deploy { source, .. } => source.as_adapter(),
            _ => None,
        }
    }

    /// Returns true if the remote resource is already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.as_adapter().is_some_and(AdapterError::is_not_found)
    }

    /// Returns true if the remote denied the operation.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        self.as_adapter()
            .is_some_and(AdapterError::is_permission_denied)
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Adapter(
                AdapterError::RateLimited { .. }
                    | AdapterError::NetworkError { .. }
                    | AdapterError::ConnectFailed { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Adapter(AdapterError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Adapter(
                AdapterError::NetworkError { .. } | AdapterError::ConnectFailed { .. },
            ) => Some(1),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Returns a mapper from an I/O error on `path` to a state error.
    pub fn io<'a>(
        action: &'static str,
        path: &'a std::path::Path,
    ) -> impl FnOnce(std::io::Error) -> KeelError + 'a {
        move |e| {
            Self::Io {
                message: format!("Failed to {action} {}: {e}", path.display()),
            }
            .into()
        }
    }
}

impl AdapterError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a connect-phase error.
    #[must_use]
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
        }
    }

    /// Returns true if the request may have reached the remote.
    #[must_use]
    pub const fn may_have_landed(&self) -> bool {
        !matches!(self, Self::RateLimited { .. } | Self::ConnectFailed { .. })
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Returns true if the remote resource is already gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the remote denied the operation.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
