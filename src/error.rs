//! Error types for the Stackforge orchestration engine.
//!
//! This module provides a comprehensive error hierarchy for all phases of an
//! engine run: catalog loading, graph construction, provider calls,
//! placement, and state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stackforge orchestration engine.
#[derive(Debug, Error)]
pub enum StackforgeError {
    /// Catalog configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Placement eligibility errors.
    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Catalog configuration errors.
///
/// All of these are caught before the graph is built; none of them have
/// provider-side effects.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The catalog file was not found.
    #[error("Catalog file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The catalog file could not be parsed.
    #[error("Failed to parse catalog: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Two resources share the same id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated resource id.
        id: String,
    },

    /// A resource declares a kind the engine does not recognize.
    #[error("Unknown resource kind '{kind}' on resource '{id}'")]
    UnknownKind {
        /// The declaring resource id.
        id: String,
        /// The unrecognized kind string.
        kind: String,
    },

    /// A literal attribute does not type-check against the kind's schema.
    #[error("Schema violation on resource '{id}': {message}")]
    SchemaViolation {
        /// The offending resource id.
        id: String,
        /// Description of the violation.
        message: String,
    },

    /// A scaling configuration violates `min <= desired <= max`.
    #[error(
        "Invalid scaling bounds on resource '{id}': min={min}, desired={desired}, max={max}"
    )]
    InvalidScalingBounds {
        /// The offending resource id.
        id: String,
        /// Declared minimum size.
        min: u32,
        /// Declared desired size.
        desired: u32,
        /// Declared maximum size.
        max: u32,
    },

    /// A `${var.*}` interpolation names a variable with no binding.
    #[error("Missing variable binding: {name}")]
    MissingVariable {
        /// Name of the unbound variable.
        name: String,
    },
}

/// Dependency graph errors.
///
/// Fatal before execution starts; nothing has been created when one of these
/// is raised.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// The units forming the cycle, in edge order. The first element is
        /// repeated at the end to close the loop.
        path: Vec<String>,
    },

    /// An attribute or explicit dependency references a resource that is not
    /// in the catalog.
    #[error("Resource '{from}' references unknown resource '{to}'")]
    UnresolvedReference {
        /// The referencing resource id.
        from: String,
        /// The missing target id.
        to: String,
    },
}

/// Cloud provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Authentication or authorization failed. Not retried.
    #[error("Provider permission denied: {message}")]
    PermissionDenied {
        /// Description of the permission failure.
        message: String,
    },

    /// The provider rejected the request payload. Not retried.
    #[error("Provider rejected request: {message}")]
    SchemaRejected {
        /// Error message from the provider.
        message: String,
    },

    /// An account quota would be exceeded. Not retried.
    #[error("Provider quota exceeded: {message}")]
    QuotaExceeded {
        /// Description of the quota issue.
        message: String,
    },

    /// The provider rate-limited the request. Transient.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// A network-level failure reaching the provider. Transient.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// A freshly written resource is not yet visible to reads. Transient.
    #[error("Resource {provider_id} not yet visible to provider reads")]
    NotYetVisible {
        /// Provider-assigned id of the invisible resource.
        provider_id: String,
    },

    /// The requested resource does not exist.
    #[error("Resource not found: {provider_id}")]
    NotFound {
        /// Provider-assigned id that failed to resolve.
        provider_id: String,
    },

    /// The provider returned a response the engine could not interpret.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A provider call failed with an unexpected status.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Retries against the provider were exhausted.
    #[error("Provider unavailable after {attempts} attempts: {message}")]
    Unavailable {
        /// Number of attempts made.
        attempts: u32,
        /// The terminal error message.
        message: String,
    },

    /// A resource did not reach the expected status in time.
    #[error("Timeout waiting for {provider_id} to reach status {expected_status}")]
    Timeout {
        /// Provider-assigned id of the resource.
        provider_id: String,
        /// Status that was never reached.
        expected_status: String,
    },
}

/// Placement eligibility errors.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The eligibility filter left no placement targets.
    ///
    /// Raised before any dependent creation attempt; an empty placement set
    /// must never reach the provider.
    #[error("No eligible placement targets remain after applying {policy}")]
    NoEligibleTargets {
        /// Description of the policy that emptied the set.
        policy: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
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

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for Stackforge operations.
pub type Result<T> = std::result::Result<T, StackforgeError>;

impl StackforgeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::RateLimited { .. }
                    | ProviderError::Network { .. }
                    | ProviderError::NotYetVisible { .. }
            )
        )
    }

    /// Returns the provider-suggested retry delay in seconds, if any.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a parse error without location information.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }

    /// Creates a schema violation for a specific resource.
    #[must_use]
    pub fn schema(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
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
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
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
}
