//! Error types for the Stackform orchestrator.
//!
//! This module provides the error hierarchy for every stage of a run:
//! settings, declaration loading, planning, provider calls, apply and
//! state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Stackform.
#[derive(Debug, Error)]
pub enum StackformError {
    /// Settings-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Declaration loading errors.
    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

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

/// Settings-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The settings file could not be parsed.
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

/// Declaration loading errors.
#[derive(Debug, Error)]
pub enum DeclarationError {
    /// Malformed declaration syntax.
    #[error("Parse error at {location}: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
        /// Where the error occurred (file, line and column when known).
        location: String,
    },

    /// A reference points at a variable or resource that does not exist.
    #[error("Undefined reference '{reference}' in {location}")]
    UndefinedReference {
        /// The dangling reference, as written.
        reference: String,
        /// Where the reference appears (resource attribute or output).
        location: String,
    },

    /// Two declarations share the same identity.
    #[error("Duplicate {kind} '{name}'")]
    Duplicate {
        /// What was duplicated (resource, variable, output).
        kind: String,
        /// The duplicated name.
        name: String,
    },

    /// A variable value does not match its declared type.
    #[error("Variable '{name}' expects {expected}, got {found}")]
    VariableType {
        /// Variable name.
        name: String,
        /// Declared type.
        expected: String,
        /// Type of the provided value.
        found: String,
    },

    /// A variable has neither a default nor a provided value.
    #[error("Variable '{name}' has no default and no value was provided")]
    MissingVariable {
        /// Variable name.
        name: String,
    },

    /// A resource declaration is invalid for its kind.
    #[error("Invalid resource '{address}': {message}")]
    InvalidResource {
        /// Resource address.
        address: String,
        /// Description of the problem.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Addresses forming the cycle, first address repeated at the end.
        cycle: Vec<String>,
    },

    /// A recorded resource references an address the planner cannot place.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Provider API errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limited by the provider.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Provider temporarily unavailable (5xx).
    #[error("Provider unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Read-after-write gap: the provider has not caught up yet.
    #[error("Provider not yet consistent for {resource}: {message}")]
    Inconsistent {
        /// Resource being accessed.
        resource: String,
        /// Description of the gap.
        message: String,
    },

    /// The provider rejected a parameter.
    #[error("Invalid parameter for {resource}: {message}")]
    InvalidParameter {
        /// Resource being accessed.
        resource: String,
        /// Error message from the provider.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    Authentication {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider reported a conflicting operation.
    #[error("Conflict on {resource}: {message}")]
    Conflict {
        /// Resource being accessed.
        resource: String,
        /// Error message from the provider.
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {kind}/{id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider id.
        id: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Transient errors persisted past the retry budget.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error seen.
        last_error: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A plan step failed; remaining steps were not attempted.
    #[error("{action} {address} failed: {message}")]
    ActionFailed {
        /// Resource address.
        address: String,
        /// Action that failed.
        action: String,
        /// Provider message.
        message: String,
    },

    /// The run was cancelled before all steps were issued.
    #[error("Apply cancelled after {completed} of {total} actions")]
    Cancelled {
        /// Steps completed before cancellation.
        completed: usize,
        /// Total steps in the plan.
        total: usize,
    },

    /// A step's attributes could not be resolved at execution time.
    #[error("Unresolved reference '{reference}' while applying {address}")]
    UnresolvedReference {
        /// Resource address.
        address: String,
        /// The reference that had no value.
        reference: String,
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

    /// The run's lock was released or taken over by another writer.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lock the run acquired.
        lock_id: String,
    },

    /// Storage backend I/O error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
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

/// Result type alias for Stackform operations.
pub type Result<T> = std::result::Result<T, StackformError>;

impl StackformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
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

impl DeclarationError {
    /// Creates a parse error at the given location.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            location: location.into(),
        }
    }

    /// Creates an undefined reference error.
    #[must_use]
    pub fn undefined(reference: impl Into<String>, location: impl Into<String>) -> Self {
        Self::UndefinedReference {
            reference: reference.into(),
            location: location.into(),
        }
    }
}

impl ProviderError {
    /// Returns true if the error is expected to clear on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::Network { .. }
                | Self::Inconsistent { .. }
        )
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(!ProviderError::InvalidParameter {
            resource: String::from("bucket.site"),
            message: String::from("bad acl"),
        }
        .is_transient());
        assert!(!ProviderError::RetriesExhausted {
            attempts: 5,
            last_error: String::from("503"),
        }
        .is_transient());
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = PlanError::CyclicDependency {
            cycle: vec![
                String::from("bucket.a"),
                String::from("bucket.b"),
                String::from("bucket.a"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Cyclic dependency: bucket.a -> bucket.b -> bucket.a"
        );
    }

    #[test]
    fn test_retryable_wraps_provider() {
        let err = StackformError::from(ProviderError::RateLimited { retry_after_secs: 1 });
        assert!(err.is_retryable());
        assert_eq!(
            ProviderError::RateLimited { retry_after_secs: 7 }.retry_after_secs(),
            Some(7)
        );
    }
}
