//! Error types for the entity registry
//!
//! Provides structured error types for the shared-map registries, the
//! dual-index entity registry, the cleanup coordinator and the reference
//! cluster backends.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the registry subsystem
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Contention Errors
    // =========================================================================
    #[error("Lock {lock_name} not acquired within {timeout:?}")]
    LockTimeout { lock_name: String, timeout: Duration },

    #[error("Compare-and-swap on {map}/{key} gave up after {attempts} attempts")]
    ContentionExhausted {
        map: String,
        key: String,
        attempts: u32,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Dual-index {operation} of {qualified_name} failed: forward={forward}, reverse={reverse}")]
    DualWrite {
        operation: String,
        qualified_name: String,
        forward: String,
        reverse: String,
    },

    #[error("Malformed record in {map}/{key}: {reason}")]
    MalformedRecord {
        map: String,
        key: String,
        reason: String,
    },

    #[error("Operation {operation} is not supported by the {strategy} write strategy")]
    UnsupportedOperation { operation: String, strategy: String },

    #[error("Node removal failed for {failed} of {attempted} stale nodes: {reason}")]
    NodeRemovalFailed {
        attempted: usize,
        failed: usize,
        reason: String,
    },

    // =========================================================================
    // Coordinator Errors
    // =========================================================================
    #[error("Coordinator already running on node {node_id}")]
    CoordinatorRunning { node_id: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during a reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after specific duration
    RequeueAfter(Duration),
    /// Don't retry, the failure will not go away by itself
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::LockTimeout { .. }
            | Error::ContentionExhausted { .. }
            | Error::BackendUnavailable { .. }
            | Error::BackendOperationFailed { .. } => ErrorAction::RequeueWithBackoff,

            // Both halves are idempotent, a full retry converges
            Error::DualWrite { .. } | Error::NodeRemovalFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(1))
            }

            // Fatal/programming errors - don't retry automatically
            Error::Configuration(_)
            | Error::MalformedRecord { .. }
            | Error::UnsupportedOperation { .. }
            | Error::CoordinatorRunning { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::ContentionExhausted { .. }
                | Error::BackendUnavailable { .. }
                | Error::BackendOperationFailed { .. }
        )
    }

    /// Check if this error only means someone else holds a lock
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::ContentionExhausted { .. }
        )
    }
}

/// Result type alias for the registry subsystem
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DualWrite {
            operation: "register".into(),
            qualified_name: "verticleX".into(),
            forward: "ok".into(),
            reverse: "backend unavailable".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(1)));

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::MalformedRecord {
            map: "forward".into(),
            key: "Customer".into(),
            reason: "expected array".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            backend: "memory".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());
        assert!(!transient.is_contention());

        let contention = Error::LockTimeout {
            lock_name: "cleanup".into(),
            timeout: Duration::from_millis(500),
        };
        assert!(contention.is_transient());
        assert!(contention.is_contention());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }
}
