//! Error types for the resilience engine.

use std::path::PathBuf;
use std::time::Duration;

use snafu::Snafu;

/// Result type for resilience operations.
pub type Result<T, E = ResilienceError> = std::result::Result<T, E>;

/// Errors that can occur while keeping replica counts within bounds.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ResilienceError {
    /// File or pool no longer exists when queried.
    ///
    /// Treated as "nothing to do": the operation is unregistered.
    #[snafu(display("{kind} not found: {name}"))]
    NotFound {
        /// What was looked up ("file", "pool", "pool group").
        kind: String,
        /// Identifier that was not found.
        name: String,
    },

    /// A round-trip to a collaborator exceeded its bound.
    #[snafu(display("{operation} timed out after {:?}", timeout))]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The underlying store or pool was momentarily unavailable.
    #[snafu(display("transient access failure: {reason}"))]
    TransientAccess {
        /// Failure reason.
        reason: String,
    },

    /// Constraints cannot be satisfied by the pool group membership.
    #[snafu(display("configuration error: {message}"))]
    Configuration {
        /// Description of the unsatisfiable constraint.
        message: String,
    },

    /// A logic invariant was violated.
    #[snafu(display("invariant violation: {message}"))]
    Bug {
        /// Description of the violated invariant.
        message: String,
    },

    /// Checkpoint file could not be read or written.
    #[snafu(display("checkpoint I/O failed for {}: {source}", path.display()))]
    CheckpointIo {
        /// Checkpoint path.
        path: PathBuf,
        /// Source error.
        source: std::io::Error,
    },

    /// Checkpoint record could not be encoded or decoded.
    #[snafu(display("malformed checkpoint record: {source}"))]
    CheckpointFormat {
        /// Source error.
        source: serde_json::Error,
    },
}

impl ResilienceError {
    /// Whether the failure should leave the operation registered for a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. } | ResilienceError::TransientAccess { .. })
    }

    /// Whether the failure means the queried object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResilienceError::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &str, name: impl Into<String>) -> Self {
        ResilienceError::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub(crate) fn bug(message: impl Into<String>) -> Self {
        ResilienceError::Bug {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = ResilienceError::Timeout {
            operation: "file_locations".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());

        let transient = ResilienceError::TransientAccess {
            reason: "pool offline".into(),
        };
        assert!(transient.is_retryable());

        let missing = ResilienceError::not_found("file", "0000A1");
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
        assert!(!ResilienceError::bug("mode none").is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = ResilienceError::not_found("pool", "pool-7");
        assert_eq!(err.to_string(), "pool not found: pool-7");

        let err = ResilienceError::Configuration {
            message: "minimum 3 exceeds 2 hosts".into(),
        };
        assert_eq!(err.to_string(), "configuration error: minimum 3 exceeds 2 hosts");
    }
}
