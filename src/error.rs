//! Error types for netwatch.
//!
//! All errors are strongly typed using thiserror. This enables pattern
//! matching on specific error conditions and provides clear error messages.
//! Per the engine's propagation policy, only resource exhaustion and
//! malformed parameters ever surface to callers; ownership mismatches and
//! unknown request ids are silent no-ops handled inside the worker.

use thiserror::Error;

use crate::identity::Uid;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A zero-byte threshold can never be crossed.
    #[error("Threshold must be positive")]
    ZeroThreshold,

    /// Registrations are attributed to a package for diagnostics.
    #[error("Caller package name cannot be empty")]
    EmptyPackage,
}

/// Execution errors that occur during engine operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The caller is at its concurrent-registration cap.
    #[error("UID {uid} already holds the maximum of {max} concurrent requests")]
    QuotaExceeded {
        /// Caller that hit the cap.
        uid: Uid,
        /// The cap in force when the registration was rejected.
        max: usize,
    },

    /// The worker or a stream endpoint has shut down.
    #[error("Channel disconnected: {path}")]
    Disconnected {
        /// Which channel was found closed.
        path: String,
    },

    /// A bounded wait elapsed without a message.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// How long the caller waited.
        duration_ms: u64,
    },
}

/// Top-level error type for netwatch.
#[derive(Debug, Error)]
pub enum NetWatchError {
    /// Input validation failed before reaching the worker.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The engine rejected or failed the operation.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Invariant violation that should not occur in normal operation.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl NetWatchError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error signals the per-UID registration quota.
    #[must_use]
    pub const fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::QuotaExceeded { .. })
        )
    }

    /// Returns true if this error is retryable.
    ///
    /// Quota exhaustion is not retryable until the caller releases a
    /// request; a timed-out wait on the worker may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for netwatch operations.
pub type NetWatchResult<T> = Result<T, NetWatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_message_names_uid_and_cap() {
        let err = ExecutionError::QuotaExceeded {
            uid: Uid::new(10_001),
            max: 25,
        };
        let msg = format!("{err}");
        assert!(msg.contains("10001"));
        assert!(msg.contains("25"));
    }

    #[test]
    fn timeout_message_contains_duration() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        let msg = format!("{err}");
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn error_from_validation() {
        let err: NetWatchError = ValidationError::EmptyPackage.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn quota_is_not_retryable_but_timeout_is() {
        let quota: NetWatchError = ExecutionError::QuotaExceeded {
            uid: Uid::new(1),
            max: 25,
        }
        .into();
        assert!(quota.is_quota_exceeded());
        assert!(!quota.is_retryable());

        let timeout: NetWatchError = ExecutionError::Timeout { duration_ms: 100 }.into();
        assert!(timeout.is_retryable());
    }

    #[test]
    fn internal_error_carries_message() {
        let err = NetWatchError::internal("unexpected state");
        assert!(!err.is_retryable());
        let msg = format!("{err}");
        assert!(msg.contains("unexpected state"));
    }
}
