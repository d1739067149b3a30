//! Verdant error types.

use thiserror::Error;

/// Convenience result alias used across all Verdant crates.
pub type Result<T> = std::result::Result<T, VerdantError>;

/// Errors surfaced by the notification engine and its collaborators.
#[derive(Debug, Error)]
pub enum VerdantError {
    /// Malformed input (missing task id, non-positive duration, ...).
    /// Returned synchronously to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation on an unknown task/entry id. Surfaced immediately.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store read/write failure. Retried locally before surfacing.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Delivery transport failure. `retryable` follows the failure
    /// taxonomy: network_error/device_offline retry, permission_denied/
    /// quota_exceeded do not.
    #[error("Transport error: {reason} (retryable: {retryable})")]
    Transport { reason: String, retryable: bool },

    /// Invalid engine configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A store or transport call exceeded the bounded operation timeout.
    /// Treated as a retryable failure by callers.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerdantError {
    /// Transport error helper for the retryable class.
    pub fn transport_retryable(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into(), retryable: true }
    }

    /// Transport error helper for the fatal class.
    pub fn transport_fatal(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into(), retryable: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_helpers() {
        let e = VerdantError::transport_retryable("network_error");
        assert!(matches!(e, VerdantError::Transport { retryable: true, .. }));

        let e = VerdantError::transport_fatal("permission_denied");
        assert!(matches!(e, VerdantError::Transport { retryable: false, .. }));
    }

    #[test]
    fn test_display_includes_reason() {
        let e = VerdantError::Validation("missing task id".into());
        assert!(e.to_string().contains("missing task id"));
    }
}
