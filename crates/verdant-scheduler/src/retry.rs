//! Retry policy — classifies delivery failures and paces retries with
//! exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery failure taxonomy. Transient transport conditions retry;
/// authorization-shaped failures do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NetworkError,
    DeviceOffline,
    PermissionDenied,
    QuotaExceeded,
    /// Anything the transport reports that isn't in the taxonomy.
    /// Treated as retryable — dropping a notification on an unknown
    /// reason is worse than one extra attempt.
    Other(String),
}

impl FailureReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "network_error" => FailureReason::NetworkError,
            "device_offline" => FailureReason::DeviceOffline,
            "permission_denied" => FailureReason::PermissionDenied,
            "quota_exceeded" => FailureReason::QuotaExceeded,
            other => FailureReason::Other(other.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::NetworkError | FailureReason::DeviceOffline => true,
            FailureReason::PermissionDenied | FailureReason::QuotaExceeded => false,
            FailureReason::Other(_) => true,
        }
    }
}

/// Exponential backoff with a hard attempt cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before giving up. Default 5: delays 1, 2, 4, 8, 16 s.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Whether a failure reported as `reason` is worth retrying at all.
    pub fn classify(reason: &str) -> bool {
        FailureReason::parse(reason).is_retryable()
    }

    /// Delay before retry number `attempt` (0-based): 2^attempt seconds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(1u64 << attempt.min(63))
    }

    /// The full retry decision: Some(delay) to try again after the
    /// delay, None to mark the delivery failed for good.
    pub fn next_delay(&self, reason: &str, attempts_so_far: u32) -> Option<Duration> {
        if !Self::classify(reason) {
            return None;
        }
        if attempts_so_far >= self.max_attempts {
            return None;
        }
        Some(self.backoff_delay(attempts_so_far))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (0..5).map(|a| p.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_taxonomy() {
        assert!(RetryPolicy::classify("network_error"));
        assert!(RetryPolicy::classify("device_offline"));
        assert!(!RetryPolicy::classify("permission_denied"));
        assert!(!RetryPolicy::classify("quota_exceeded"));
    }

    #[test]
    fn test_unknown_reason_retries() {
        assert!(RetryPolicy::classify("carrier_pigeon_lost"));
        assert_eq!(
            FailureReason::parse("carrier_pigeon_lost"),
            FailureReason::Other("carrier_pigeon_lost".into())
        );
    }

    #[test]
    fn test_fatal_reason_never_delays() {
        let p = RetryPolicy::default();
        assert_eq!(p.next_delay("permission_denied", 0), None);
    }

    #[test]
    fn test_cap_exhausts_retries() {
        let p = RetryPolicy::default();
        assert!(p.next_delay("network_error", 4).is_some());
        assert_eq!(p.next_delay("network_error", 5), None);
    }
}
