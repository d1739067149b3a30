//! Delivery records — the per-notification lifecycle.
//!
//! A record is created when a delivery request is issued and then driven
//! exclusively by transport callbacks and the retry policy:
//! scheduled → sent → delivered | read, or → failed once retries are
//! exhausted (or the failure is fatal).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use verdant_core::error::{Result, VerdantError};
use verdant_core::types::DeliveryEvent;

/// Lifecycle states of one notification instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Scheduled,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Scheduled => "scheduled",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
            DeliveryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(DeliveryState::Scheduled),
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            "failed" => Some(DeliveryState::Failed),
            _ => None,
        }
    }

    /// Delivered, Read, and Failed accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered | DeliveryState::Read | DeliveryState::Failed
        )
    }
}

/// Persisted lifecycle record of one notification instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub notification_id: String,
    pub task_id: String,
    pub status: DeliveryState,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(task_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            notification_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: DeliveryState::Scheduled,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transport callback. Transitions out of a terminal state,
    /// or backward (e.g. Read → Sent via a late Sent callback), are
    /// rejected; callers log and drop such events.
    pub fn apply(&mut self, event: &DeliveryEvent, timestamp: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(VerdantError::Validation(format!(
                "notification {}: event {:?} after terminal state {}",
                self.notification_id,
                event,
                self.status.as_str()
            )));
        }
        match event {
            DeliveryEvent::Sent => {
                if self.status != DeliveryState::Scheduled {
                    return Err(self.bad_transition("sent"));
                }
                self.status = DeliveryState::Sent;
                self.sent_at = Some(timestamp);
            }
            DeliveryEvent::Delivered => {
                // A fast transport may skip the Sent callback.
                if self.sent_at.is_none() {
                    self.sent_at = Some(timestamp);
                }
                self.status = DeliveryState::Delivered;
                self.delivered_at = Some(timestamp);
            }
            DeliveryEvent::Read => {
                if self.sent_at.is_none() {
                    self.sent_at = Some(timestamp);
                }
                if self.delivered_at.is_none() {
                    self.delivered_at = Some(timestamp);
                }
                self.status = DeliveryState::Read;
                self.read_at = Some(timestamp);
            }
            DeliveryEvent::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
            }
        }
        self.updated_at = timestamp;
        Ok(())
    }

    /// Terminal failure: retries exhausted or the reason was fatal.
    pub fn mark_failed(&mut self, reason: &str, timestamp: DateTime<Utc>) {
        self.status = DeliveryState::Failed;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = timestamp;
    }

    /// Back to Scheduled for a retry attempt.
    pub fn mark_retrying(&mut self, timestamp: DateTime<Utc>) {
        self.status = DeliveryState::Scheduled;
        self.retry_count += 1;
        self.updated_at = timestamp;
    }

    fn bad_transition(&self, event: &str) -> VerdantError {
        VerdantError::Validation(format!(
            "notification {}: illegal transition {} -> {}",
            self.notification_id,
            self.status.as_str(),
            event
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let now = Utc::now();
        let mut r = DeliveryRecord::new("task-1", now);
        assert_eq!(r.status, DeliveryState::Scheduled);

        r.apply(&DeliveryEvent::Sent, now).unwrap();
        assert_eq!(r.status, DeliveryState::Sent);
        assert!(r.sent_at.is_some());

        r.apply(&DeliveryEvent::Delivered, now).unwrap();
        r.apply(&DeliveryEvent::Read, now).unwrap();
        assert_eq!(r.status, DeliveryState::Read);
        assert!(r.status.is_terminal());
    }

    #[test]
    fn test_terminal_state_rejects_events() {
        let now = Utc::now();
        let mut r = DeliveryRecord::new("task-1", now);
        r.mark_failed("quota_exceeded", now);
        assert!(r.apply(&DeliveryEvent::Sent, now).is_err());
    }

    #[test]
    fn test_delivered_backfills_sent_at() {
        let now = Utc::now();
        let mut r = DeliveryRecord::new("task-1", now);
        r.apply(&DeliveryEvent::Delivered, now).unwrap();
        assert!(r.sent_at.is_some());
        assert_eq!(r.status, DeliveryState::Delivered);
    }

    #[test]
    fn test_retry_returns_to_scheduled() {
        let now = Utc::now();
        let mut r = DeliveryRecord::new("task-1", now);
        r.apply(&DeliveryEvent::Failed { reason: "network_error".into() }, now)
            .unwrap();
        assert_eq!(r.status, DeliveryState::Scheduled);
        r.mark_retrying(now);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.status, DeliveryState::Scheduled);
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            DeliveryState::Scheduled,
            DeliveryState::Sent,
            DeliveryState::Delivered,
            DeliveryState::Read,
            DeliveryState::Failed,
        ] {
            assert_eq!(DeliveryState::parse(s.as_str()), Some(s));
        }
    }
}
