//! Collaborator traits — the seams between the engine and the outside.
//!
//! The engine is constructed with `Arc<dyn ...>` implementations of these;
//! production wiring and tests supply different ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::UserPreferences;
use crate::error::Result;
use crate::types::{DeliveryHandle, NotificationContent, UserActivityProfile};

/// Injectable time source. Tests pin this to fixed instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The OS-level push/local-notification transport boundary. The engine
/// only requests "deliver this content at this time" and later receives
/// delivery/failure callbacks — it never implements the transport.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Request delivery of `content` at `when`. Returns an opaque handle
    /// usable for cancellation.
    async fn request_delivery(
        &self,
        content: &NotificationContent,
        when: DateTime<Utc>,
    ) -> Result<DeliveryHandle>;

    /// Void a previously issued delivery request. Unknown handles are a
    /// no-op, not an error.
    async fn cancel_delivery(&self, handle: &DeliveryHandle) -> Result<()>;
}

/// Read access to user notification preferences and activity profiles.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn preferences(&self, user_id: &str) -> Result<UserPreferences>;

    async fn activity_profile(&self, user_id: &str) -> Result<UserActivityProfile>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
