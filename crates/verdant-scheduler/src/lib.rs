//! # Verdant Scheduler
//!
//! Task notification scheduling engine for the Verdant plant-care
//! tracker: decides when, whether, and how to notify the user about
//! care tasks without becoming noisy or losing anything.
//!
//! ## Architecture
//! ```text
//! NotificationEngine (per-task keyed locks + tokio sweep loop)
//!   ├── quiet_hours: defer out of the do-not-disturb window
//!   ├── activity:    shift toward the user's most active hours
//!   ├── batch:       merge same-plant tasks within a sliding window
//!   ├── escalation:  grade overdue pressure, issue urgent notices
//!   ├── retry:       classify failures, exponential backoff
//!   ├── store:       ScheduleEntry + DeliveryRecord persistence
//!   │     └── persistence: bundled SQLite implementation
//!   └── transport:   delivery requests out, status callbacks in
//! ```
//!
//! The engine owns its state and is constructed with injected
//! collaborators (store, transport, preference store, clock); the
//! embedding application wires those up and drives the public surface:
//! schedule / schedule_multiple / cancel / reschedule / process_overdue
//! / optimize_timing / stats.

pub mod activity;
pub mod batch;
pub mod delivery;
pub mod engine;
pub mod entry;
pub mod escalation;
pub mod persistence;
pub mod quiet_hours;
pub mod retry;
pub mod store;
pub mod transport;

pub use activity::{ProfileCache, TimingOptimizer};
pub use batch::{Batch, PendingConfig, assemble};
pub use delivery::{DeliveryRecord, DeliveryState};
pub use engine::{
    BatchOutcome, EngineStats, NotificationEngine, SchedulingFailure, spawn_engine,
};
pub use entry::{EntrySettings, EntrySettingsUpdate, ScheduleEntry};
pub use escalation::{EscalationMonitor, EscalationResult, OverdueSeverity};
pub use persistence::SchedulerDb;
pub use retry::{FailureReason, RetryPolicy};
pub use store::NotificationStore;
pub use transport::{MemoryTransport, WebhookTransport};
