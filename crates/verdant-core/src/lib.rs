//! # Verdant Core
//!
//! Shared foundation for the Verdant plant-care notification engine:
//! configuration, error types, transient data types, and the traits that
//! bound the engine's external collaborators (transport, preferences,
//! clock).
//!
//! The engine itself lives in `verdant-scheduler`; this crate carries no
//! scheduling logic.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{EngineConfig, UserPreferences};
pub use error::{Result, VerdantError};
pub use traits::{Clock, NotificationTransport, PreferenceStore, SystemClock};
pub use types::{
    DeliveryEvent, DeliveryHandle, NotificationContent, TaskNotificationConfig, TaskPriority,
    TaskType, UserActivityProfile,
};
