//! Verdant engine configuration.
//!
//! Typed configuration structs with explicit defaults — no JSON-blob
//! settings fields. Every knob documents its default next to the
//! `#[serde(default = "...")]` function that supplies it.

use serde::{Deserialize, Serialize};

/// Tunables for the notification engine. Constructed by the embedding
/// application; all fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sliding window for same-plant batching, minutes.
    #[serde(default = "default_batch_window_mins")]
    pub batch_window_mins: u32,
    /// Maximum members per composite batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Background overdue-sweep interval, seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Days overdue at which a task reaches 100% escalation pressure.
    /// Tunable, not a fixed contract.
    #[serde(default = "default_critical_horizon_days")]
    pub critical_horizon_days: f64,
    /// Maximum delivery retry attempts before a record goes Failed.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Bounded timeout applied to each store/transport call, seconds.
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    /// Maximum forward shift toward an active hour, hours.
    #[serde(default = "default_activity_tolerance_hours")]
    pub activity_tolerance_hours: u32,
    /// Activity-profile cache TTL, seconds (stale-while-revalidate).
    #[serde(default = "default_profile_cache_ttl_secs")]
    pub profile_cache_ttl_secs: u64,
    /// Local retries for store read/write failures before surfacing.
    #[serde(default = "default_persistence_retry_attempts")]
    pub persistence_retry_attempts: u32,
}

fn default_batch_window_mins() -> u32 { 60 }
fn default_max_batch_size() -> usize { 5 }
fn default_sweep_interval_secs() -> u64 { 300 }
fn default_critical_horizon_days() -> f64 { 3.0 }
fn default_max_retry_attempts() -> u32 { 5 }
fn default_op_timeout_secs() -> u64 { 10 }
fn default_activity_tolerance_hours() -> u32 { 3 }
fn default_profile_cache_ttl_secs() -> u64 { 600 }
fn default_persistence_retry_attempts() -> u32 { 3 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window_mins: default_batch_window_mins(),
            max_batch_size: default_max_batch_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            critical_horizon_days: default_critical_horizon_days(),
            max_retry_attempts: default_max_retry_attempts(),
            op_timeout_secs: default_op_timeout_secs(),
            activity_tolerance_hours: default_activity_tolerance_hours(),
            profile_cache_ttl_secs: default_profile_cache_ttl_secs(),
            persistence_retry_attempts: default_persistence_retry_attempts(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations that would stall or never fire.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.critical_horizon_days <= 0.0 {
            return Err(crate::error::VerdantError::Config(
                "critical_horizon_days must be positive".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(crate::error::VerdantError::Config(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(crate::error::VerdantError::Config(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-user notification preferences, read from the preference store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Quiet-hours window start, "HH:MM". None disables quiet hours.
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    /// Quiet-hours window end, "HH:MM".
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    #[serde(default = "default_true")]
    pub batching_enabled: bool,
    /// Overrides `EngineConfig::max_batch_size` when set.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    /// Notify this many minutes ahead of the due instant.
    #[serde(default)]
    pub reminder_advance_minutes: u32,
}

fn default_true() -> bool { true }

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            quiet_hours_start: None,
            quiet_hours_end: None,
            batching_enabled: default_true(),
            max_batch_size: None,
            reminder_advance_minutes: 0,
        }
    }
}
