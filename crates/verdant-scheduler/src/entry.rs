//! Schedule entries — persisted recurrence state, one per (plant, task-type).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use verdant_core::error::{Result, VerdantError};
use verdant_core::types::{TaskNotificationConfig, TaskPriority, TaskType};

/// Upper bound on the recurrence interval (one year in hours).
pub const MAX_INTERVAL_HOURS: u32 = 8760;

/// Typed per-entry settings. Stored as individual columns, never a JSON
/// blob; quiet-hours strings are validated by the gate on use (malformed
/// values disable quiet hours rather than failing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySettings {
    /// Quiet-hours window start, "HH:MM". None disables quiet hours.
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    /// Quiet-hours window end, "HH:MM".
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    /// Notify this many minutes before the due instant.
    #[serde(default)]
    pub advance_notice_minutes: u32,
    #[serde(default = "default_max_daily")]
    pub max_daily_notifications: u32,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
}

fn default_max_daily() -> u32 { 10 }
fn default_priority() -> TaskPriority { TaskPriority::Medium }

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            quiet_hours_start: None,
            quiet_hours_end: None,
            advance_notice_minutes: 0,
            max_daily_notifications: default_max_daily(),
            priority: default_priority(),
        }
    }
}

/// Partial settings update. `None` means "no change"; a set field wins
/// over the current value. Quiet hours can be disabled by setting an
/// empty string (the gate treats it as malformed and fails open).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntrySettingsUpdate {
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub advance_notice_minutes: Option<u32>,
    pub max_daily_notifications: Option<u32>,
    pub priority: Option<TaskPriority>,
}

impl EntrySettings {
    /// Apply an update with field-level precedence: new value wins,
    /// `None` leaves the current value untouched.
    pub fn merged(&self, update: &EntrySettingsUpdate) -> EntrySettings {
        EntrySettings {
            quiet_hours_start: update
                .quiet_hours_start
                .clone()
                .or_else(|| self.quiet_hours_start.clone()),
            quiet_hours_end: update
                .quiet_hours_end
                .clone()
                .or_else(|| self.quiet_hours_end.clone()),
            advance_notice_minutes: update
                .advance_notice_minutes
                .unwrap_or(self.advance_notice_minutes),
            max_daily_notifications: update
                .max_daily_notifications
                .unwrap_or(self.max_daily_notifications),
            priority: update.priority.unwrap_or(self.priority),
        }
    }
}

/// Persisted recurrence state for one (plant, task-type) pair.
///
/// Created when a recurring task is first scheduled, mutated on each
/// send, and soft-deleted (`is_active = false`) when the owning task is
/// removed — never hard-deleted immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    /// Owning task. A reschedule may repoint this at a superseding task.
    pub task_id: String,
    pub plant_id: String,
    pub plant_name: String,
    pub task_type: TaskType,
    /// Next scheduled notification instant. Only ever moves forward.
    pub next_notification: DateTime<Utc>,
    /// Recurrence interval in hours, 1..=8760.
    pub interval_hours: u32,
    /// Optional lifetime cap on notifications for this entry.
    pub max_notifications: Option<u32>,
    pub sent_count: u32,
    /// Sends on the calendar day of `last_sent_at`.
    pub sent_today: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub settings: EntrySettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default recurrence interval per task type, used when a recurring task
/// is first scheduled. The task store owns the real recurrence rule; this
/// is the engine-side cadence until the next schedule call refreshes it.
pub fn default_interval_hours(task_type: TaskType) -> u32 {
    match task_type {
        TaskType::Watering => 24,
        TaskType::Feeding => 72,
        TaskType::Inspection => 168,
        TaskType::Pruning => 336,
        TaskType::Training => 168,
        TaskType::Defoliation => 336,
        TaskType::Flushing => 24,
        // One-shot in practice; a conservative weekly cadence if recurring.
        TaskType::Harvest | TaskType::Transplant => 168,
    }
}

impl ScheduleEntry {
    /// Build a fresh entry from a scheduling request.
    pub fn from_config(
        config: &TaskNotificationConfig,
        first_notification: DateTime<Utc>,
        settings: EntrySettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: config.task_id.clone(),
            plant_id: config.plant_id.clone(),
            plant_name: config.plant_name.clone(),
            task_type: config.task_type,
            next_notification: first_notification,
            interval_hours: default_interval_hours(config.task_type),
            max_notifications: None,
            sent_count: 0,
            sent_today: 0,
            last_sent_at: None,
            is_active: true,
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    /// Interval bounds check, enforced before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.interval_hours == 0 || self.interval_hours > MAX_INTERVAL_HOURS {
            return Err(VerdantError::Validation(format!(
                "entry {}: interval_hours {} outside 1..={}",
                self.id, self.interval_hours, MAX_INTERVAL_HOURS
            )));
        }
        Ok(())
    }

    /// Whether the next notification instant has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_notification <= now
    }

    fn under_lifetime_cap(&self) -> bool {
        match self.max_notifications {
            Some(cap) => self.sent_count < cap,
            None => true,
        }
    }

    fn under_daily_cap(&self, now: DateTime<Utc>) -> bool {
        match self.last_sent_at {
            Some(last) if last.date_naive() == now.date_naive() => {
                self.sent_today < self.settings.max_daily_notifications
            }
            _ => true,
        }
    }

    /// Whether a notification should actually go out now. Due-ness alone
    /// is not enough: the entry must be active and under both caps.
    pub fn should_send(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.under_lifetime_cap() && self.under_daily_cap(now)
    }

    /// Whether any future occurrence may still be queued.
    pub fn can_send_more(&self) -> bool {
        self.is_active && self.under_lifetime_cap()
    }

    /// Record a send: bump counters and advance `next_notification` by
    /// the interval, catching up past `now` if sends were missed. The
    /// instant never moves backward.
    pub fn record_send(&mut self, now: DateTime<Utc>) {
        self.sent_count += 1;
        self.sent_today = match self.last_sent_at {
            Some(last) if last.date_naive() == now.date_naive() => self.sent_today + 1,
            _ => 1,
        };
        self.last_sent_at = Some(now);

        let step = Duration::hours(self.interval_hours as i64);
        let mut next = self.next_notification + step;
        while next <= now {
            next += step;
        }
        self.next_notification = next;
        self.updated_at = now;
    }

    /// Soft delete. The row stays for history; sweeps skip it.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }
}
