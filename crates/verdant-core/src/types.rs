//! Shared data types — the transient inputs and wire shapes of the engine.
//!
//! Everything here is read by the engine but owned elsewhere: task data
//! comes from the task store, activity profiles from the preference store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VerdantError};

/// Care task categories tracked by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Watering,
    Feeding,
    Inspection,
    Pruning,
    Harvest,
    Transplant,
    Training,
    Defoliation,
    Flushing,
}

impl TaskType {
    /// Stable string form used in storage and notification payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Watering => "watering",
            TaskType::Feeding => "feeding",
            TaskType::Inspection => "inspection",
            TaskType::Pruning => "pruning",
            TaskType::Harvest => "harvest",
            TaskType::Transplant => "transplant",
            TaskType::Training => "training",
            TaskType::Defoliation => "defoliation",
            TaskType::Flushing => "flushing",
        }
    }

    /// Parse the stable string form back into a task type.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "watering" => Some(TaskType::Watering),
            "feeding" => Some(TaskType::Feeding),
            "inspection" => Some(TaskType::Inspection),
            "pruning" => Some(TaskType::Pruning),
            "harvest" => Some(TaskType::Harvest),
            "transplant" => Some(TaskType::Transplant),
            "training" => Some(TaskType::Training),
            "defoliation" => Some(TaskType::Defoliation),
            "flushing" => Some(TaskType::Flushing),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task priority, also used as notification priority on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "critical" => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scheduling request, built by task-management code from a task.
///
/// Immutable once submitted; a new config with the same `task_id`
/// supersedes the prior one (reschedule semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotificationConfig {
    pub task_id: String,
    pub plant_id: String,
    pub plant_name: String,
    pub task_type: TaskType,
    pub task_title: String,
    pub due_date: DateTime<Utc>,
    pub priority: TaskPriority,
    /// Estimated duration of the task itself, in minutes.
    pub estimated_duration_mins: u32,
    pub is_recurring: bool,
}

impl TaskNotificationConfig {
    /// Validate the config before it enters the scheduling pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(VerdantError::Validation("missing task id".into()));
        }
        if self.plant_id.trim().is_empty() {
            return Err(VerdantError::Validation(format!(
                "task '{}': missing plant id",
                self.task_id
            )));
        }
        if self.estimated_duration_mins == 0 {
            return Err(VerdantError::Validation(format!(
                "task '{}': estimated duration must be positive",
                self.task_id
            )));
        }
        Ok(())
    }
}

/// Per-user historical activity pattern. Read-only input — the engine
/// never mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserActivityProfile {
    /// Hours of the day (0-23) the user is most engaged with the app.
    pub most_active_hours: Vec<u32>,
    /// IANA timezone name, e.g. "Europe/Berlin".
    pub timezone: String,
    /// Whether the user prefers weekday notifications.
    pub weekday_preference: bool,
}

/// Content handed to the notification transport for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    /// Transport-level grouping category (e.g. "overdue_tasks").
    pub category_id: Option<String>,
    pub priority: TaskPriority,
    /// Tasks covered by this notification (>1 for a composite batch).
    pub task_ids: Vec<String>,
}

/// Opaque delivery handle issued by the transport. The engine only stores
/// and echoes it; the transport owns its meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryHandle(pub String);

impl std::fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound transport callback payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum DeliveryEvent {
    Sent,
    Delivered,
    Read,
    Failed { reason: String },
}
