//! Overdue escalation — finds tasks past their due date, grades how far
//! gone they are, and builds the high-priority notifications for them.
//!
//! Severity is a pressure percentage over a configurable critical
//! horizon: a task `h` days overdue with horizon `H` sits at
//! `min(h / H, 1) * 100`. Thresholds read top-down, first match wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use verdant_core::types::{NotificationContent, TaskPriority, TaskType};

/// Category id stamped on every escalated notification.
pub const OVERDUE_CATEGORY: &str = "overdue_tasks";

/// How far past due a task is, graded against the critical horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdueSeverity {
    /// Past due but under the escalation floor; stays simply "due".
    None,
    Moderate,
    High,
    Critical,
}

impl OverdueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverdueSeverity::None => "none",
            OverdueSeverity::Moderate => "moderate",
            OverdueSeverity::High => "high",
            OverdueSeverity::Critical => "critical",
        }
    }

    /// Transport priority for an escalated notification.
    pub fn priority(&self) -> TaskPriority {
        match self {
            OverdueSeverity::Critical => TaskPriority::Critical,
            OverdueSeverity::High => TaskPriority::High,
            OverdueSeverity::Moderate => TaskPriority::Medium,
            OverdueSeverity::None => TaskPriority::Low,
        }
    }
}

/// One overdue finding from a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationResult {
    pub task_id: String,
    pub plant_id: String,
    pub severity: OverdueSeverity,
    /// Whole days past due (floor).
    pub days_overdue: i64,
    pub overdue_ratio: f64,
    pub content: NotificationContent,
}

/// Severity grader. Holds only the horizon; the sweep itself lives in
/// the engine, which owns the stores and locks.
#[derive(Debug, Clone, Copy)]
pub struct EscalationMonitor {
    /// Days overdue at which pressure saturates at 100.
    pub critical_horizon_days: f64,
}

impl Default for EscalationMonitor {
    fn default() -> Self {
        Self { critical_horizon_days: 3.0 }
    }
}

impl EscalationMonitor {
    pub fn new(critical_horizon_days: f64) -> Self {
        Self { critical_horizon_days }
    }

    /// Pressure percentage in [0, 100]. Zero when not overdue.
    pub fn overdue_ratio(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        if due >= now {
            return 0.0;
        }
        let days_overdue = (now - due).num_seconds() as f64 / 86_400.0;
        (days_overdue / self.critical_horizon_days).min(1.0) * 100.0
    }

    /// Threshold table, read top-down, first match wins.
    pub fn classify(ratio: f64) -> OverdueSeverity {
        if ratio > 90.0 {
            OverdueSeverity::Critical
        } else if ratio > 80.0 {
            OverdueSeverity::High
        } else if ratio > 70.0 {
            OverdueSeverity::Moderate
        } else {
            OverdueSeverity::None
        }
    }

    /// Grade one task. Returns None when the task is not overdue or its
    /// pressure is under the escalation floor.
    pub fn evaluate(
        &self,
        task_id: &str,
        plant_id: &str,
        plant_name: &str,
        task_type: TaskType,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<EscalationResult> {
        if due >= now {
            return None;
        }
        let ratio = self.overdue_ratio(due, now);
        let severity = Self::classify(ratio);
        if severity == OverdueSeverity::None {
            return None;
        }
        let days_overdue = (now - due).num_days();

        let content = NotificationContent {
            title: format!("🚨 Overdue: {} for {}", task_type, plant_name),
            body: format!(
                "{} for {} is {} days overdue",
                task_type, plant_name, days_overdue
            ),
            category_id: Some(OVERDUE_CATEGORY.to_string()),
            priority: severity.priority(),
            task_ids: vec![task_id.to_string()],
        };

        Some(EscalationResult {
            task_id: task_id.to_string(),
            plant_id: plant_id.to_string(),
            severity,
            days_overdue,
            overdue_ratio: ratio,
            content,
        })
    }
}
