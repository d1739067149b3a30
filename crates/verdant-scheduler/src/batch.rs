//! Batch assembly — merges same-plant notifications that land close
//! together into one composite notification.
//!
//! Pure and side-effect free: batches exist only at the moment of
//! delivery request and are fully derived from the pending configs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use verdant_core::types::{NotificationContent, TaskNotificationConfig, TaskPriority};

/// A scheduling request paired with its candidate delivery instant
/// (after quiet-hours and activity adjustment).
#[derive(Debug, Clone)]
pub struct PendingConfig {
    pub config: TaskNotificationConfig,
    pub deliver_at: DateTime<Utc>,
}

/// Ephemeral per-plant grouping, materialized only for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub plant_id: String,
    pub plant_name: String,
    pub task_ids: Vec<String>,
    pub title: String,
    pub body: String,
    /// The first member's instant; the whole batch delivers here.
    pub deliver_at: DateTime<Utc>,
    /// Highest member priority.
    pub priority: TaskPriority,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Content handed to the transport for this batch.
    pub fn content(&self) -> NotificationContent {
        NotificationContent {
            title: self.title.clone(),
            body: self.body.clone(),
            category_id: None,
            priority: self.priority,
            task_ids: self.task_ids.clone(),
        }
    }
}

/// Group pending configs into batches: by plant, sorted by delivery
/// instant, greedily accumulated while each member lands within
/// `window` of the batch's first member and the batch stays under
/// `max_batch_size`. With batching disabled every config is its own
/// batch of one.
pub fn assemble(
    pending: &[PendingConfig],
    window: Duration,
    max_batch_size: usize,
    batching_enabled: bool,
) -> Vec<Batch> {
    if !batching_enabled {
        return pending.iter().map(|p| single(p)).collect();
    }

    // BTreeMap keeps output order deterministic across runs.
    let mut by_plant: BTreeMap<&str, Vec<&PendingConfig>> = BTreeMap::new();
    for p in pending {
        by_plant.entry(p.config.plant_id.as_str()).or_default().push(p);
    }

    let mut batches = Vec::new();
    for (_, mut group) in by_plant {
        group.sort_by_key(|p| p.deliver_at);

        let mut members: Vec<&PendingConfig> = Vec::new();
        for p in group {
            let fits = match members.first() {
                Some(first) => {
                    p.deliver_at - first.deliver_at <= window && members.len() < max_batch_size
                }
                None => true,
            };
            if fits {
                members.push(p);
            } else {
                batches.push(close(&members));
                members = vec![p];
            }
        }
        if !members.is_empty() {
            batches.push(close(&members));
        }
    }
    batches
}

/// A batch of one, delivered as a plain single-task notification.
pub fn single(p: &PendingConfig) -> Batch {
    Batch {
        plant_id: p.config.plant_id.clone(),
        plant_name: p.config.plant_name.clone(),
        task_ids: vec![p.config.task_id.clone()],
        title: p.config.task_title.clone(),
        body: format!("{} — {}", p.config.plant_name, p.config.task_type),
        deliver_at: p.deliver_at,
        priority: p.config.priority,
    }
}

fn close(members: &[&PendingConfig]) -> Batch {
    if members.len() == 1 {
        return single(members[0]);
    }
    let first = members[0];
    let priority = members
        .iter()
        .map(|p| p.config.priority)
        .max()
        .unwrap_or(first.config.priority);
    Batch {
        plant_id: first.config.plant_id.clone(),
        plant_name: first.config.plant_name.clone(),
        task_ids: members.iter().map(|p| p.config.task_id.clone()).collect(),
        title: format!("Care tasks: {}", first.config.plant_name),
        body: format!(
            "You have {} tasks for {}",
            members.len(),
            first.config.plant_name
        ),
        deliver_at: first.deliver_at,
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use verdant_core::types::TaskType;

    fn pending(task_id: &str, plant: &str, minutes: i64) -> PendingConfig {
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        let deliver_at = base + Duration::minutes(minutes);
        PendingConfig {
            config: TaskNotificationConfig {
                task_id: task_id.into(),
                plant_id: plant.into(),
                plant_name: plant.into(),
                task_type: TaskType::Watering,
                task_title: format!("Water {plant}"),
                due_date: deliver_at,
                priority: TaskPriority::Medium,
                estimated_duration_mins: 5,
                is_recurring: false,
            },
            deliver_at,
        }
    }

    fn window() -> Duration {
        Duration::minutes(60)
    }

    #[test]
    fn test_same_plant_within_window_merges() {
        let pending = vec![
            pending("t1", "Blue Dream #1", 0),
            pending("t2", "Blue Dream #1", 30),
        ];
        let batches = assemble(&pending, window(), 5, true);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].body.contains("2 tasks for Blue Dream #1"));
    }

    #[test]
    fn test_window_measured_from_first_member() {
        // 0, 50, 110: the third is 110 from the first — outside the
        // window even though only 60 from the second.
        let pending = vec![
            pending("t1", "p", 0),
            pending("t2", "p", 50),
            pending("t3", "p", 110),
        ];
        let batches = assemble(&pending, window(), 5, true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_size_cap_closes_batch() {
        let pending: Vec<_> = (0..7).map(|i| pending(&format!("t{i}"), "p", i)).collect();
        let batches = assemble(&pending, window(), 5, true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[1].len(), 2);
    }

    #[test]
    fn test_different_plants_never_merge() {
        let pending = vec![pending("t1", "a", 0), pending("t2", "b", 0)];
        let batches = assemble(&pending, window(), 5, true);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_batching_disabled_yields_singles() {
        let pending = vec![pending("t1", "p", 0), pending("t2", "p", 1)];
        let batches = assemble(&pending, window(), 5, false);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn test_single_batch_uses_task_title() {
        let batches = assemble(&[pending("t1", "p", 0)], window(), 5, true);
        assert_eq!(batches[0].title, "Water p");
    }

    #[test]
    fn test_composite_priority_is_max() {
        let mut a = pending("t1", "p", 0);
        a.config.priority = TaskPriority::Low;
        let mut b = pending("t2", "p", 10);
        b.config.priority = TaskPriority::Critical;
        let batches = assemble(&[a, b], window(), 5, true);
        assert_eq!(batches[0].priority, TaskPriority::Critical);
    }

    #[test]
    fn test_reassembly_of_closed_singles_is_idempotent() {
        // Singles produced by a run were separated by window violations;
        // re-running on their delivery instants must not merge them.
        let input = vec![
            pending("t1", "p", 0),
            pending("t2", "p", 70),
            pending("t3", "p", 140),
        ];
        let first = assemble(&input, window(), 5, true);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|b| b.len() == 1));

        let reinput: Vec<_> = first
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let mut p = pending(&format!("t{}", i + 1), "p", 0);
                p.deliver_at = b.deliver_at;
                p.config.due_date = b.deliver_at;
                p
            })
            .collect();
        let second = assemble(&reinput, window(), 5, true);
        assert_eq!(second.len(), first.len());
        assert!(second.iter().all(|b| b.len() == 1));
    }
}
