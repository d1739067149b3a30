//! Persistence boundary for engine-owned state.
//!
//! The engine owns `ScheduleEntry` and `DeliveryRecord` and talks to
//! whatever store the embedding application wires in through this
//! trait. `SchedulerDb` in `persistence` is the bundled SQLite
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use verdant_core::error::Result;
use verdant_core::types::TaskType;

use crate::delivery::DeliveryRecord;
use crate::entry::ScheduleEntry;

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert or replace a schedule entry.
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Conditional update: applies only when the stored row still
    /// carries `expected_updated_at`. Returns false on a lost race so
    /// the caller can reload and retry.
    async fn update_entry_if(
        &self,
        entry: &ScheduleEntry,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn entry_for_task(&self, task_id: &str) -> Result<Option<ScheduleEntry>>;

    async fn entry_for_plant(
        &self,
        plant_id: &str,
        task_type: TaskType,
    ) -> Result<Option<ScheduleEntry>>;

    async fn active_entries(&self) -> Result<Vec<ScheduleEntry>>;

    /// Soft-delete all entries owned by a task.
    async fn deactivate_entries_for_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn insert_record(&self, record: &DeliveryRecord) -> Result<()>;

    async fn update_record(&self, record: &DeliveryRecord) -> Result<()>;

    async fn record(&self, notification_id: &str) -> Result<Option<DeliveryRecord>>;

    async fn records_for_task(&self, task_id: &str) -> Result<Vec<DeliveryRecord>>;

    /// Drop a task's still-Scheduled records (cancel semantics).
    /// Terminal records stay for history.
    async fn delete_pending_records_for_task(&self, task_id: &str) -> Result<()>;

    /// Most recent records first, for stats and debugging surfaces.
    async fn recent_records(&self, limit: usize) -> Result<Vec<DeliveryRecord>>;
}
