//! SQLite-backed store for schedule entries and delivery records.
//! Survives restarts; settings live in typed columns, not JSON blobs,
//! and are validated on read.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use verdant_core::error::{Result, VerdantError};
use verdant_core::types::{TaskPriority, TaskType};

use crate::delivery::{DeliveryRecord, DeliveryState};
use crate::entry::{EntrySettings, ScheduleEntry};
use crate::store::NotificationStore;

/// Bundled SQLite implementation of [`NotificationStore`].
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| VerdantError::Persistence(format!("DB open: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Default path: ~/.verdant/scheduler/notifications.db
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".verdant").join("scheduler").join("notifications.db")
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            -- Recurrence state, one row per (plant, task-type)
            CREATE TABLE IF NOT EXISTS schedule_entries (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                plant_id TEXT NOT NULL,
                plant_name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                next_notification TEXT NOT NULL,
                interval_hours INTEGER NOT NULL,
                max_notifications INTEGER,
                sent_count INTEGER NOT NULL DEFAULT 0,
                sent_today INTEGER NOT NULL DEFAULT 0,
                last_sent_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                quiet_hours_start TEXT,
                quiet_hours_end TEXT,
                advance_notice_minutes INTEGER NOT NULL DEFAULT 0,
                max_daily_notifications INTEGER NOT NULL DEFAULT 10,
                priority TEXT NOT NULL DEFAULT 'medium',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_task ON schedule_entries(task_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_plant
                ON schedule_entries(plant_id, task_type);

            -- One row per notification instance
            CREATE TABLE IF NOT EXISTS delivery_records (
                notification_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                sent_at TEXT,
                delivered_at TEXT,
                read_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_task ON delivery_records(task_id);
            ",
        )
        .map_err(|e| VerdantError::Persistence(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoned only if a holder panicked; propagating the panic is fine.
        self.conn.lock().expect("scheduler db mutex poisoned")
    }

    fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleEntry> {
        let task_type_str: String = row.get(4)?;
        let priority_str: String = row.get(16)?;
        Ok(ScheduleEntry {
            id: row.get(0)?,
            task_id: row.get(1)?,
            plant_id: row.get(2)?,
            plant_name: row.get(3)?,
            // Validated on read: unknown values degrade, never panic.
            task_type: TaskType::parse(&task_type_str).unwrap_or(TaskType::Inspection),
            next_notification: parse_ts(&row.get::<_, String>(5)?),
            interval_hours: row.get(6)?,
            max_notifications: row.get(7)?,
            sent_count: row.get(8)?,
            sent_today: row.get(9)?,
            last_sent_at: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
            is_active: row.get::<_, i32>(11)? != 0,
            settings: EntrySettings {
                quiet_hours_start: row.get(12)?,
                quiet_hours_end: row.get(13)?,
                advance_notice_minutes: row.get(14)?,
                max_daily_notifications: row.get(15)?,
                priority: TaskPriority::parse(&priority_str).unwrap_or(TaskPriority::Medium),
            },
            created_at: parse_ts(&row.get::<_, String>(17)?),
            updated_at: parse_ts(&row.get::<_, String>(18)?),
        })
    }

    fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
        let status_str: String = row.get(2)?;
        Ok(DeliveryRecord {
            notification_id: row.get(0)?,
            task_id: row.get(1)?,
            status: DeliveryState::parse(&status_str).unwrap_or(DeliveryState::Scheduled),
            sent_at: row.get::<_, Option<String>>(3)?.map(|s| parse_ts(&s)),
            delivered_at: row.get::<_, Option<String>>(4)?.map(|s| parse_ts(&s)),
            read_at: row.get::<_, Option<String>>(5)?.map(|s| parse_ts(&s)),
            retry_count: row.get(6)?,
            failure_reason: row.get(7)?,
            created_at: parse_ts(&row.get::<_, String>(8)?),
            updated_at: parse_ts(&row.get::<_, String>(9)?),
        })
    }
}

const ENTRY_COLS: &str = "id, task_id, plant_id, plant_name, task_type, next_notification, \
     interval_hours, max_notifications, sent_count, sent_today, last_sent_at, is_active, \
     quiet_hours_start, quiet_hours_end, advance_notice_minutes, max_daily_notifications, \
     priority, created_at, updated_at";

const RECORD_COLS: &str = "notification_id, task_id, status, sent_at, delivered_at, read_at, \
     retry_count, failure_reason, created_at, updated_at";

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl NotificationStore for SchedulerDb {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        entry.validate()?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO schedule_entries (id, task_id, plant_id, plant_name,
                 task_type, next_notification, interval_hours, max_notifications, sent_count,
                 sent_today, last_sent_at, is_active, quiet_hours_start, quiet_hours_end,
                 advance_notice_minutes, max_daily_notifications, priority, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19)",
                rusqlite::params![
                    entry.id,
                    entry.task_id,
                    entry.plant_id,
                    entry.plant_name,
                    entry.task_type.as_str(),
                    entry.next_notification.to_rfc3339(),
                    entry.interval_hours,
                    entry.max_notifications,
                    entry.sent_count,
                    entry.sent_today,
                    entry.last_sent_at.map(|t| t.to_rfc3339()),
                    entry.is_active as i32,
                    entry.settings.quiet_hours_start,
                    entry.settings.quiet_hours_end,
                    entry.settings.advance_notice_minutes,
                    entry.settings.max_daily_notifications,
                    entry.settings.priority.as_str(),
                    entry.created_at.to_rfc3339(),
                    entry.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| VerdantError::Persistence(format!("Upsert entry: {e}")))?;
        Ok(())
    }

    async fn update_entry_if(
        &self,
        entry: &ScheduleEntry,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        entry.validate()?;
        let changed = self
            .lock()
            .execute(
                "UPDATE schedule_entries SET task_id = ?2, next_notification = ?3,
                 interval_hours = ?4, max_notifications = ?5, sent_count = ?6, sent_today = ?7,
                 last_sent_at = ?8, is_active = ?9, updated_at = ?10
                 WHERE id = ?1 AND updated_at = ?11",
                rusqlite::params![
                    entry.id,
                    entry.task_id,
                    entry.next_notification.to_rfc3339(),
                    entry.interval_hours,
                    entry.max_notifications,
                    entry.sent_count,
                    entry.sent_today,
                    entry.last_sent_at.map(|t| t.to_rfc3339()),
                    entry.is_active as i32,
                    entry.updated_at.to_rfc3339(),
                    expected_updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| VerdantError::Persistence(format!("Update entry: {e}")))?;
        Ok(changed == 1)
    }

    async fn entry_for_task(&self, task_id: &str) -> Result<Option<ScheduleEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLS} FROM schedule_entries WHERE task_id = ?1 AND is_active = 1"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Entry query: {e}")))?;
        let entry = stmt
            .query_row([task_id], Self::entry_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(VerdantError::Persistence(format!("Entry query: {other}"))),
            })?;
        Ok(entry)
    }

    async fn entry_for_plant(
        &self,
        plant_id: &str,
        task_type: TaskType,
    ) -> Result<Option<ScheduleEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLS} FROM schedule_entries
                 WHERE plant_id = ?1 AND task_type = ?2"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Entry query: {e}")))?;
        let entry = stmt
            .query_row(rusqlite::params![plant_id, task_type.as_str()], Self::entry_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(VerdantError::Persistence(format!("Entry query: {other}"))),
            })?;
        Ok(entry)
    }

    async fn active_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLS} FROM schedule_entries WHERE is_active = 1
                 ORDER BY next_notification"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Entries query: {e}")))?;
        let rows = stmt
            .query_map([], Self::entry_from_row)
            .map_err(|e| VerdantError::Persistence(format!("Entries query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn deactivate_entries_for_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE schedule_entries SET is_active = 0, updated_at = ?2 WHERE task_id = ?1",
                rusqlite::params![task_id, now.to_rfc3339()],
            )
            .map_err(|e| VerdantError::Persistence(format!("Deactivate entries: {e}")))?;
        Ok(())
    }

    async fn insert_record(&self, record: &DeliveryRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO delivery_records (notification_id, task_id, status,
                 sent_at, delivered_at, read_at, retry_count, failure_reason, created_at,
                 updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.notification_id,
                    record.task_id,
                    record.status.as_str(),
                    record.sent_at.map(|t| t.to_rfc3339()),
                    record.delivered_at.map(|t| t.to_rfc3339()),
                    record.read_at.map(|t| t.to_rfc3339()),
                    record.retry_count,
                    record.failure_reason,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| VerdantError::Persistence(format!("Insert record: {e}")))?;
        Ok(())
    }

    async fn update_record(&self, record: &DeliveryRecord) -> Result<()> {
        self.insert_record(record).await
    }

    async fn record(&self, notification_id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLS} FROM delivery_records WHERE notification_id = ?1"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Record query: {e}")))?;
        let record = stmt
            .query_row([notification_id], Self::record_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(VerdantError::Persistence(format!("Record query: {other}"))),
            })?;
        Ok(record)
    }

    async fn records_for_task(&self, task_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLS} FROM delivery_records WHERE task_id = ?1
                 ORDER BY created_at"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Records query: {e}")))?;
        let rows = stmt
            .query_map([task_id], Self::record_from_row)
            .map_err(|e| VerdantError::Persistence(format!("Records query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn delete_pending_records_for_task(&self, task_id: &str) -> Result<()> {
        self.lock()
            .execute(
                "DELETE FROM delivery_records WHERE task_id = ?1 AND status = 'scheduled'",
                [task_id],
            )
            .map_err(|e| VerdantError::Persistence(format!("Delete pending: {e}")))?;
        Ok(())
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLS} FROM delivery_records ORDER BY created_at DESC LIMIT ?1"
            ))
            .map_err(|e| VerdantError::Persistence(format!("Recent query: {e}")))?;
        let rows = stmt
            .query_map([limit as i64], Self::record_from_row)
            .map_err(|e| VerdantError::Persistence(format!("Recent query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
