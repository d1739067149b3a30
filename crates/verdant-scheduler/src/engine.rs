//! The notification engine — public surface of the scheduler.
//!
//! ## Architecture
//! ```text
//! NotificationEngine
//!   ├── schedule / cancel / reschedule  (serialized per task id)
//!   │     └── quiet-hours gate → activity shift → re-gate → batch
//!   │           → DeliveryRecord + ScheduleEntry → transport request
//!   ├── background sweep (tokio interval + watch shutdown)
//!   │     └── process_overdue → severity grade → escalation delivery
//!   └── on_delivery_event (transport callbacks)
//!         └── record transitions, recurrence advance, retry backoff
//! ```
//!
//! Operations on the same task id apply in caller order behind a keyed
//! lock; different tasks proceed concurrently. Every store/transport
//! call runs under a bounded timeout. The engine is a cheap-to-clone
//! handle over shared state, so retry tasks can be spawned freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use verdant_core::config::{EngineConfig, UserPreferences};
use verdant_core::error::{Result, VerdantError};
use verdant_core::traits::{Clock, NotificationTransport, PreferenceStore};
use verdant_core::types::{
    DeliveryEvent, DeliveryHandle, NotificationContent, TaskNotificationConfig,
};

use crate::activity::{ProfileCache, TimingOptimizer};
use crate::batch::{self, PendingConfig};
use crate::delivery::{DeliveryRecord, DeliveryState};
use crate::entry::{EntrySettings, ScheduleEntry};
use crate::escalation::{EscalationMonitor, EscalationResult, OverdueSeverity};
use crate::quiet_hours;
use crate::retry::RetryPolicy;
use crate::store::NotificationStore;

/// Aggregate engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// In-flight delivery requests (composites count once).
    pub active_batches: usize,
    /// Escalation notifications issued since construction.
    pub overdue_escalations: u64,
    /// Activity profiles currently cached.
    pub cached_user_patterns: usize,
    /// Deliveries that exhausted retries or failed fatally.
    pub failed_deliveries: u64,
}

/// Outcome of `schedule_multiple`. Per-config failures are collected
/// here, never thrown — one bad config does not block the rest.
#[derive(Debug)]
pub struct BatchOutcome {
    pub scheduled: usize,
    pub batches: usize,
    pub failures: Vec<SchedulingFailure>,
}

#[derive(Debug)]
pub struct SchedulingFailure {
    pub task_id: String,
    pub error: VerdantError,
}

/// One task's share of an in-flight delivery request.
#[derive(Clone)]
struct Member {
    task_id: String,
    notification_id: String,
    config: TaskNotificationConfig,
}

/// In-flight state per task: the current transport handle plus the
/// config that produced it (kept for merging, sweeps, and recurrence).
#[derive(Clone)]
struct PendingDelivery {
    handle: DeliveryHandle,
    notification_id: String,
    config: TaskNotificationConfig,
    deliver_at: DateTime<Utc>,
}

/// In-flight state per transport handle. `track_tasks` is false for
/// escalation deliveries, which never occupy a task's pending slot.
#[derive(Clone)]
struct HandleEntry {
    members: Vec<Member>,
    content: NotificationContent,
    deliver_at: DateTime<Utc>,
    track_tasks: bool,
}

#[derive(Default)]
struct InFlight {
    by_task: HashMap<String, PendingDelivery>,
    by_handle: HashMap<String, HandleEntry>,
}

struct EngineInner {
    config: EngineConfig,
    user_id: String,
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn NotificationTransport>,
    preferences: Arc<dyn PreferenceStore>,
    clock: Arc<dyn Clock>,
    optimizer: TimingOptimizer,
    monitor: EscalationMonitor,
    retry: RetryPolicy,
    profiles: ProfileCache,
    /// Keyed locks serializing operations per task id.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: Mutex<InFlight>,
    /// Highest severity already escalated per task; re-notify only on
    /// an increase, so the 5-minute sweep does not spam.
    escalated: Mutex<HashMap<String, OverdueSeverity>>,
    overdue_escalations: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// The scheduling engine. Constructed with injected collaborators and
/// owning all of its state — no globals, no ambient caches. Clones
/// share the same engine.
#[derive(Clone)]
pub struct NotificationEngine {
    inner: Arc<EngineInner>,
}

impl NotificationEngine {
    pub fn new(
        config: EngineConfig,
        user_id: &str,
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn NotificationTransport>,
        preferences: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                optimizer: TimingOptimizer::new(config.activity_tolerance_hours),
                monitor: EscalationMonitor::new(config.critical_horizon_days),
                retry: RetryPolicy::new(config.max_retry_attempts),
                profiles: ProfileCache::new(StdDuration::from_secs(
                    config.profile_cache_ttl_secs,
                )),
                config,
                user_id: user_id.to_string(),
                store,
                transport,
                preferences,
                clock,
                locks: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(InFlight::default()),
                escalated: Mutex::new(HashMap::new()),
                overdue_escalations: AtomicU64::new(0),
                failed_deliveries: AtomicU64::new(0),
            }),
        })
    }

    // ─── Public surface ──────────────────────────────────────

    /// Schedule a notification for one task. A config with a task id
    /// already scheduled supersedes the prior request.
    pub async fn schedule(&self, config: TaskNotificationConfig) -> Result<()> {
        config.validate()?;
        let lock = self.task_lock(&config.task_id).await;
        let _guard = lock.lock_owned().await;
        self.schedule_locked(config).await
    }

    /// Schedule many configs at once, batching same-plant tasks before
    /// issuing delivery requests. Invalid configs land in
    /// `BatchOutcome::failures`; the rest still go out.
    pub async fn schedule_multiple(
        &self,
        configs: Vec<TaskNotificationConfig>,
    ) -> BatchOutcome {
        let mut failures = Vec::new();
        let mut valid = Vec::new();
        for config in configs {
            match config.validate() {
                Ok(()) => valid.push(config),
                Err(error) => failures.push(SchedulingFailure {
                    task_id: config.task_id.clone(),
                    error,
                }),
            }
        }

        let prefs = self.user_preferences().await;
        let mut pending = Vec::with_capacity(valid.len());
        for config in valid {
            let deliver_at = self.candidate_instant(&config, &prefs).await;
            pending.push(PendingConfig { config, deliver_at });
        }

        let window = Duration::minutes(self.inner.config.batch_window_mins as i64);
        let max_batch = prefs.max_batch_size.unwrap_or(self.inner.config.max_batch_size);
        let batches = batch::assemble(&pending, window, max_batch, prefs.batching_enabled);

        let mut scheduled = 0;
        for b in &batches {
            // Lock members in sorted order so concurrent multi-schedules
            // cannot deadlock on each other.
            let mut ordered = b.task_ids.clone();
            ordered.sort();
            let mut guards = Vec::with_capacity(ordered.len());
            for task_id in &ordered {
                let lock = self.task_lock(task_id).await;
                guards.push(lock.lock_owned().await);
            }

            match self.issue_batch(b, &pending, &prefs).await {
                Ok(count) => scheduled += count,
                Err(error) => {
                    for task_id in &b.task_ids {
                        failures.push(SchedulingFailure {
                            task_id: task_id.clone(),
                            error: clone_error(&error),
                        });
                    }
                }
            }
        }

        BatchOutcome { scheduled, batches: batches.len(), failures }
    }

    /// Cancel a task's notifications. Idempotent: unknown or already
    /// unscheduled tasks are a no-op. The in-flight transport handle is
    /// voided before this returns.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.clone().lock_owned().await;
        let result = self.cancel_locked(task_id).await;
        drop(guard);
        self.prune_lock(task_id, &lock).await;
        result
    }

    /// Atomic cancel-then-schedule: the old delivery handle is voided
    /// under the task lock before the new one is created, so a task
    /// never has two pending deliveries.
    pub async fn reschedule(&self, task_id: &str, new_due: DateTime<Utc>) -> Result<()> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock_owned().await;

        let in_flight_config = {
            let inf = self.inner.in_flight.lock().await;
            inf.by_task.get(task_id).map(|pd| pd.config.clone())
        };
        let config = match in_flight_config {
            Some(mut config) => {
                config.due_date = new_due;
                config
            }
            None => {
                let entry = self
                    .persist(|| self.inner.store.entry_for_task(task_id))
                    .await?
                    .ok_or_else(|| VerdantError::NotFound(format!("task {task_id}")))?;
                config_from_entry(&entry, new_due)
            }
        };

        self.cancel_locked(task_id).await?;
        self.schedule_locked(config).await
    }

    /// Sweep for overdue tasks and escalate. Invoked by the background
    /// loop every `sweep_interval_secs`, and callable on demand (a UI
    /// foreground nudge calls this directly). Never fails wholesale:
    /// tasks that error or are busy are skipped until the next cycle.
    pub async fn process_overdue(&self, now: Option<DateTime<Utc>>) -> Vec<EscalationResult> {
        let now = now.unwrap_or_else(|| self.inner.clock.now());
        let prefs = self.user_preferences().await;
        let mut results = Vec::new();

        let mut candidates: Vec<(
            String,
            String,
            String,
            verdant_core::types::TaskType,
            DateTime<Utc>,
        )> = Vec::new();
        match self.persist(|| self.inner.store.active_entries()).await {
            Ok(entries) => {
                for e in entries {
                    candidates.push((
                        e.task_id.clone(),
                        e.plant_id.clone(),
                        e.plant_name.clone(),
                        e.task_type,
                        e.next_notification,
                    ));
                }
            }
            Err(e) => tracing::warn!("⚠️ Overdue sweep could not load entries: {e}"),
        }
        {
            let inf = self.inner.in_flight.lock().await;
            for (task_id, pd) in &inf.by_task {
                if candidates.iter().any(|(t, ..)| t == task_id) {
                    continue;
                }
                candidates.push((
                    task_id.clone(),
                    pd.config.plant_id.clone(),
                    pd.config.plant_name.clone(),
                    pd.config.task_type,
                    pd.config.due_date,
                ));
            }
        }

        for (task_id, plant_id, plant_name, task_type, due) in candidates {
            let lock = self.task_lock(&task_id).await;
            let Ok(_guard) = lock.try_lock_owned() else {
                // A caller-initiated operation holds the task; re-check
                // on the next cycle rather than blocking the sweep.
                tracing::debug!("Overdue sweep: task {task_id} busy, skipped");
                continue;
            };

            let Some(result) = self
                .inner
                .monitor
                .evaluate(&task_id, &plant_id, &plant_name, task_type, due, now)
            else {
                continue;
            };

            let notify = {
                let mut escalated = self.inner.escalated.lock().await;
                match escalated.get(&task_id) {
                    Some(prev) if *prev >= result.severity => false,
                    _ => {
                        escalated.insert(task_id.clone(), result.severity);
                        true
                    }
                }
            };

            if notify {
                // Critical goes out immediately; lower severities still
                // respect quiet hours. Escalations never batch.
                let when = match result.severity {
                    OverdueSeverity::Critical => now,
                    _ => quiet_hours::gate(
                        now,
                        prefs.quiet_hours_start.as_deref(),
                        prefs.quiet_hours_end.as_deref(),
                    ),
                };
                let record = DeliveryRecord::new(&task_id, now);
                if self.persist(|| self.inner.store.insert_record(&record)).await.is_ok() {
                    let member = Member {
                        task_id: task_id.clone(),
                        notification_id: record.notification_id.clone(),
                        config: TaskNotificationConfig {
                            task_id: task_id.clone(),
                            plant_id: plant_id.clone(),
                            plant_name: plant_name.clone(),
                            task_type,
                            task_title: result.content.title.clone(),
                            due_date: due,
                            priority: result.content.priority,
                            estimated_duration_mins: 1,
                            is_recurring: false,
                        },
                    };
                    self.issue(result.content.clone(), when, vec![member], false).await;
                    self.inner.overdue_escalations.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "🚨 Escalated {} ({}, {} days overdue)",
                        task_id,
                        result.severity.as_str(),
                        result.days_overdue
                    );
                }
            }

            results.push(result);
        }

        results
    }

    /// Shift candidate instants toward a user's active hours, then
    /// re-validate through the quiet-hours gate. Per-item failures fall
    /// back to the original due date; this never errors wholesale.
    pub async fn optimize_timing(
        &self,
        user_id: &str,
        configs: &[TaskNotificationConfig],
    ) -> Vec<DateTime<Utc>> {
        let profile = match self.inner.profiles.get(user_id, &self.inner.preferences).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ No activity profile for {user_id}: {e}");
                return configs.iter().map(|c| c.due_date).collect();
            }
        };
        let prefs = match self.timed(self.inner.preferences.preferences(user_id)).await {
            Ok(p) => p,
            Err(_) => UserPreferences::default(),
        };
        self.inner
            .optimizer
            .optimize(configs, &profile)
            .into_iter()
            .map(|t| {
                quiet_hours::gate(
                    t,
                    prefs.quiet_hours_start.as_deref(),
                    prefs.quiet_hours_end.as_deref(),
                )
            })
            .collect()
    }

    /// Inbound transport callback. Unknown handles are logged and
    /// dropped — a late event for a cancelled delivery is expected.
    pub async fn on_delivery_event(
        &self,
        handle: &DeliveryHandle,
        event: DeliveryEvent,
        timestamp: DateTime<Utc>,
    ) {
        let entry = {
            let inf = self.inner.in_flight.lock().await;
            inf.by_handle.get(&handle.0).cloned()
        };
        let Some(entry) = entry else {
            tracing::debug!("Delivery event for unknown handle {handle}, dropped");
            return;
        };

        if let DeliveryEvent::Failed { reason } = &event {
            // The request is consumed either way; retries get a new handle.
            {
                let mut inf = self.inner.in_flight.lock().await;
                inf.by_handle.remove(&handle.0);
            }
            for m in &entry.members {
                if let Ok(Some(mut record)) =
                    self.persist(|| self.inner.store.record(&m.notification_id)).await
                {
                    if record.apply(&event, timestamp).is_ok() {
                        let _ = self.persist(|| self.inner.store.update_record(&record)).await;
                    }
                }
            }
            self.delivery_failed(&entry, reason).await;
            return;
        }

        for m in &entry.members {
            let record = match self.persist(|| self.inner.store.record(&m.notification_id)).await
            {
                Ok(Some(r)) => r,
                _ => {
                    tracing::warn!("⚠️ Event for missing record {}", m.notification_id);
                    continue;
                }
            };
            let mut record = record;
            if let Err(e) = record.apply(&event, timestamp) {
                tracing::warn!("⚠️ Dropped delivery event: {e}");
                continue;
            }
            let _ = self.persist(|| self.inner.store.update_record(&record)).await;

            if matches!(event, DeliveryEvent::Sent) {
                self.after_sent(&record, timestamp).await;
            }
            if record.status.is_terminal() {
                let mut inf = self.inner.in_flight.lock().await;
                inf.by_task
                    .retain(|_, pd| pd.notification_id != record.notification_id);
            }
        }

        if matches!(event, DeliveryEvent::Delivered | DeliveryEvent::Read) {
            let mut inf = self.inner.in_flight.lock().await;
            inf.by_handle.remove(&handle.0);
        }
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> EngineStats {
        let active_batches = {
            let inf = self.inner.in_flight.lock().await;
            inf.by_handle.len()
        };
        EngineStats {
            active_batches,
            overdue_escalations: self.inner.overdue_escalations.load(Ordering::Relaxed),
            cached_user_patterns: self.inner.profiles.len().await,
            failed_deliveries: self.inner.failed_deliveries.load(Ordering::Relaxed),
        }
    }

    /// Background sweep loop. Runs until `shutdown` flips to true or
    /// its sender drops; a UI nudge can call `process_overdue` directly
    /// in between ticks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Notification engine sweep started (every {}s)",
            self.inner.config.sweep_interval_secs
        );
        let mut interval = tokio::time::interval(StdDuration::from_secs(
            self.inner.config.sweep_interval_secs,
        ));
        // The first tick fires immediately; skip it so a fresh engine
        // does not sweep before callers have scheduled anything.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let results = self.process_overdue(None).await;
                    if !results.is_empty() {
                        tracing::info!("🔔 Overdue sweep: {} tasks over threshold", results.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("⏹ Notification engine sweep stopped");
                        break;
                    }
                }
            }
        }
    }

    // ─── Scheduling pipeline ──────────────────────────────────

    async fn schedule_locked(&self, config: TaskNotificationConfig) -> Result<()> {
        let now = self.inner.clock.now();
        let prefs = self.user_preferences().await;
        let deliver_at = self.candidate_instant(&config, &prefs).await;

        // Supersede any in-flight delivery for this task, then forget
        // its still-pending records.
        self.void_pending(&config.task_id).await;
        self.persist(|| self.inner.store.delete_pending_records_for_task(&config.task_id))
            .await?;

        let record = DeliveryRecord::new(&config.task_id, now);
        self.persist(|| self.inner.store.insert_record(&record)).await?;

        let mut members = vec![Member {
            task_id: config.task_id.clone(),
            notification_id: record.notification_id.clone(),
            config: config.clone(),
        }];
        let mut pending = vec![PendingConfig { config: config.clone(), deliver_at }];

        let window = Duration::minutes(self.inner.config.batch_window_mins as i64);
        if prefs.batching_enabled {
            // Pull in-flight same-plant deliveries near this instant
            // into the merge set; their handles get voided and the
            // whole group reissued as one composite.
            let mut voided = Vec::new();
            {
                let mut inf = self.inner.in_flight.lock().await;
                let merge_keys: Vec<String> = inf
                    .by_handle
                    .iter()
                    .filter(|(_, he)| {
                        he.track_tasks
                            && (he.deliver_at - deliver_at).abs() <= window
                            && he.members.iter().any(|m| m.config.plant_id == config.plant_id)
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in merge_keys {
                    if let Some(he) = inf.by_handle.remove(&key) {
                        for m in he.members {
                            inf.by_task.remove(&m.task_id);
                            pending.push(PendingConfig {
                                config: m.config.clone(),
                                deliver_at: he.deliver_at,
                            });
                            members.push(m);
                        }
                        voided.push(DeliveryHandle(key));
                    }
                }
            }
            for handle in &voided {
                if let Err(e) = self.timed(self.inner.transport.cancel_delivery(handle)).await {
                    tracing::warn!("⚠️ Could not void superseded handle {handle}: {e}");
                }
            }
        }

        let max_batch = prefs.max_batch_size.unwrap_or(self.inner.config.max_batch_size);
        let batches = batch::assemble(&pending, window, max_batch, prefs.batching_enabled);
        for b in &batches {
            let batch_members: Vec<Member> = members
                .iter()
                .filter(|m| b.task_ids.contains(&m.task_id))
                .cloned()
                .collect();
            self.issue(b.content(), b.deliver_at, batch_members, true).await;
        }

        if config.is_recurring {
            self.persist_entry(&config, deliver_at, &prefs, now).await?;
        }

        tracing::info!(
            "📅 Scheduled '{}' for {} at {}",
            config.task_title,
            config.plant_name,
            deliver_at
        );
        Ok(())
    }

    /// Issue one pre-assembled batch (schedule_multiple path). Members
    /// are already locked by the caller. Returns how many tasks were
    /// scheduled.
    async fn issue_batch(
        &self,
        b: &batch::Batch,
        pending: &[PendingConfig],
        prefs: &UserPreferences,
    ) -> Result<usize> {
        let now = self.inner.clock.now();
        let mut members = Vec::with_capacity(b.task_ids.len());
        for pc in pending.iter().filter(|pc| b.task_ids.contains(&pc.config.task_id)) {
            self.void_pending(&pc.config.task_id).await;
            self.persist(|| {
                self.inner.store.delete_pending_records_for_task(&pc.config.task_id)
            })
            .await?;
            let record = DeliveryRecord::new(&pc.config.task_id, now);
            self.persist(|| self.inner.store.insert_record(&record)).await?;
            members.push(Member {
                task_id: pc.config.task_id.clone(),
                notification_id: record.notification_id.clone(),
                config: pc.config.clone(),
            });
            if pc.config.is_recurring {
                self.persist_entry(&pc.config, b.deliver_at, prefs, now).await?;
            }
        }
        let count = members.len();
        self.issue(b.content(), b.deliver_at, members, true).await;
        Ok(count)
    }

    async fn cancel_locked(&self, task_id: &str) -> Result<()> {
        let now = self.inner.clock.now();
        self.void_pending(task_id).await;
        self.persist(|| self.inner.store.deactivate_entries_for_task(task_id, now))
            .await?;
        self.persist(|| self.inner.store.delete_pending_records_for_task(task_id))
            .await?;
        self.inner.escalated.lock().await.remove(task_id);
        tracing::info!("🗑 Cancelled notifications for task {task_id}");
        Ok(())
    }

    /// Void a task's in-flight delivery handle, synchronously, and
    /// reissue for any batch co-members left behind.
    async fn void_pending(&self, task_id: &str) {
        let pd = {
            let mut inf = self.inner.in_flight.lock().await;
            inf.by_task.remove(task_id)
        };
        let Some(pd) = pd else { return };

        let handle_entry = {
            let mut inf = self.inner.in_flight.lock().await;
            inf.by_handle.remove(&pd.handle.0)
        };
        if let Err(e) = self.timed(self.inner.transport.cancel_delivery(&pd.handle)).await {
            tracing::warn!("⚠️ Transport cancel for {} failed: {e}", pd.handle);
        }

        if let Some(he) = handle_entry {
            let remaining: Vec<Member> = he
                .members
                .into_iter()
                .filter(|m| m.task_id != task_id)
                .collect();
            if !remaining.is_empty() {
                self.reissue_members(remaining, he.deliver_at).await;
            }
        }
    }

    /// Re-request delivery for batch members that survived a cancel or
    /// supersede, regrouping them (a shrunken composite may become a
    /// plain single notification).
    async fn reissue_members(&self, members: Vec<Member>, deliver_at: DateTime<Utc>) {
        let pending: Vec<PendingConfig> = members
            .iter()
            .map(|m| PendingConfig { config: m.config.clone(), deliver_at })
            .collect();
        let window = Duration::minutes(self.inner.config.batch_window_mins as i64);
        let batches = batch::assemble(&pending, window, self.inner.config.max_batch_size, true);
        for b in &batches {
            let batch_members: Vec<Member> = members
                .iter()
                .filter(|m| b.task_ids.contains(&m.task_id))
                .cloned()
                .collect();
            self.issue(b.content(), b.deliver_at, batch_members, true).await;
        }
    }

    /// Request delivery from the transport and register the handle.
    /// Failures never propagate — they enter the retry path and, after
    /// exhaustion, surface as Failed records.
    async fn issue(
        &self,
        content: NotificationContent,
        deliver_at: DateTime<Utc>,
        members: Vec<Member>,
        track_tasks: bool,
    ) {
        match self.timed(self.inner.transport.request_delivery(&content, deliver_at)).await {
            Ok(handle) => {
                let mut inf = self.inner.in_flight.lock().await;
                if track_tasks {
                    for m in &members {
                        inf.by_task.insert(
                            m.task_id.clone(),
                            PendingDelivery {
                                handle: handle.clone(),
                                notification_id: m.notification_id.clone(),
                                config: m.config.clone(),
                                deliver_at,
                            },
                        );
                    }
                }
                inf.by_handle.insert(
                    handle.0.clone(),
                    HandleEntry { members, content, deliver_at, track_tasks },
                );
            }
            Err(e) => {
                let entry = HandleEntry { members, content, deliver_at, track_tasks };
                self.delivery_failed(&entry, &failure_reason_of(&e)).await;
            }
        }
    }

    // ─── Failure handling ─────────────────────────────────────

    /// Route a delivery failure: retryable reasons re-request after
    /// exponential backoff until the attempt cap; everything else marks
    /// the records Failed so the task layer can surface them.
    async fn delivery_failed(&self, entry: &HandleEntry, reason: &str) {
        let now = self.inner.clock.now();
        let attempts = match entry.members.first() {
            Some(first) => {
                match self.persist(|| self.inner.store.record(&first.notification_id)).await {
                    Ok(Some(r)) => r.retry_count,
                    _ => 0,
                }
            }
            None => return,
        };

        match self.inner.retry.next_delay(reason, attempts) {
            Some(delay) => {
                for m in &entry.members {
                    if let Ok(Some(mut record)) =
                        self.persist(|| self.inner.store.record(&m.notification_id)).await
                    {
                        record.mark_retrying(now);
                        let _ = self.persist(|| self.inner.store.update_record(&record)).await;
                    }
                }
                tracing::info!(
                    "🔁 Delivery failed ({reason}), retry {} in {:?}",
                    attempts + 1,
                    delay
                );
                let engine = self.clone();
                let retry_entry = entry.clone();
                spawn_redelivery(engine, retry_entry, delay);
            }
            None => {
                for m in &entry.members {
                    if let Ok(Some(mut record)) =
                        self.persist(|| self.inner.store.record(&m.notification_id)).await
                    {
                        record.mark_failed(reason, now);
                        let _ = self.persist(|| self.inner.store.update_record(&record)).await;
                    }
                }
                self.inner
                    .failed_deliveries
                    .fetch_add(entry.members.len() as u64, Ordering::Relaxed);
                let failed: Vec<String> =
                    entry.members.iter().map(|m| m.notification_id.clone()).collect();
                let mut inf = self.inner.in_flight.lock().await;
                inf.by_task.retain(|_, pd| !failed.contains(&pd.notification_id));
                tracing::warn!(
                    "⚠️ Delivery failed permanently ({reason}) for {} task(s)",
                    entry.members.len()
                );
            }
        }
    }

    /// One backoff-delayed retry. Members cancelled while we slept are
    /// dropped; a shrunken group is re-assembled before re-request.
    async fn attempt_redelivery(&self, entry: HandleEntry) {
        let mut live = Vec::new();
        for m in &entry.members {
            if let Ok(Some(record)) =
                self.persist(|| self.inner.store.record(&m.notification_id)).await
            {
                if record.status == DeliveryState::Scheduled {
                    live.push(m.clone());
                }
            }
        }
        if live.is_empty() {
            return;
        }

        let content = if live.len() == entry.members.len() {
            entry.content.clone()
        } else {
            let pending: Vec<PendingConfig> = live
                .iter()
                .map(|m| PendingConfig { config: m.config.clone(), deliver_at: entry.deliver_at })
                .collect();
            let window = Duration::minutes(self.inner.config.batch_window_mins as i64);
            match batch::assemble(&pending, window, self.inner.config.max_batch_size, true)
                .first()
            {
                Some(b) => b.content(),
                None => return,
            }
        };

        self.issue(content, entry.deliver_at, live, entry.track_tasks).await;
    }

    /// After a Sent callback: advance the recurrence entry (optimistic,
    /// reload on a lost race) and queue the next occurrence unless the
    /// entry hit a cap.
    async fn after_sent(&self, record: &DeliveryRecord, now: DateTime<Utc>) {
        let entry = match self.persist(|| self.inner.store.entry_for_task(&record.task_id)).await
        {
            Ok(Some(e)) => e,
            _ => return,
        };

        let mut current = entry;
        for _ in 0..3 {
            let expected = current.updated_at;
            let mut updated = current.clone();
            updated.record_send(now);
            match self.persist(|| self.inner.store.update_entry_if(&updated, expected)).await {
                Ok(true) => {
                    current = updated;
                    break;
                }
                Ok(false) => {
                    match self
                        .persist(|| self.inner.store.entry_for_task(&record.task_id))
                        .await
                    {
                        Ok(Some(e)) => current = e,
                        _ => return,
                    }
                }
                Err(_) => return,
            }
        }

        if !current.can_send_more() {
            tracing::info!("🔕 Entry for {} reached its notification cap", current.plant_name);
            return;
        }

        let config = {
            let inf = self.inner.in_flight.lock().await;
            inf.by_task.get(&record.task_id).map(|pd| pd.config.clone())
        };
        let Some(mut config) = config else { return };
        config.due_date = current.next_notification;

        let next_at = quiet_hours::gate(
            current.next_notification,
            current.settings.quiet_hours_start.as_deref(),
            current.settings.quiet_hours_end.as_deref(),
        );
        let next_record = DeliveryRecord::new(&record.task_id, now);
        if self.persist(|| self.inner.store.insert_record(&next_record)).await.is_err() {
            return;
        }
        let pc = PendingConfig { config: config.clone(), deliver_at: next_at };
        let b = batch::single(&pc);
        let member = Member {
            task_id: record.task_id.clone(),
            notification_id: next_record.notification_id.clone(),
            config,
        };
        self.issue(b.content(), next_at, vec![member], true).await;
    }

    // ─── Helpers ──────────────────────────────────────────────

    /// Candidate delivery instant: advance notice, quiet-hours gate,
    /// activity shift, and a re-gate of the shifted instant.
    async fn candidate_instant(
        &self,
        config: &TaskNotificationConfig,
        prefs: &UserPreferences,
    ) -> DateTime<Utc> {
        let mut candidate =
            config.due_date - Duration::minutes(prefs.reminder_advance_minutes as i64);
        candidate = quiet_hours::gate(
            candidate,
            prefs.quiet_hours_start.as_deref(),
            prefs.quiet_hours_end.as_deref(),
        );
        if let Ok(profile) =
            self.inner.profiles.get(&self.inner.user_id, &self.inner.preferences).await
        {
            if let Some(shifted) = self.inner.optimizer.optimize_one(candidate, &profile) {
                candidate = shifted;
            }
        }
        quiet_hours::gate(
            candidate,
            prefs.quiet_hours_start.as_deref(),
            prefs.quiet_hours_end.as_deref(),
        )
    }

    /// Create or refresh the recurrence entry for a recurring config.
    async fn persist_entry(
        &self,
        config: &TaskNotificationConfig,
        deliver_at: DateTime<Utc>,
        prefs: &UserPreferences,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let existing = self
            .persist(|| self.inner.store.entry_for_plant(&config.plant_id, config.task_type))
            .await?;
        let entry = match existing {
            Some(mut e) => {
                e.task_id = config.task_id.clone();
                e.plant_name = config.plant_name.clone();
                e.next_notification = deliver_at;
                e.is_active = true;
                e.updated_at = now;
                e
            }
            None => {
                let settings = EntrySettings {
                    quiet_hours_start: prefs.quiet_hours_start.clone(),
                    quiet_hours_end: prefs.quiet_hours_end.clone(),
                    advance_notice_minutes: prefs.reminder_advance_minutes,
                    priority: config.priority,
                    ..Default::default()
                };
                ScheduleEntry::from_config(config, deliver_at, settings, now)
            }
        };
        self.persist(|| self.inner.store.upsert_entry(&entry)).await
    }

    async fn user_preferences(&self) -> UserPreferences {
        match self.timed(self.inner.preferences.preferences(&self.inner.user_id)).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ Preference store unavailable, using defaults: {e}");
                UserPreferences::default()
            }
        }
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a task's lock entry once nothing else holds it, so the map
    /// stays bounded by the live task set.
    async fn prune_lock(&self, task_id: &str, held: &Arc<Mutex<()>>) {
        let mut locks = self.inner.locks.lock().await;
        if let Some(existing) = locks.get(task_id) {
            // Map + `held` = 2 strong refs; more means a waiter exists.
            if Arc::ptr_eq(existing, held) && Arc::strong_count(existing) <= 2 {
                locks.remove(task_id);
            }
        }
    }

    async fn timed<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let limit = StdDuration::from_secs(self.inner.config.op_timeout_secs);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(VerdantError::Timeout(limit)),
        }
    }

    /// Store call with local retries: persistence hiccups back off and
    /// retry before surfacing.
    async fn persist<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.inner.config.persistence_retry_attempts.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(e @ (VerdantError::Persistence(_) | VerdantError::Timeout(_))) => {
                    tracing::warn!("⚠️ Store operation failed (attempt {}): {e}", attempt + 1);
                    last = Some(e);
                    tokio::time::sleep(StdDuration::from_millis(50 * (attempt as u64 + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| VerdantError::Persistence("store unavailable".into())))
    }
}

/// Schedule a backoff-delayed redelivery on the runtime. Extracted to a
/// free function so its future is type-checked outside the
/// `delivery_failed` → `attempt_redelivery` → `issue` cycle, where the
/// compiler can otherwise not resolve the `Send` auto-trait.
fn spawn_redelivery(
    engine: NotificationEngine,
    retry_entry: HandleEntry,
    delay: StdDuration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        engine.attempt_redelivery(retry_entry).await;
    });
}

/// Spawn the engine's sweep loop. Flip the returned sender to true (or
/// drop it) to stop the loop.
pub fn spawn_engine(engine: &NotificationEngine) -> watch::Sender<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(engine.clone().run(rx));
    tx
}

/// Rebuild a scheduling config from a recurrence entry, for reschedules
/// of tasks with no in-flight delivery.
fn config_from_entry(entry: &ScheduleEntry, new_due: DateTime<Utc>) -> TaskNotificationConfig {
    TaskNotificationConfig {
        task_id: entry.task_id.clone(),
        plant_id: entry.plant_id.clone(),
        plant_name: entry.plant_name.clone(),
        task_type: entry.task_type,
        task_title: format!("{} — {}", entry.plant_name, entry.task_type),
        due_date: new_due,
        priority: entry.settings.priority,
        estimated_duration_mins: entry.interval_hours.clamp(1, 60),
        is_recurring: true,
    }
}

/// Failure-taxonomy string for a transport-path error.
fn failure_reason_of(e: &VerdantError) -> String {
    match e {
        VerdantError::Transport { reason, .. } => reason.clone(),
        VerdantError::Timeout(_) => "network_error".into(),
        other => other.to_string(),
    }
}

fn clone_error(e: &VerdantError) -> VerdantError {
    match e {
        VerdantError::Validation(s) => VerdantError::Validation(s.clone()),
        VerdantError::NotFound(s) => VerdantError::NotFound(s.clone()),
        VerdantError::Persistence(s) => VerdantError::Persistence(s.clone()),
        VerdantError::Transport { reason, retryable } => {
            VerdantError::Transport { reason: reason.clone(), retryable: *retryable }
        }
        VerdantError::Config(s) => VerdantError::Config(s.clone()),
        VerdantError::Timeout(d) => VerdantError::Timeout(*d),
        VerdantError::Io(err) => VerdantError::Persistence(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use verdant_core::traits::SystemClock;
    use verdant_core::types::{TaskPriority, TaskType, UserActivityProfile};

    use crate::persistence::SchedulerDb;
    use crate::transport::MemoryTransport;

    struct StaticPrefs {
        prefs: UserPreferences,
        profile: UserActivityProfile,
    }

    #[async_trait]
    impl PreferenceStore for StaticPrefs {
        async fn preferences(&self, _user_id: &str) -> Result<UserPreferences> {
            Ok(self.prefs.clone())
        }

        async fn activity_profile(&self, _user_id: &str) -> Result<UserActivityProfile> {
            Ok(self.profile.clone())
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct Harness {
        engine: NotificationEngine,
        transport: Arc<MemoryTransport>,
        store: Arc<SchedulerDb>,
        dir: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn harness(name: &str, prefs: UserPreferences, clock: Arc<dyn Clock>) -> Harness {
        let dir = std::env::temp_dir().join(format!("verdant-engine-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        let store = Arc::new(SchedulerDb::open(&dir.join("test.db")).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let preferences = Arc::new(StaticPrefs {
            prefs,
            profile: UserActivityProfile::default(),
        });
        let engine = NotificationEngine::new(
            EngineConfig::default(),
            "user-1",
            store.clone(),
            transport.clone(),
            preferences,
            clock,
        )
        .unwrap();
        Harness { engine, transport, store, dir }
    }

    fn default_harness(name: &str) -> Harness {
        harness(name, UserPreferences::default(), Arc::new(SystemClock))
    }

    fn config(task_id: &str, plant: &str, due: DateTime<Utc>) -> TaskNotificationConfig {
        TaskNotificationConfig {
            task_id: task_id.into(),
            plant_id: format!("plant-{plant}"),
            plant_name: plant.into(),
            task_type: TaskType::Watering,
            task_title: format!("Water {plant}"),
            due_date: due,
            priority: TaskPriority::Medium,
            estimated_duration_mins: 10,
            is_recurring: false,
        }
    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + Duration::hours(2)
    }

    #[tokio::test]
    async fn test_schedule_then_cancel_leaves_nothing_pending() {
        let h = default_harness("round-trip");
        h.engine
            .schedule(config("t1", "Blue Dream #1", soon()))
            .await
            .unwrap();
        assert_eq!(h.engine.stats().await.active_batches, 1);

        h.engine.cancel("t1").await.unwrap();
        let stats = h.engine.stats().await;
        assert_eq!(stats.active_batches, 0);
        assert!(h.transport.live_requests().is_empty());
        assert!(h.store.entry_for_task("t1").await.unwrap().is_none());
        assert!(h.store.records_for_task("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_noop() {
        let h = default_harness("cancel-noop");
        assert!(h.engine.cancel("never-scheduled").await.is_ok());
        assert!(h.engine.cancel("never-scheduled").await.is_ok());
    }

    #[tokio::test]
    async fn test_two_close_tasks_one_composite() {
        let h = default_harness("composite");
        let due = soon();
        let outcome = h
            .engine
            .schedule_multiple(vec![
                config("t1", "Blue Dream #1", due),
                config("t2", "Blue Dream #1", due + Duration::minutes(30)),
            ])
            .await;
        assert_eq!(outcome.scheduled, 2);
        assert_eq!(outcome.batches, 1);
        assert!(outcome.failures.is_empty());

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.body.contains("2 tasks for Blue Dream #1"));
        assert_eq!(requests[0].0.task_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_later_schedule_merges_with_in_flight_same_plant() {
        let h = default_harness("merge-on-schedule");
        let due = soon();
        h.engine
            .schedule(config("t1", "Blue Dream #1", due))
            .await
            .unwrap();
        let first_handle = h.transport.requests()[0].2.clone();

        h.engine
            .schedule(config("t2", "Blue Dream #1", due + Duration::minutes(10)))
            .await
            .unwrap();

        // The single request was voided and replaced by one composite.
        assert!(h.transport.cancelled().contains(&first_handle));
        let live = h.transport.live_requests();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0.task_ids.len(), 2);
        assert!(live[0].0.body.contains("2 tasks for Blue Dream #1"));
        assert_eq!(h.engine.stats().await.active_batches, 1);
    }

    #[tokio::test]
    async fn test_batching_disabled_sends_singly() {
        let prefs = UserPreferences { batching_enabled: false, ..Default::default() };
        let h = harness("no-batch", prefs, Arc::new(SystemClock));
        let due = soon();
        let outcome = h
            .engine
            .schedule_multiple(vec![
                config("t1", "Blue Dream #1", due),
                config("t2", "Blue Dream #1", due + Duration::minutes(5)),
            ])
            .await;
        assert_eq!(outcome.batches, 2);
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_does_not_block_the_rest() {
        let h = default_harness("partial");
        let bad = config("", "Blue Dream #1", soon());
        let outcome = h
            .engine
            .schedule_multiple(vec![bad, config("t2", "Haze #4", soon())])
            .await;
        assert_eq!(outcome.scheduled, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].error, VerdantError::Validation(_)));
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_goes_straight_to_failed() {
        let h = default_harness("fatal");
        h.engine
            .schedule(config("t1", "Blue Dream #1", soon()))
            .await
            .unwrap();
        let handle = h.transport.requests()[0].2.clone();

        h.engine
            .on_delivery_event(
                &handle,
                DeliveryEvent::Failed { reason: "permission_denied".into() },
                Utc::now(),
            )
            .await;

        let records = h.store.records_for_task("t1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryState::Failed);
        assert_eq!(records[0].retry_count, 0);
        assert_eq!(records[0].failure_reason.as_deref(), Some("permission_denied"));
        assert_eq!(h.engine.stats().await.failed_deliveries, 1);
        // No retry request went out.
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_backs_off_and_reissues() {
        let h = default_harness("retryable");
        h.engine
            .schedule(config("t1", "Blue Dream #1", soon()))
            .await
            .unwrap();
        let handle = h.transport.requests()[0].2.clone();

        h.engine
            .on_delivery_event(
                &handle,
                DeliveryEvent::Failed { reason: "network_error".into() },
                Utc::now(),
            )
            .await;

        let records = h.store.records_for_task("t1").await.unwrap();
        assert_eq!(records[0].status, DeliveryState::Scheduled);
        assert_eq!(records[0].retry_count, 1);

        // First backoff is 2^0 = 1 second; paused time auto-advances.
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert_eq!(h.transport.requests().len(), 2);
        assert_eq!(h.engine.stats().await.failed_deliveries, 0);
    }

    #[tokio::test]
    async fn test_reschedule_supersedes_old_handle() {
        let h = default_harness("resched");
        h.engine
            .schedule(config("t1", "Blue Dream #1", soon()))
            .await
            .unwrap();
        let first_handle = h.transport.requests()[0].2.clone();

        h.engine
            .reschedule("t1", soon() + Duration::hours(6))
            .await
            .unwrap();

        assert!(h.transport.cancelled().contains(&first_handle));
        assert_eq!(h.transport.requests().len(), 2);
        assert_eq!(h.engine.stats().await.active_batches, 1);
    }

    #[tokio::test]
    async fn test_reschedule_unknown_task_is_not_found() {
        let h = default_harness("resched-missing");
        let err = h.engine.reschedule("ghost", soon()).await.unwrap_err();
        assert!(matches!(err, VerdantError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_one_of_a_composite_reissues_the_rest() {
        let h = default_harness("unmerge");
        let due = soon();
        h.engine
            .schedule_multiple(vec![
                config("t1", "Blue Dream #1", due),
                config("t2", "Blue Dream #1", due + Duration::minutes(10)),
            ])
            .await;
        assert_eq!(h.transport.requests().len(), 1);

        h.engine.cancel("t1").await.unwrap();

        // The composite was voided and t2 reissued alone.
        let live = h.transport.live_requests();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0.task_ids, vec!["t2".to_string()]);
        assert_eq!(h.store.records_for_task("t2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overdue_critical_bypasses_quiet_hours() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        let prefs = UserPreferences {
            quiet_hours_start: Some("00:00".into()),
            quiet_hours_end: Some("23:00".into()),
            ..Default::default()
        };
        let h = harness("overdue-crit", prefs, Arc::new(FixedClock(now)));

        // 2.9 days overdue against the 3-day horizon: critical.
        let c = config("t1", "Blue Dream #1", now - Duration::hours(70));
        let entry = ScheduleEntry::from_config(&c, c.due_date, EntrySettings::default(), now);
        h.store.upsert_entry(&entry).await.unwrap();

        let results = h.engine.process_overdue(Some(now)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, OverdueSeverity::Critical);
        assert_eq!(results[0].days_overdue, 2);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.category_id.as_deref(), Some("overdue_tasks"));
        // Delivered now, not deferred to the end of quiet hours.
        assert_eq!(requests[0].1, now);
        assert_eq!(h.engine.stats().await.overdue_escalations, 1);
    }

    #[tokio::test]
    async fn test_overdue_high_respects_quiet_hours() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let prefs = UserPreferences {
            quiet_hours_start: Some("00:00".into()),
            quiet_hours_end: Some("23:00".into()),
            ..Default::default()
        };
        let h = harness("overdue-high", prefs, Arc::new(FixedClock(now)));

        // 2.6 days overdue: high severity, quiet hours still apply.
        let c = config("t1", "Blue Dream #1", now - Duration::hours(62));
        let entry = ScheduleEntry::from_config(&c, c.due_date, EntrySettings::default(), now);
        h.store.upsert_entry(&entry).await.unwrap();

        let results = h.engine.process_overdue(Some(now)).await;
        assert_eq!(results[0].severity, OverdueSeverity::High);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1 > now);
    }

    #[tokio::test]
    async fn test_repeat_sweep_does_not_renotify_same_severity() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let h = harness("overdue-dedup", UserPreferences::default(), Arc::new(FixedClock(now)));
        let c = config("t1", "Blue Dream #1", now - Duration::hours(70));
        let entry = ScheduleEntry::from_config(&c, c.due_date, EntrySettings::default(), now);
        h.store.upsert_entry(&entry).await.unwrap();

        let first = h.engine.process_overdue(Some(now)).await;
        let second = h.engine.process_overdue(Some(now)).await;
        // Both sweeps report the task, only the first notifies.
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(h.transport.requests().len(), 1);
        assert_eq!(h.engine.stats().await.overdue_escalations, 1);
    }

    #[tokio::test]
    async fn test_sent_advances_recurrence_and_queues_next() {
        let h = default_harness("recur");
        let mut c = config("t1", "Blue Dream #1", soon());
        c.is_recurring = true;
        h.engine.schedule(c).await.unwrap();

        let entry_before = h.store.entry_for_task("t1").await.unwrap().unwrap();
        let handle = h.transport.requests()[0].2.clone();
        h.engine
            .on_delivery_event(&handle, DeliveryEvent::Sent, Utc::now())
            .await;

        let entry_after = h.store.entry_for_task("t1").await.unwrap().unwrap();
        assert_eq!(entry_after.sent_count, 1);
        assert!(entry_after.next_notification > entry_before.next_notification);
        // Next occurrence requested.
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_handle_event_is_dropped() {
        let h = default_harness("unknown-handle");
        h.engine
            .on_delivery_event(
                &DeliveryHandle("no-such-handle".into()),
                DeliveryEvent::Delivered,
                Utc::now(),
            )
            .await;
        assert_eq!(h.engine.stats().await.failed_deliveries, 0);
    }

    #[tokio::test]
    async fn test_optimize_timing_shifts_and_gates() {
        let dir = std::env::temp_dir().join("verdant-engine-optimize");
        std::fs::remove_dir_all(&dir).ok();
        let store = Arc::new(SchedulerDb::open(&dir.join("test.db")).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let preferences = Arc::new(StaticPrefs {
            prefs: UserPreferences::default(),
            profile: UserActivityProfile {
                most_active_hours: vec![18],
                timezone: "UTC".into(),
                weekday_preference: false,
            },
        });
        let engine = NotificationEngine::new(
            EngineConfig::default(),
            "user-1",
            store,
            transport,
            preferences,
            Arc::new(SystemClock),
        )
        .unwrap();

        let due = Utc.with_ymd_and_hms(2026, 3, 10, 16, 30, 0).unwrap();
        let out = engine
            .optimize_timing("user-1", &[config("t1", "Blue Dream #1", due)])
            .await;
        // 16:30 shifts forward 2 hours into the 18:00 active hour.
        assert_eq!(out, vec![due + Duration::hours(2)]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let h = default_harness("stats");
        h.engine.schedule(config("t1", "Blue Dream #1", soon())).await.unwrap();
        let stats = h.engine.stats().await;
        assert_eq!(stats.active_batches, 1);
        assert_eq!(stats.overdue_escalations, 0);
        assert_eq!(stats.failed_deliveries, 0);
        // schedule() warmed the profile cache for its own user.
        assert_eq!(stats.cached_user_patterns, 1);
    }
}

