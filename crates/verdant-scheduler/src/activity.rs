//! Activity-based timing — nudges notifications toward the hours a user
//! actually opens the app.
//!
//! The shift is forward-only and bounded: a candidate moves to the
//! nearest active hour within the tolerance (default 3 hours ahead),
//! otherwise it stays on the due instant. Quiet-hours validation happens
//! after the shift, at the engine level.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::Mutex;
use verdant_core::traits::PreferenceStore;
use verdant_core::types::{TaskNotificationConfig, UserActivityProfile};

/// Forward-only shifter toward a user's most active hours.
#[derive(Debug, Clone, Copy)]
pub struct TimingOptimizer {
    /// Maximum forward shift, in whole hours.
    pub tolerance_hours: u32,
}

impl Default for TimingOptimizer {
    fn default() -> Self {
        Self { tolerance_hours: 3 }
    }
}

impl TimingOptimizer {
    pub fn new(tolerance_hours: u32) -> Self {
        Self { tolerance_hours }
    }

    /// One adjusted instant per input config, order-preserving. A config
    /// that cannot be optimized (empty or invalid profile hours) keeps
    /// its original due date.
    pub fn optimize(
        &self,
        configs: &[TaskNotificationConfig],
        profile: &UserActivityProfile,
    ) -> Vec<DateTime<Utc>> {
        configs
            .iter()
            .map(|c| self.optimize_one(c.due_date, profile).unwrap_or(c.due_date))
            .collect()
    }

    /// Shift a single instant toward the nearest active hour ahead.
    /// None means "no shift applies" — the caller falls back to the
    /// original instant.
    pub fn optimize_one(
        &self,
        due: DateTime<Utc>,
        profile: &UserActivityProfile,
    ) -> Option<DateTime<Utc>> {
        let due_hour = due.hour();
        // Forward distance to the nearest active hour, wrapping at 24.
        let best = profile
            .most_active_hours
            .iter()
            .filter(|&&h| h < 24)
            .map(|&h| (h + 24 - due_hour) % 24)
            .min()?;

        if best == 0 {
            // Already in an active hour.
            return Some(due);
        }
        if best > self.tolerance_hours {
            return None;
        }
        Some(due + chrono::Duration::hours(best as i64))
    }
}

struct CachedProfile {
    profile: UserActivityProfile,
    fetched_at: Instant,
}

/// TTL cache over the preference store's activity profiles.
///
/// Stale-while-revalidate: a stale hit returns the cached value
/// immediately and refreshes in the background, so scheduling never
/// waits on the preference store once a profile is warm.
pub struct ProfileCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, CachedProfile>>>,
}

impl ProfileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a profile, serving from cache when warm. A cold miss hits
    /// the store directly; a stale hit returns the old value and spawns
    /// a refresh.
    pub async fn get(
        &self,
        user_id: &str,
        store: &Arc<dyn PreferenceStore>,
    ) -> verdant_core::Result<UserActivityProfile> {
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(user_id) {
                let profile = cached.profile.clone();
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(profile);
                }
                // Stale: serve it, refresh behind the caller's back.
                self.spawn_refresh(user_id.to_string(), Arc::clone(store));
                return Ok(profile);
            }
        }

        let profile = store.activity_profile(user_id).await?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            user_id.to_string(),
            CachedProfile { profile: profile.clone(), fetched_at: Instant::now() },
        );
        Ok(profile)
    }

    fn spawn_refresh(&self, user_id: String, store: Arc<dyn PreferenceStore>) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            match store.activity_profile(&user_id).await {
                Ok(profile) => {
                    let mut entries = entries.lock().await;
                    entries.insert(user_id, CachedProfile { profile, fetched_at: Instant::now() });
                }
                Err(e) => {
                    // Keep serving the stale value; retry on the next stale hit.
                    tracing::warn!("⚠️ Profile refresh failed for {user_id}: {e}");
                }
            }
        });
    }

    /// Number of cached profiles, for engine statistics.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use verdant_core::config::UserPreferences;
    use verdant_core::types::{TaskPriority, TaskType};

    fn profile(hours: &[u32]) -> UserActivityProfile {
        UserActivityProfile {
            most_active_hours: hours.to_vec(),
            timezone: "UTC".into(),
            weekday_preference: false,
        }
    }

    fn due(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, 15, 0).unwrap()
    }

    fn config_due(h: u32) -> TaskNotificationConfig {
        TaskNotificationConfig {
            task_id: format!("task-{h}"),
            plant_id: "plant-1".into(),
            plant_name: "Blue Dream #1".into(),
            task_type: TaskType::Watering,
            task_title: "Water".into(),
            due_date: due(h),
            priority: TaskPriority::Medium,
            estimated_duration_mins: 5,
            is_recurring: false,
        }
    }

    #[test]
    fn test_shift_forward_within_tolerance() {
        let opt = TimingOptimizer::default();
        // Due 14:15, active at 16: shift forward 2 hours.
        let out = opt.optimize_one(due(14), &profile(&[16])).unwrap();
        assert_eq!(out, due(16));
    }

    #[test]
    fn test_no_shift_beyond_tolerance() {
        let opt = TimingOptimizer::default();
        // Nearest active hour is 6 ahead: out of tolerance, keep due.
        assert!(opt.optimize_one(due(14), &profile(&[20])).is_none());
    }

    #[test]
    fn test_never_shifts_earlier() {
        let opt = TimingOptimizer::default();
        // Active hour 13 is "1 hour ago": forward wrap makes it 23 ahead,
        // far beyond tolerance, so the due date stands.
        assert!(opt.optimize_one(due(14), &profile(&[13])).is_none());

        let out = opt.optimize(&[config_due(14)], &profile(&[13]));
        assert_eq!(out, vec![due(14)]);
    }

    #[test]
    fn test_wrap_at_midnight() {
        let opt = TimingOptimizer::default();
        // Due 23:15, active at 1: forward distance 2.
        let out = opt.optimize_one(due(23), &profile(&[1])).unwrap();
        assert_eq!(out, due(23) + chrono::Duration::hours(2));
    }

    #[test]
    fn test_already_active_hour_unchanged() {
        let opt = TimingOptimizer::default();
        let out = opt.optimize_one(due(14), &profile(&[14, 20])).unwrap();
        assert_eq!(out, due(14));
    }

    #[test]
    fn test_empty_profile_falls_back_per_item() {
        let opt = TimingOptimizer::default();
        let configs = vec![config_due(9), config_due(14)];
        let out = opt.optimize(&configs, &profile(&[]));
        assert_eq!(out, vec![due(9), due(14)]);
    }

    #[test]
    fn test_invalid_hours_ignored() {
        let opt = TimingOptimizer::default();
        // 99 is not an hour; only 16 counts.
        let out = opt.optimize_one(due(14), &profile(&[99, 16])).unwrap();
        assert_eq!(out, due(16));
    }

    struct CountingPrefs {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PreferenceStore for CountingPrefs {
        async fn preferences(&self, _user_id: &str) -> verdant_core::Result<UserPreferences> {
            Ok(UserPreferences::default())
        }

        async fn activity_profile(
            &self,
            _user_id: &str,
        ) -> verdant_core::Result<UserActivityProfile> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(profile(&[9, 18]))
        }
    }

    #[tokio::test]
    async fn test_cache_serves_warm_hits() {
        let cache = ProfileCache::new(Duration::from_secs(600));
        let counting = Arc::new(CountingPrefs { calls: AtomicU32::new(0) });
        let store: Arc<dyn PreferenceStore> = counting.clone();

        let a = cache.get("user-1", &store).await.unwrap();
        let b = cache.get("user-1", &store).await.unwrap();
        assert_eq!(a.most_active_hours, b.most_active_hours);
        assert_eq!(cache.len().await, 1);
        // Second hit came from cache, not the store.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_hit_returns_immediately() {
        let cache = ProfileCache::new(Duration::from_millis(0));
        let store: Arc<dyn PreferenceStore> =
            Arc::new(CountingPrefs { calls: AtomicU32::new(0) });

        cache.get("user-1", &store).await.unwrap();
        // TTL zero: next hit is stale but still served from cache.
        let p = cache.get("user-1", &store).await.unwrap();
        assert_eq!(p.most_active_hours, vec![9, 18]);
    }
}
