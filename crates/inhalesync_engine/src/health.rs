//! Sync health: last success and failure, and the stale-sync alert.

use crate::hooks::NotificationSink;
use crate::store::SettingsStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Settings key of the last successful sync, in Unix seconds.
pub const LAST_SUCCESSFUL_SYNC_KEY: &str = "lastSuccessfulSyncDate";

/// Settings key of the last failed sync, in Unix seconds.
pub const LAST_FAILED_SYNC_KEY: &str = "lastFailedSyncDate";

/// Settings key recording whether the stale-sync notification is showing.
pub const STALE_SYNC_ACTIVE_KEY: &str = "staleSyncNotificationActive";

/// Notification raised when no sync has succeeded for the threshold period.
pub const STALE_SYNC_NOTIFICATION_ID: &str = "NoCloudSyncFor14Days";

/// Durable sync health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncHealth {
    /// Last successful sync; `None` if the account never synced.
    pub last_successful: Option<DateTime<Utc>>,
    /// Last failed sync.
    pub last_failed: Option<DateTime<Utc>>,
    /// Whether the stale-sync notification is showing.
    pub notification_active: bool,
}

/// Effect of recording one cycle outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// Success recorded.
    Succeeded {
        /// Whether an active stale-sync notification was cleared.
        cleared: bool,
    },
    /// The very first attempt failed; both timestamps were set to now.
    FirstFailure,
    /// Failure recorded, still within the threshold.
    Failed,
    /// Failure recorded; the notification was already raised for this streak.
    AlreadyRaised,
    /// Failure recorded and the stale-sync notification raised.
    Raised,
}

/// Tracks sync outcomes and raises the stale-sync alert.
pub struct SyncHealthMonitor {
    settings: Arc<dyn SettingsStore>,
    notifications: Arc<dyn NotificationSink>,
    threshold_days: i64,
}

impl SyncHealthMonitor {
    /// Creates a monitor.
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        notifications: Arc<dyn NotificationSink>,
        threshold_days: i64,
    ) -> Self {
        Self {
            settings,
            notifications,
            threshold_days,
        }
    }

    /// Reads the stored health.
    pub fn health(&self) -> SyncHealth {
        SyncHealth {
            last_successful: self.read_time(LAST_SUCCESSFUL_SYNC_KEY),
            last_failed: self.read_time(LAST_FAILED_SYNC_KEY),
            notification_active: self.settings.get_bool(STALE_SYNC_ACTIVE_KEY),
        }
    }

    /// Records the outcome of a cycle that ended at `now`.
    pub fn record_outcome(&self, success: bool, now: DateTime<Utc>) -> HealthUpdate {
        if success {
            self.write_time(LAST_SUCCESSFUL_SYNC_KEY, now);
            let cleared = self.settings.get_bool(STALE_SYNC_ACTIVE_KEY);
            if cleared {
                info!("sync recovered; clearing stale-sync notification");
                self.notifications.clear_notification(STALE_SYNC_NOTIFICATION_ID);
                self.settings.set_bool(STALE_SYNC_ACTIVE_KEY, false);
            }
            return HealthUpdate::Succeeded { cleared };
        }

        let Some(last_successful) = self.read_time(LAST_SUCCESSFUL_SYNC_KEY) else {
            self.write_time(LAST_SUCCESSFUL_SYNC_KEY, now);
            self.write_time(LAST_FAILED_SYNC_KEY, now);
            return HealthUpdate::FirstFailure;
        };

        let previous_failed = self.read_time(LAST_FAILED_SYNC_KEY);
        self.write_time(LAST_FAILED_SYNC_KEY, now);

        if let Some(previous_failed) = previous_failed {
            if previous_failed > last_successful
                && (previous_failed - last_successful).num_days() >= self.threshold_days
            {
                return HealthUpdate::AlreadyRaised;
            }
        }

        if now <= last_successful {
            return HealthUpdate::Failed;
        }

        let days = (now - last_successful).num_days();
        if days < self.threshold_days {
            debug!(days, "sync failed; within stale threshold");
            return HealthUpdate::Failed;
        }

        info!(days, "no successful sync within threshold; raising notification");
        let mut data = BTreeMap::new();
        data.insert(LAST_SUCCESSFUL_SYNC_KEY.to_string(), last_successful.to_rfc3339());
        self.notifications
            .raise_notification(STALE_SYNC_NOTIFICATION_ID, &data);
        self.settings.set_bool(STALE_SYNC_ACTIVE_KEY, true);
        HealthUpdate::Raised
    }

    fn read_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.settings
            .get_i64(key)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    fn write_time(&self, key: &str, time: DateTime<Utc>) {
        self.settings.set_i64(key, Some(time.timestamp()));
    }
}

impl std::fmt::Debug for SyncHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHealthMonitor")
            .field("threshold_days", &self.threshold_days)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::RecordingHooks;
    use crate::memory::MemorySettingsStore;
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::days(n)
    }

    fn monitor() -> (SyncHealthMonitor, Arc<RecordingHooks>) {
        let recorder = Arc::new(RecordingHooks::new());
        let monitor =
            SyncHealthMonitor::new(Arc::new(MemorySettingsStore::new()), recorder.clone(), 14);
        (monitor, recorder)
    }

    #[test]
    fn first_failure_stamps_both() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.health(), SyncHealth::default());

        assert_eq!(monitor.record_outcome(false, day(0)), HealthUpdate::FirstFailure);
        let health = monitor.health();
        assert_eq!(health.last_successful, Some(day(0)));
        assert_eq!(health.last_failed, Some(day(0)));
    }

    #[test]
    fn raised_once_at_threshold_and_cleared_on_success() {
        let (monitor, recorder) = monitor();
        monitor.record_outcome(true, day(0));

        for n in 1..14 {
            assert_eq!(monitor.record_outcome(false, day(n)), HealthUpdate::Failed);
        }
        assert_eq!(recorder.raised(STALE_SYNC_NOTIFICATION_ID), 0);

        assert_eq!(monitor.record_outcome(false, day(14)), HealthUpdate::Raised);
        assert!(monitor.health().notification_active);

        for n in 15..20 {
            assert_eq!(monitor.record_outcome(false, day(n)), HealthUpdate::AlreadyRaised);
        }
        assert_eq!(recorder.raised(STALE_SYNC_NOTIFICATION_ID), 1);

        assert_eq!(
            monitor.record_outcome(true, day(20)),
            HealthUpdate::Succeeded { cleared: true }
        );
        assert_eq!(recorder.cleared(STALE_SYNC_NOTIFICATION_ID), 1);
        assert!(!monitor.health().notification_active);
    }

    #[test]
    fn partial_days_do_not_count() {
        let (monitor, recorder) = monitor();
        monitor.record_outcome(true, day(0));
        let almost = day(14) - Duration::seconds(1);
        assert_eq!(monitor.record_outcome(false, almost), HealthUpdate::Failed);
        assert_eq!(recorder.raised(STALE_SYNC_NOTIFICATION_ID), 0);
    }

    #[test]
    fn first_failure_after_long_gap_raises() {
        let (monitor, recorder) = monitor();
        monitor.record_outcome(true, day(0));
        assert_eq!(monitor.record_outcome(false, day(30)), HealthUpdate::Raised);
        assert_eq!(recorder.raised(STALE_SYNC_NOTIFICATION_ID), 1);
    }

    #[test]
    fn clock_before_last_success_is_ignored() {
        let (monitor, _) = monitor();
        monitor.record_outcome(true, day(10));
        assert_eq!(monitor.record_outcome(false, day(-20)), HealthUpdate::Failed);
    }

    #[test]
    fn success_without_notification_clears_nothing() {
        let (monitor, recorder) = monitor();
        assert_eq!(
            monitor.record_outcome(true, day(0)),
            HealthUpdate::Succeeded { cleared: false }
        );
        assert_eq!(recorder.cleared(STALE_SYNC_NOTIFICATION_ID), 0);
    }
}
