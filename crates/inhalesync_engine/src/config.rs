//! Configuration for the sync engine.

use chrono::Duration;

/// Name of the reminder setting that only exists on the device.
pub const GOOD_INHALATION_FEEDBACK_SETTING: &str =
    "InhalationsFeedbackTurnOffGoodInhalationNotification";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Added to the upload cutoff so records written during the upload itself
    /// are not rejected as future-dated.
    pub upload_tolerance: Duration,
    /// Whole days without a successful sync before the stale-sync alert.
    pub stale_sync_threshold_days: i64,
    /// How much newer a downloaded dependent profile must be before its
    /// program list is refreshed.
    pub program_refresh_tolerance: Duration,
    /// Largest offset, in seconds, considered a healthy clock.
    pub max_acceptable_offset_secs: i64,
    /// Inhale event count above which a batch is reported as large.
    pub monitored_inhale_event_count: usize,
    /// Offset stamped when no server offset has ever been determined.
    pub unknown_offset: i64,
    /// Reminder settings that never leave the device.
    pub device_local_settings: Vec<String>,
}

impl SyncConfig {
    /// Creates a configuration with the production defaults.
    pub fn new() -> Self {
        Self {
            upload_tolerance: Duration::seconds(5),
            stale_sync_threshold_days: 14,
            program_refresh_tolerance: Duration::seconds(5),
            max_acceptable_offset_secs: 60,
            monitored_inhale_event_count: 100,
            unknown_offset: 999_999_999,
            device_local_settings: vec![GOOD_INHALATION_FEEDBACK_SETTING.to_string()],
        }
    }

    /// Sets the upload forward tolerance.
    pub fn with_upload_tolerance(mut self, tolerance: Duration) -> Self {
        self.upload_tolerance = tolerance;
        self
    }

    /// Sets the stale-sync threshold in days.
    pub fn with_stale_sync_threshold_days(mut self, days: i64) -> Self {
        self.stale_sync_threshold_days = days;
        self
    }

    /// Sets the program refresh tolerance.
    pub fn with_program_refresh_tolerance(mut self, tolerance: Duration) -> Self {
        self.program_refresh_tolerance = tolerance;
        self
    }

    /// Sets the maximum acceptable offset.
    pub fn with_max_acceptable_offset_secs(mut self, secs: i64) -> Self {
        self.max_acceptable_offset_secs = secs;
        self
    }

    /// Sets the large inhale batch threshold.
    pub fn with_monitored_inhale_event_count(mut self, count: usize) -> Self {
        self.monitored_inhale_event_count = count;
        self
    }

    /// Replaces the device-local reminder settings.
    pub fn with_device_local_settings<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_local_settings = names.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the named reminder setting is never uploaded.
    pub fn is_device_local_setting(&self, name: &str) -> bool {
        self.device_local_settings.iter().any(|local| local == name)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.upload_tolerance, Duration::seconds(5));
        assert_eq!(config.stale_sync_threshold_days, 14);
        assert_eq!(config.max_acceptable_offset_secs, 60);
        assert_eq!(config.monitored_inhale_event_count, 100);
        assert!(config.is_device_local_setting(GOOD_INHALATION_FEEDBACK_SETTING));
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_upload_tolerance(Duration::seconds(2))
            .with_stale_sync_threshold_days(3)
            .with_device_local_settings(["a", "b"]);

        assert_eq!(config.upload_tolerance, Duration::seconds(2));
        assert_eq!(config.stale_sync_threshold_days, 3);
        assert!(config.is_device_local_setting("b"));
        assert!(!config.is_device_local_setting(GOOD_INHALATION_FEEDBACK_SETTING));
    }
}
