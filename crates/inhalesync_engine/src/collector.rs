//! Change-set collection.
//!
//! Walks every repository for dirty records, stamps the current server time
//! offset on records that have none, and moves records that are due into the
//! upload batch. A record whose change time lies after the upload cutoff was
//! written under a clock running ahead of the server; it stays dirty and is
//! picked up by a later cycle.

use crate::config::SyncConfig;
use crate::store::{Repositories, StoredRecord, WriteSection};
use chrono::{DateTime, Utc};
use inhalesync_model::{
    DailyFeeling, Device, InhaleEvent, Prescription, ReminderSetting, SyncBatch, UserProfile,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collects locally changed records into upload batches.
#[derive(Debug)]
pub struct ChangeSetCollector {
    repositories: Repositories,
    config: Arc<SyncConfig>,
    write_section: WriteSection,
}

impl ChangeSetCollector {
    /// Creates a collector over `repositories`.
    pub fn new(
        repositories: Repositories,
        config: Arc<SyncConfig>,
        write_section: WriteSection,
    ) -> Self {
        Self {
            repositories,
            config,
            write_section,
        }
    }

    /// Latest change time accepted for upload.
    ///
    /// Server time advanced by the time elapsed since the cycle started, plus
    /// the forward tolerance. Without a server time, local now.
    pub fn upload_cutoff(
        &self,
        server_time: Option<DateTime<Utc>>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match server_time {
            Some(server_time) => server_time + (now - started_at) + self.config.upload_tolerance,
            None => now,
        }
    }

    /// Collects every record due at `cutoff` into a new batch.
    ///
    /// Due records have their dirty flag reset before they join the batch;
    /// if the upload fails, [`restore_dirty_flags`](Self::restore_dirty_flags)
    /// marks them dirty again.
    pub fn collect(&self, offset: i64, cutoff: DateTime<Utc>, first_sync: bool) -> SyncBatch {
        let mut batch = SyncBatch::new();
        let stamped = self
            .write_section
            .run(|| self.walk(offset, Some(cutoff), first_sync, &mut batch));
        debug!(%cutoff, offset, stamped, collected = %batch.counts(), "collected changes");
        batch
    }

    /// Stamps `offset` on every dirty record lacking one, uploading nothing.
    ///
    /// Returns the number of records stamped.
    pub fn stamp_offsets(&self, offset: i64) -> usize {
        let mut discarded = SyncBatch::new();
        let stamped = self
            .write_section
            .run(|| self.walk(offset, None, false, &mut discarded));
        debug!(offset, stamped, "stamped pending offsets");
        stamped
    }

    /// Marks every record in `batch` dirty again.
    ///
    /// Returns the number of records restored.
    pub fn restore_dirty_flags(&self, batch: &SyncBatch) -> usize {
        self.write_section.run(|| {
            self.restore::<Prescription>(batch)
                + self.restore::<Device>(batch)
                + self.restore::<InhaleEvent>(batch)
                + self.restore::<DailyFeeling>(batch)
                + self.restore::<ReminderSetting>(batch)
                + self.restore::<UserProfile>(batch)
        })
    }

    fn walk(
        &self,
        offset: i64,
        cutoff: Option<DateTime<Utc>>,
        first_sync: bool,
        batch: &mut SyncBatch,
    ) -> usize {
        self.collect_changed::<Prescription>(offset, cutoff, batch)
            + self.collect_changed::<Device>(offset, cutoff, batch)
            + self.collect_changed::<InhaleEvent>(offset, cutoff, batch)
            + self.collect_changed::<DailyFeeling>(offset, cutoff, batch)
            + self.collect_reminder_settings(offset, cutoff, first_sync, batch)
            + self.collect_changed::<UserProfile>(offset, cutoff, batch)
    }

    /// Returns the number of records newly stamped.
    fn collect_changed<R: StoredRecord>(
        &self,
        offset: i64,
        cutoff: Option<DateTime<Utc>>,
        batch: &mut SyncBatch,
    ) -> usize {
        let repository = self.repositories.of::<R>();
        let changed = match repository.get_all_changed() {
            Ok(changed) => changed,
            Err(err) => {
                warn!(kind = %R::KIND, error = %err, "failed to read changed records");
                return 0;
            }
        };

        let mut stamped = 0;
        for mut record in changed {
            let newly_stamped = record.tracking_mut().stamp_offset(offset);
            let due = cutoff.is_some_and(|cutoff| record.tracking().is_due(cutoff));

            if due {
                match repository.reset_dirty_flag(&record, false) {
                    Ok(()) => {
                        record.tracking_mut().has_changed = false;
                        batch.push(record);
                    }
                    Err(err) => {
                        warn!(kind = %R::KIND, key = ?record.key(), error = %err, "failed to reset dirty flag");
                        continue;
                    }
                }
            } else if newly_stamped {
                if let Err(err) = repository.reset_dirty_flag(&record, true) {
                    warn!(kind = %R::KIND, key = ?record.key(), error = %err, "failed to persist offset");
                    continue;
                }
            } else {
                debug!(kind = %R::KIND, key = ?record.key(), "change not yet due");
            }

            if newly_stamped {
                stamped += 1;
            }
        }
        stamped
    }

    /// Reminder settings travel as a complete set.
    fn collect_reminder_settings(
        &self,
        offset: i64,
        cutoff: Option<DateTime<Utc>>,
        first_sync: bool,
        batch: &mut SyncBatch,
    ) -> usize {
        let repository = &self.repositories.reminder_settings;
        let settings: Vec<ReminderSetting> = match repository.get_all() {
            Ok(settings) => settings
                .into_iter()
                .filter(|setting| !self.config.is_device_local_setting(&setting.name))
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to read reminder settings");
                return 0;
            }
        };

        if !settings.iter().any(|setting| setting.tracking.has_changed) {
            return 0;
        }

        let unstamped = settings
            .iter()
            .filter(|setting| setting.tracking.server_time_offset.is_none())
            .count();
        let send_all = cutoff.is_some_and(|cutoff| {
            first_sync
                || unstamped > 0
                || settings.iter().all(|setting| setting.tracking.is_due(cutoff))
        });

        if !send_all {
            for mut setting in settings {
                if setting.tracking.stamp_offset(offset) {
                    let dirty = setting.tracking.has_changed;
                    if let Err(err) = repository.reset_dirty_flag(&setting, dirty) {
                        warn!(name = %setting.name, error = %err, "failed to persist offset");
                    }
                }
            }
            return unstamped;
        }

        let mut sent: Vec<(ReminderSetting, bool)> = Vec::with_capacity(settings.len());
        for mut setting in settings {
            let was_dirty = setting.tracking.has_changed;
            setting.tracking.stamp_offset(offset);
            if let Err(err) = repository.reset_dirty_flag(&setting, false) {
                warn!(name = %setting.name, error = %err, "withholding reminder settings");
                for (setting, was_dirty) in &sent {
                    if let Err(err) = repository.reset_dirty_flag(setting, *was_dirty) {
                        warn!(name = %setting.name, error = %err, "failed to restore dirty flag");
                    }
                }
                return 0;
            }
            setting.tracking.has_changed = false;
            sent.push((setting, was_dirty));
        }

        batch
            .reminder_settings
            .extend(sent.into_iter().map(|(setting, _)| setting));
        unstamped
    }

    fn restore<R: StoredRecord>(&self, batch: &SyncBatch) -> usize {
        let repository = self.repositories.of::<R>();
        let mut restored = 0;
        for record in batch.records::<R>() {
            match repository.reset_dirty_flag(record, true) {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(kind = %R::KIND, key = ?record.key(), error = %err, "failed to restore dirty flag");
                }
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GOOD_INHALATION_FEEDBACK_SETTING;
    use crate::memory::MemoryStores;
    use chrono::{Duration, TimeZone};
    use inhalesync_model::{ChangeTracking, TrackedRecord};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn collector(stores: &MemoryStores) -> ChangeSetCollector {
        ChangeSetCollector::new(
            stores.repositories(),
            Arc::new(SyncConfig::default()),
            WriteSection::new(),
        )
    }

    fn device(serial: &str, tracking: ChangeTracking) -> Device {
        let mut device = Device::new(serial, "albuterol");
        device.tracking = tracking;
        device
    }

    fn setting(name: &str, tracking: ChangeTracking) -> ReminderSetting {
        let mut setting = ReminderSetting::new(name, true);
        setting.tracking = tracking;
        setting
    }

    #[test]
    fn cutoff_tracks_server_time() {
        let stores = MemoryStores::new();
        let collector = collector(&stores);

        let cutoff = collector.upload_cutoff(Some(at(100)), at(0), at(30));
        assert_eq!(cutoff, at(135));
        assert_eq!(collector.upload_cutoff(None, at(0), at(30)), at(30));
    }

    #[test]
    fn due_records_join_batch_clean() {
        let stores = MemoryStores::new();
        stores.devices.put(device("SN-1", ChangeTracking::changed_at(at(0))));
        stores.devices.put(device("SN-2", ChangeTracking::clean(at(0))));

        let batch = collector(&stores).collect(42, at(10), false);

        assert_eq!(batch.devices.len(), 1);
        assert!(!batch.devices[0].has_changed());
        assert_eq!(batch.devices[0].tracking.server_time_offset, Some(42));

        let stored = stores.devices.find(&"SN-1".to_string()).unwrap();
        assert!(!stored.has_changed());
        assert_eq!(stored.tracking.server_time_offset, Some(42));
    }

    #[test]
    fn future_records_stay_dirty_with_offset() {
        let stores = MemoryStores::new();
        let mut prescription = Prescription::new("budesonide", at(0));
        prescription.tracking = ChangeTracking::changed_at(at(600));
        stores.prescriptions.put(prescription.clone());

        let batch = collector(&stores).collect(-5, at(10), false);

        assert!(batch.is_empty());
        let stored = stores.prescriptions.find(&prescription.key()).unwrap();
        assert!(stored.has_changed());
        assert_eq!(stored.tracking.server_time_offset, Some(-5));
    }

    #[test]
    fn existing_offset_is_kept() {
        let stores = MemoryStores::new();
        let mut tracking = ChangeTracking::changed_at(at(0));
        tracking.server_time_offset = Some(7);
        stores.devices.put(device("SN-1", tracking));

        let batch = collector(&stores).collect(42, at(10), false);
        assert_eq!(batch.devices[0].tracking.server_time_offset, Some(7));
    }

    #[test]
    fn failed_reset_leaves_record_dirty() {
        let stores = MemoryStores::new();
        stores.devices.put(device("SN-1", ChangeTracking::changed_at(at(0))));
        stores.devices.set_fail_writes(true);

        let batch = collector(&stores).collect(0, at(10), false);

        assert!(batch.is_empty());
        assert!(stores.devices.find(&"SN-1".to_string()).unwrap().has_changed());
    }

    #[test]
    fn restore_marks_batch_dirty() {
        let stores = MemoryStores::new();
        stores.devices.put(device("SN-1", ChangeTracking::changed_at(at(0))));
        stores.devices.put(device("SN-2", ChangeTracking::changed_at(at(1))));
        let collector = collector(&stores);

        let batch = collector.collect(0, at(10), false);
        assert_eq!(stores.dirty_count(), 0);

        assert_eq!(collector.restore_dirty_flags(&batch), 2);
        assert_eq!(stores.dirty_count(), 2);
        let stored = stores.devices.find(&"SN-1".to_string()).unwrap();
        assert_eq!(stored.tracking.server_time_offset, Some(0));
    }

    #[test]
    fn stamp_offsets_uploads_nothing() {
        let stores = MemoryStores::new();
        stores.devices.put(device("SN-1", ChangeTracking::changed_at(at(0))));

        let stamped = collector(&stores).stamp_offsets(999_999_999);

        assert_eq!(stamped, 1);
        let stored = stores.devices.find(&"SN-1".to_string()).unwrap();
        assert!(stored.has_changed());
        assert_eq!(stored.tracking.server_time_offset, Some(999_999_999));
    }

    #[test]
    fn clean_reminder_settings_are_not_sent() {
        let stores = MemoryStores::new();
        stores.reminder_settings.put(setting("morning", ChangeTracking::clean(at(0))));

        let batch = collector(&stores).collect(0, at(10), true);
        assert!(batch.reminder_settings.is_empty());
    }

    #[test]
    fn reminder_settings_sent_as_complete_set() {
        let stores = MemoryStores::new();
        let mut clean = ChangeTracking::clean(at(0));
        clean.server_time_offset = Some(1);
        let mut dirty = ChangeTracking::changed_at(at(5));
        dirty.server_time_offset = Some(1);
        stores.reminder_settings.put(setting("morning", clean));
        stores.reminder_settings.put(setting("evening", dirty));

        let batch = collector(&stores).collect(0, at(10), false);

        assert_eq!(batch.reminder_settings.len(), 2);
        assert!(stores.reminder_settings.snapshot().iter().all(|s| !s.has_changed()));
    }

    #[test]
    fn reminder_settings_withheld_until_all_due() {
        let stores = MemoryStores::new();
        let mut due = ChangeTracking::changed_at(at(0));
        due.server_time_offset = Some(1);
        let mut future = ChangeTracking::changed_at(at(600));
        future.server_time_offset = Some(1);
        stores.reminder_settings.put(setting("morning", due));
        stores.reminder_settings.put(setting("evening", future));

        let batch = collector(&stores).collect(0, at(10), false);

        assert!(batch.reminder_settings.is_empty());
        assert!(stores
            .reminder_settings
            .find(&"morning".to_string())
            .unwrap()
            .has_changed());
    }

    #[test]
    fn unstamped_reminder_setting_sends_all() {
        let stores = MemoryStores::new();
        let mut future = ChangeTracking::changed_at(at(600));
        future.server_time_offset = Some(1);
        stores.reminder_settings.put(setting("morning", ChangeTracking::changed_at(at(0))));
        stores.reminder_settings.put(setting("evening", future));

        let batch = collector(&stores).collect(3, at(10), false);

        assert_eq!(batch.reminder_settings.len(), 2);
        let morning = stores.reminder_settings.find(&"morning".to_string()).unwrap();
        assert_eq!(morning.tracking.server_time_offset, Some(3));
    }

    #[test]
    fn device_local_setting_never_sent() {
        let stores = MemoryStores::new();
        stores
            .reminder_settings
            .put(setting(GOOD_INHALATION_FEEDBACK_SETTING, ChangeTracking::changed_at(at(0))));

        let batch = collector(&stores).collect(0, at(10), true);

        assert!(batch.reminder_settings.is_empty());
        assert!(stores
            .reminder_settings
            .find(&GOOD_INHALATION_FEEDBACK_SETTING.to_string())
            .unwrap()
            .has_changed());
    }

    #[test]
    fn upload_tolerance_admits_near_future() {
        let stores = MemoryStores::new();
        stores.devices.put(device("SN-1", ChangeTracking::changed_at(at(104))));
        let collector = collector(&stores);

        let cutoff = collector.upload_cutoff(Some(at(100)), at(0), at(0));
        assert_eq!(cutoff - at(100), Duration::seconds(5));
        assert_eq!(collector.collect(0, cutoff, false).devices.len(), 1);
    }
}
