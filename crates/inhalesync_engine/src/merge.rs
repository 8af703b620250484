//! Merging downloaded records into the local datastore.
//!
//! Last writer wins: a downloaded record replaces the local copy only when its
//! change time is strictly later. Ties keep the local record. Merged records are
//! stored clean, so merging the same batch twice has the effect of merging once.

use crate::clock::AppClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::hooks::SyncHooks;
use crate::store::{Repositories, StoredRecord, WriteSection};
use inhalesync_model::{InhaleEvent, ReminderSetting, SyncBatch, TrackedRecord, UserProfile};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one downloaded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local copy existed; the record was inserted.
    Inserted,
    /// The local copy was older and was replaced.
    Updated,
    /// The local copy was at least as recent and was kept.
    Discarded,
}

/// Totals for one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Records inserted.
    pub inserted: usize,
    /// Records that replaced an older local copy.
    pub updated: usize,
    /// Records older than or as old as the local copy.
    pub discarded: usize,
    /// Inhale events whose device is not stored locally.
    pub dropped_events: usize,
    /// Records skipped because a repository call failed.
    pub failed: usize,
}

impl MergeReport {
    /// Total number of downloaded records considered.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.discarded + self.dropped_events + self.failed
    }

    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Discarded => self.discarded += 1,
        }
    }
}

impl AddAssign for MergeReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.discarded += other.discarded;
        self.dropped_events += other.dropped_events;
        self.failed += other.failed;
    }
}

/// Applies downloaded batches to the local repositories.
pub struct MergeResolver {
    repositories: Repositories,
    hooks: SyncHooks,
    config: Arc<SyncConfig>,
    clock: Arc<dyn AppClock>,
    write_section: WriteSection,
}

impl std::fmt::Debug for MergeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeResolver")
            .field("repositories", &self.repositories)
            .field("hooks", &self.hooks)
            .field("config", &self.config)
            .field("write_section", &self.write_section)
            .finish_non_exhaustive()
    }
}

impl MergeResolver {
    /// Creates a resolver.
    pub fn new(
        repositories: Repositories,
        hooks: SyncHooks,
        config: Arc<SyncConfig>,
        clock: Arc<dyn AppClock>,
        write_section: WriteSection,
    ) -> Self {
        Self {
            repositories,
            hooks,
            config,
            clock,
            write_section,
        }
    }

    /// Merges every record in `batch`.
    ///
    /// `first_sync` gives the server's reminder settings and account owner
    /// special treatment; see the per-type rules.
    pub fn merge(&self, batch: &SyncBatch, first_sync: bool) -> MergeReport {
        let mut report = MergeReport::default();
        let mut devices_added = false;
        let mut refresh = Vec::new();

        self.write_section.run(|| {
            self.merge_all(&batch.prescriptions, &mut report);

            let before = report.inserted;
            self.merge_all(&batch.devices, &mut report);
            devices_added = report.inserted > before;

            self.merge_inhale_events(&batch.inhale_events, &mut report);
            self.merge_all(&batch.daily_feelings, &mut report);
            self.merge_reminder_settings(&batch.reminder_settings, first_sync, &mut report);
            refresh = self.merge_profiles(&batch.profiles, first_sync, &mut report);
        });

        if devices_added {
            self.hooks.devices.on_devices_changed();
        }
        for profile_id in &refresh {
            self.hooks.programs.refresh_program_list(profile_id);
        }

        if !batch.is_empty() {
            info!(
                downloaded = %batch.counts(),
                inserted = report.inserted,
                updated = report.updated,
                discarded = report.discarded,
                dropped_events = report.dropped_events,
                "merged download"
            );
        }
        report
    }

    fn merge_all<R: StoredRecord>(&self, records: &[R], report: &mut MergeReport) {
        for record in records {
            match self.apply_by_recency(record.clone()) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(kind = %R::KIND, key = ?record.key(), error = %err, "failed to merge record");
                    report.failed += 1;
                }
            }
        }
    }

    /// Inserts, updates or discards one downloaded record.
    pub fn apply_by_recency<R: StoredRecord>(&self, mut remote: R) -> SyncResult<MergeOutcome> {
        let repository = self.repositories.of::<R>();
        remote.tracking_mut().has_changed = false;

        match repository.get(&remote.key())? {
            None => {
                debug!(kind = %R::KIND, key = ?remote.key(), "insert");
                repository.insert(remote, false)?;
                Ok(MergeOutcome::Inserted)
            }
            Some(local) if remote.tracking().is_newer_than(local.tracking()) => {
                debug!(kind = %R::KIND, key = ?remote.key(), "update");
                repository.update(remote, false)?;
                Ok(MergeOutcome::Updated)
            }
            Some(_) => Ok(MergeOutcome::Discarded),
        }
    }

    fn merge_inhale_events(&self, events: &[InhaleEvent], report: &mut MergeReport) {
        for event in events {
            match self.repositories.devices.get(&event.device_serial_number) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let err = SyncError::MissingDevice {
                        serial_number: event.device_serial_number.clone(),
                        event_uid: event.event_uid,
                    };
                    error!(error = %err, "dropping inhale event");
                    report.dropped_events += 1;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "failed to look up device for inhale event");
                    report.failed += 1;
                    continue;
                }
            }

            match self.apply_by_recency(event.clone()) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(key = ?event.key(), error = %err, "failed to merge inhale event");
                    report.failed += 1;
                }
            }
        }
    }

    /// Reminder settings are matched by name and handed to the scheduler.
    fn merge_reminder_settings(
        &self,
        settings: &[ReminderSetting],
        first_sync: bool,
        report: &mut MergeReport,
    ) {
        let repository = &self.repositories.reminder_settings;
        for setting in settings {
            if self.config.is_device_local_setting(&setting.name) {
                debug!(name = %setting.name, "ignoring device-local setting");
                report.discarded += 1;
                continue;
            }

            let merged = match repository.get(&setting.name) {
                Ok(Some(mut local)) => {
                    if !(first_sync || setting.tracking.is_newer_than(&local.tracking)) {
                        report.discarded += 1;
                        continue;
                    }
                    local.is_enabled = setting.is_enabled;
                    local.time_of_day = setting.time_of_day;
                    local.tracking.change_time = setting.tracking.change_time;
                    local.tracking.has_changed = false;
                    repository.update(local, false).map(|()| MergeOutcome::Updated)
                }
                Ok(None) => {
                    let mut remote = setting.clone();
                    remote.tracking.has_changed = false;
                    repository.insert(remote, false).map(|()| MergeOutcome::Inserted)
                }
                Err(err) => Err(err),
            };

            match merged {
                Ok(outcome) => {
                    debug!(name = %setting.name, enabled = setting.is_enabled, "reminder setting merged");
                    report.record(outcome);
                    self.hooks
                        .reminders
                        .apply_reminder_state(&setting.name, setting.is_enabled);
                }
                Err(err) => {
                    warn!(name = %setting.name, error = %err, "failed to merge reminder setting");
                    report.failed += 1;
                }
            }
        }
    }

    /// Returns the dependents whose program lists need refreshing.
    fn merge_profiles(
        &self,
        profiles: &[UserProfile],
        first_sync: bool,
        report: &mut MergeReport,
    ) -> Vec<String> {
        if let Some(remote_owner) = profiles.iter().find(|profile| profile.is_account_owner) {
            match self.merge_account_owner(remote_owner, first_sync) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(error = %err, "failed to merge account owner");
                    report.failed += 1;
                }
            }
        }

        let mut refresh = Vec::new();
        for dependent in profiles.iter().filter(|profile| !profile.is_account_owner) {
            let local = match self.repositories.profiles.get(&dependent.profile_id) {
                Ok(local) => local,
                Err(err) => {
                    warn!(profile_id = %dependent.profile_id, error = %err, "failed to read profile");
                    report.failed += 1;
                    continue;
                }
            };

            let stale = match (&local, dependent.tracking.change_time) {
                (Some(local), Some(remote_time)) => {
                    local.tracking.change_time.is_none_or(|local_time| {
                        remote_time > local_time + self.config.program_refresh_tolerance
                    })
                }
                _ => false,
            };

            match self.apply_by_recency(dependent.clone()) {
                Ok(outcome) => {
                    if stale && outcome == MergeOutcome::Updated {
                        refresh.push(dependent.profile_id.clone());
                    }
                    report.record(outcome);
                }
                Err(err) => {
                    warn!(profile_id = %dependent.profile_id, error = %err, "failed to merge profile");
                    report.failed += 1;
                }
            }
        }
        refresh
    }

    /// The account owner's date of birth is the only field reconciled here.
    ///
    /// On first sync a differing local value is pushed up by recording a fresh
    /// local change; afterwards the server's value is taken.
    fn merge_account_owner(
        &self,
        remote: &UserProfile,
        first_sync: bool,
    ) -> SyncResult<MergeOutcome> {
        let repository = &self.repositories.profiles;
        let local = repository
            .get_all()?
            .into_iter()
            .find(|profile| profile.is_account_owner);

        let Some(mut local) = local else {
            debug!("no local account owner; skipping owner merge");
            return Ok(MergeOutcome::Discarded);
        };

        if local.date_of_birth == remote.date_of_birth {
            return Ok(MergeOutcome::Discarded);
        }

        if first_sync {
            debug!(profile_id = %local.profile_id, "pushing local date of birth");
            local.tracking.touch(self.clock.now());
            repository.update(local, true)?;
            Ok(MergeOutcome::Discarded)
        } else {
            debug!(profile_id = %local.profile_id, "taking server date of birth");
            local.date_of_birth = remote.date_of_birth;
            local.tracking.has_changed = false;
            repository.update(local, false)?;
            Ok(MergeOutcome::Updated)
        }
    }
}
