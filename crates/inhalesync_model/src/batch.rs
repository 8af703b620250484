//! Batch container exchanged with the sync gateway.

use crate::records::{DailyFeeling, Device, InhaleEvent, Prescription, ReminderSetting, UserProfile};
use crate::tracking::TrackedRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Records grouped by type, either pending upload or just downloaded.
///
/// A batch belongs to exactly one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Prescriptions.
    pub prescriptions: Vec<Prescription>,
    /// Devices.
    pub devices: Vec<Device>,
    /// Inhale events.
    pub inhale_events: Vec<InhaleEvent>,
    /// Daily feelings.
    pub daily_feelings: Vec<DailyFeeling>,
    /// Reminder settings.
    pub reminder_settings: Vec<ReminderSetting>,
    /// Profiles.
    pub profiles: Vec<UserProfile>,
}

impl SyncBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no list holds a record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of records across all lists.
    pub fn len(&self) -> usize {
        self.counts().total()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.prescriptions.clear();
        self.devices.clear();
        self.inhale_events.clear();
        self.daily_feelings.clear();
        self.reminder_settings.clear();
        self.profiles.clear();
    }

    /// Per-type record counts.
    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            prescriptions: self.prescriptions.len(),
            devices: self.devices.len(),
            inhale_events: self.inhale_events.len(),
            daily_feelings: self.daily_feelings.len(),
            reminder_settings: self.reminder_settings.len(),
            profiles: self.profiles.len(),
        }
    }

    /// Returns the list holding records of type `R`.
    pub fn records<R: BatchMember>(&self) -> &[R] {
        R::list(self)
    }

    /// Appends a record to the list for its type.
    pub fn push<R: BatchMember>(&mut self, record: R) {
        R::list_mut(self).push(record);
    }
}

/// A record type with a dedicated list in [`SyncBatch`].
pub trait BatchMember: TrackedRecord {
    /// Returns the list for this type.
    fn list(batch: &SyncBatch) -> &Vec<Self>;

    /// Returns the list for this type mutably.
    fn list_mut(batch: &mut SyncBatch) -> &mut Vec<Self>;
}

macro_rules! impl_batch_member {
    ($record:ty, $field:ident) => {
        impl BatchMember for $record {
            fn list(batch: &SyncBatch) -> &Vec<Self> {
                &batch.$field
            }

            fn list_mut(batch: &mut SyncBatch) -> &mut Vec<Self> {
                &mut batch.$field
            }
        }
    };
}

impl_batch_member!(Prescription, prescriptions);
impl_batch_member!(Device, devices);
impl_batch_member!(InhaleEvent, inhale_events);
impl_batch_member!(DailyFeeling, daily_feelings);
impl_batch_member!(ReminderSetting, reminder_settings);
impl_batch_member!(UserProfile, profiles);

/// Per-type record counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// Prescriptions.
    pub prescriptions: usize,
    /// Devices.
    pub devices: usize,
    /// Inhale events.
    pub inhale_events: usize,
    /// Daily feelings.
    pub daily_feelings: usize,
    /// Reminder settings.
    pub reminder_settings: usize,
    /// Profiles.
    pub profiles: usize,
}

impl BatchCounts {
    /// Sum of all counts.
    pub fn total(&self) -> usize {
        self.prescriptions
            + self.devices
            + self.inhale_events
            + self.daily_feelings
            + self.reminder_settings
            + self.profiles
    }
}

impl fmt::Display for BatchCounts {
    /// Formats only the non-zero counts, e.g. `2 device(s); 5 inhale event(s)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            (self.prescriptions, "prescription(s)"),
            (self.devices, "device(s)"),
            (self.inhale_events, "inhale event(s)"),
            (self.daily_feelings, "daily feeling(s)"),
            (self.reminder_settings, "setting(s)"),
            (self.profiles, "profile(s)"),
        ];

        let mut first = true;
        for (count, label) in parts.iter().filter(|(count, _)| *count > 0) {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{count} {label}")?;
            first = false;
        }

        if first {
            f.write_str("empty")?;
        }
        Ok(())
    }
}
