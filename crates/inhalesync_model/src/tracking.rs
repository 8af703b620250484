//! Change tracking shared by all synced records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// The kind of a synced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A medication prescription.
    Prescription,
    /// A connected inhaler.
    Device,
    /// An inhalation recorded by an inhaler.
    InhaleEvent,
    /// A daily self-assessment.
    DailyFeeling,
    /// A reminder on/off setting.
    ReminderSetting,
    /// An account owner or dependent profile.
    UserProfile,
}

impl RecordKind {
    /// All kinds, in upload order.
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Prescription,
        RecordKind::Device,
        RecordKind::InhaleEvent,
        RecordKind::DailyFeeling,
        RecordKind::ReminderSetting,
        RecordKind::UserProfile,
    ];

    /// Returns a short lowercase name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Prescription => "prescription",
            RecordKind::Device => "device",
            RecordKind::InhaleEvent => "inhale event",
            RecordKind::DailyFeeling => "daily feeling",
            RecordKind::ReminderSetting => "reminder setting",
            RecordKind::UserProfile => "profile",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Change-tracking fields carried by every synced record.
///
/// A record with `has_changed` set must have a `change_time`. The
/// `server_time_offset` stays `None` until the engine stamps the offset that
/// was current when the change was collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTracking {
    /// When the record was last mutated, on the application clock.
    pub change_time: Option<DateTime<Utc>>,
    /// Whether the record has local changes not yet uploaded.
    pub has_changed: bool,
    /// Seconds added to local time to get server time when the change was made.
    pub server_time_offset: Option<i64>,
}

impl ChangeTracking {
    /// Creates tracking for a record that is in sync with the server.
    pub fn clean(change_time: DateTime<Utc>) -> Self {
        Self {
            change_time: Some(change_time),
            has_changed: false,
            server_time_offset: None,
        }
    }

    /// Creates tracking for a record changed locally at `change_time`.
    pub fn changed_at(change_time: DateTime<Utc>) -> Self {
        Self {
            change_time: Some(change_time),
            has_changed: true,
            server_time_offset: None,
        }
    }

    /// Records a local mutation.
    ///
    /// The previous offset no longer describes this change, so it is cleared
    /// and the next collection pass stamps a fresh one.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.change_time = Some(at);
        self.has_changed = true;
        self.server_time_offset = None;
    }

    /// Stamps `offset` if no offset has been recorded yet.
    ///
    /// Returns true if the offset was newly assigned.
    pub fn stamp_offset(&mut self, offset: i64) -> bool {
        if self.server_time_offset.is_some() {
            return false;
        }
        self.server_time_offset = Some(offset);
        true
    }

    /// Returns true if the change is not later than `cutoff`.
    ///
    /// A record without a change time is never due.
    pub fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        self.change_time.is_some_and(|time| time <= cutoff)
    }

    /// Returns true if this change is strictly more recent than `other`.
    ///
    /// A missing change time on `other` loses to any known time; a missing
    /// change time on `self` never wins.
    pub fn is_newer_than(&self, other: &ChangeTracking) -> bool {
        match (self.change_time, other.change_time) {
            (Some(mine), Some(theirs)) => mine > theirs,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// A record type the sync engine can collect, upload and merge.
pub trait TrackedRecord: Clone + fmt::Debug + Send + Sync + 'static {
    /// Identity key used to find the local copy of a downloaded record.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync;

    /// The kind of this record.
    const KIND: RecordKind;

    /// Returns the identity key.
    fn key(&self) -> Self::Key;

    /// Returns the change-tracking fields.
    fn tracking(&self) -> &ChangeTracking;

    /// Returns the change-tracking fields mutably.
    fn tracking_mut(&mut self) -> &mut ChangeTracking;

    /// Records a local mutation at `at`.
    fn touch(&mut self, at: DateTime<Utc>) {
        self.tracking_mut().touch(at);
    }

    /// Returns true if the record has local changes.
    fn has_changed(&self) -> bool {
        self.tracking().has_changed
    }

    /// Returns the last change time.
    fn change_time(&self) -> Option<DateTime<Utc>> {
        self.tracking().change_time
    }
}
