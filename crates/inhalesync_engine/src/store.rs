//! Datastore seams: per-type repositories, the settings store, and the
//! global write section.

use crate::error::SyncResult;
use inhalesync_model::{
    BatchMember, DailyFeeling, Device, InhaleEvent, Prescription, ReminderSetting, UserProfile,
};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// A change-tracked repository for one record type.
///
/// Implemented by the host's datastore. The engine only reads records and
/// resets their dirty flag, except during merge where it inserts and updates
/// downloaded records.
pub trait Repository<R: BatchMember>: Send + Sync {
    /// Returns every record with `has_changed` set.
    fn get_all_changed(&self) -> SyncResult<Vec<R>>;

    /// Returns every record.
    fn get_all(&self) -> SyncResult<Vec<R>>;

    /// Looks a record up by identity key.
    fn get(&self, key: &R::Key) -> SyncResult<Option<R>>;

    /// Inserts a record, setting its dirty flag to `mark_dirty`.
    fn insert(&self, record: R, mark_dirty: bool) -> SyncResult<()>;

    /// Replaces the record with the same key, setting its dirty flag to
    /// `mark_dirty`.
    fn update(&self, record: R, mark_dirty: bool) -> SyncResult<()>;

    /// Persists `record` with its dirty flag set to `dirty`.
    ///
    /// The other tracking fields, notably a freshly stamped server offset,
    /// are persisted as given.
    fn reset_dirty_flag(&self, record: &R, dirty: bool) -> SyncResult<()>;
}

/// The repositories for every synced record type.
#[derive(Clone)]
pub struct Repositories {
    /// Prescriptions.
    pub prescriptions: Arc<dyn Repository<Prescription>>,
    /// Devices.
    pub devices: Arc<dyn Repository<Device>>,
    /// Inhale events.
    pub inhale_events: Arc<dyn Repository<InhaleEvent>>,
    /// Daily feelings.
    pub daily_feelings: Arc<dyn Repository<DailyFeeling>>,
    /// Reminder settings.
    pub reminder_settings: Arc<dyn Repository<ReminderSetting>>,
    /// Profiles.
    pub profiles: Arc<dyn Repository<UserProfile>>,
}

impl Repositories {
    /// Returns the repository for records of type `R`.
    pub fn of<R: StoredRecord>(&self) -> &dyn Repository<R> {
        R::repository(self)
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

/// A record type with a repository in [`Repositories`].
pub trait StoredRecord: BatchMember {
    /// Selects the repository for this type.
    fn repository(repositories: &Repositories) -> &dyn Repository<Self>;
}

macro_rules! impl_stored_record {
    ($record:ty, $field:ident) => {
        impl StoredRecord for $record {
            fn repository(repositories: &Repositories) -> &dyn Repository<Self> {
                repositories.$field.as_ref()
            }
        }
    };
}

impl_stored_record!(Prescription, prescriptions);
impl_stored_record!(Device, devices);
impl_stored_record!(InhaleEvent, inhale_events);
impl_stored_record!(DailyFeeling, daily_feelings);
impl_stored_record!(ReminderSetting, reminder_settings);
impl_stored_record!(UserProfile, profiles);

/// Key-value settings that survive application restarts.
pub trait SettingsStore: Send + Sync {
    /// Reads an integer entry.
    fn get_i64(&self, key: &str) -> Option<i64>;

    /// Writes an integer entry; `None` removes it.
    fn set_i64(&self, key: &str, value: Option<i64>);

    /// Reads a boolean entry, absent meaning false.
    fn get_bool(&self, key: &str) -> bool {
        self.get_i64(key).is_some_and(|value| value != 0)
    }

    /// Writes a boolean entry.
    fn set_bool(&self, key: &str, value: bool) {
        self.set_i64(key, Some(i64::from(value)));
    }
}

/// The single critical section shared by every writer of the datastore.
///
/// A collection pass touches several repositories and must appear atomic to
/// other writers, so per-repository locks are not enough. The section is
/// re-entrant: hooks invoked while it is held may write through it again.
#[derive(Clone, Default)]
pub struct WriteSection {
    lock: Arc<ReentrantMutex<()>>,
}

impl WriteSection {
    /// Creates a new, unshared write section.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the section until the guard is dropped.
    pub fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Runs `f` inside the section.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    /// Returns true if some thread is inside the section.
    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }
}

impl std::fmt::Debug for WriteSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSection")
            .field("held", &self.is_held())
            .finish()
    }
}
