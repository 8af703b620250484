//! In-memory repositories and settings store.

use crate::error::{SyncError, SyncResult};
use crate::store::{Repositories, Repository, SettingsStore};
use inhalesync_model::{
    BatchMember, DailyFeeling, Device, InhaleEvent, Prescription, ReminderSetting, UserProfile,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory repository.
///
/// Records are kept in insertion order. Suitable for tests, demos, and
/// hosts that keep their datastore elsewhere and mirror it here.
#[derive(Debug)]
pub struct MemoryRepository<R: BatchMember> {
    records: RwLock<Vec<R>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl<R: BatchMember> MemoryRepository<R> {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Stores `record` as-is, replacing any record with the same key.
    ///
    /// This is the host-side write path; it does not touch the dirty flag.
    pub fn put(&self, record: R) {
        let key = record.key();
        let mut records = self.records.write();
        match records.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Returns the stored record with the given key.
    pub fn find(&self, key: &R::Key) -> Option<R> {
        self.records
            .read()
            .iter()
            .find(|record| &record.key() == key)
            .cloned()
    }

    /// Returns a copy of every stored record.
    pub fn snapshot(&self) -> Vec<R> {
        self.records.read().clone()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of writes made through the [`Repository`] interface.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every subsequent write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::store(R::KIND, "write rejected"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<R: BatchMember> Default for MemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BatchMember> Repository<R> for MemoryRepository<R> {
    fn get_all_changed(&self) -> SyncResult<Vec<R>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| record.has_changed())
            .cloned()
            .collect())
    }

    fn get_all(&self) -> SyncResult<Vec<R>> {
        Ok(self.snapshot())
    }

    fn get(&self, key: &R::Key) -> SyncResult<Option<R>> {
        Ok(self.find(key))
    }

    fn insert(&self, mut record: R, mark_dirty: bool) -> SyncResult<()> {
        self.check_writable()?;
        let key = record.key();
        let mut records = self.records.write();
        if records.iter().any(|existing| existing.key() == key) {
            return Err(SyncError::store(R::KIND, format!("duplicate key {key:?}")));
        }
        record.tracking_mut().has_changed = mark_dirty;
        records.push(record);
        Ok(())
    }

    fn update(&self, mut record: R, mark_dirty: bool) -> SyncResult<()> {
        self.check_writable()?;
        let key = record.key();
        let mut records = self.records.write();
        let existing = records
            .iter_mut()
            .find(|existing| existing.key() == key)
            .ok_or_else(|| SyncError::store(R::KIND, format!("no record with key {key:?}")))?;
        record.tracking_mut().has_changed = mark_dirty;
        *existing = record;
        Ok(())
    }

    fn reset_dirty_flag(&self, record: &R, dirty: bool) -> SyncResult<()> {
        let mut record = record.clone();
        record.tracking_mut().has_changed = dirty;
        self.check_writable()?;
        self.put(record);
        Ok(())
    }
}

/// Typed handles to one in-memory repository per record type.
#[derive(Debug, Clone, Default)]
pub struct MemoryStores {
    /// Prescriptions.
    pub prescriptions: Arc<MemoryRepository<Prescription>>,
    /// Devices.
    pub devices: Arc<MemoryRepository<Device>>,
    /// Inhale events.
    pub inhale_events: Arc<MemoryRepository<InhaleEvent>>,
    /// Daily feelings.
    pub daily_feelings: Arc<MemoryRepository<DailyFeeling>>,
    /// Reminder settings.
    pub reminder_settings: Arc<MemoryRepository<ReminderSetting>>,
    /// Profiles.
    pub profiles: Arc<MemoryRepository<UserProfile>>,
}

impl MemoryStores {
    /// Creates empty stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stores as the engine's repository bundle.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            prescriptions: self.prescriptions.clone(),
            devices: self.devices.clone(),
            inhale_events: self.inhale_events.clone(),
            daily_feelings: self.daily_feelings.clone(),
            reminder_settings: self.reminder_settings.clone(),
            profiles: self.profiles.clone(),
        }
    }

    /// Number of records with local changes, across all stores.
    pub fn dirty_count(&self) -> usize {
        fn dirty<R: BatchMember>(repo: &MemoryRepository<R>) -> usize {
            repo.snapshot().iter().filter(|r| r.has_changed()).count()
        }

        dirty(&self.prescriptions)
            + dirty(&self.devices)
            + dirty(&self.inhale_events)
            + dirty(&self.daily_feelings)
            + dirty(&self.reminder_settings)
            + dirty(&self.profiles)
    }
}

/// An in-memory settings store.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    entries: RwLock<HashMap<String, i64>>,
}

impl MemorySettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.read().get(key).copied()
    }

    fn set_i64(&self, key: &str, value: Option<i64>) {
        let mut entries = self.entries.write();
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
    }
}
