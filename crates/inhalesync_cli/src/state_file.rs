//! Durable simulator settings backed by a JSON file.
//!
//! Sync health lives in the settings store, so keeping it in a file lets
//! consecutive `simulate` runs pick up where the last one stopped.

use inhalesync_engine::SettingsStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors reading or writing the state file.
#[derive(Debug, Error)]
pub enum StateFileError {
    /// The file could not be read or written.
    #[error("state file {path:?}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not a JSON object of integers.
    #[error("state file {path:?} is malformed: {source}")]
    Malformed {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for state file operations.
pub type StateFileResult<T> = Result<T, StateFileError>;

/// A [`SettingsStore`] persisted as a JSON object.
///
/// Every write rewrites the whole file.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, i64>>,
}

impl FileSettingsStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> StateFileResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StateFileError::Malformed {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Default::default(),
            Err(source) => return Err(StateFileError::Io { path, source }),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, json: Vec<u8>) -> StateFileResult<()> {
        fs::write(&self.path, json).map_err(|source| StateFileError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for FileSettingsStore {
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.lock().get(key).copied()
    }

    fn set_i64(&self, key: &str, value: Option<i64>) {
        // The file is written under the lock so writes land in order.
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        let result = serde_json::to_vec_pretty(&*entries)
            .map_err(|source| StateFileError::Malformed {
                path: self.path.clone(),
                source,
            })
            .and_then(|json| self.persist(json));
        drop(entries);
        if let Err(err) = result {
            warn!(key, error = %err, "failed to persist setting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = FileSettingsStore::open(dir.path().join("state.json")).unwrap();
        assert_eq!(store.get_i64("lastSuccessfulSyncTime"), None);
        assert!(!store.get_bool("staleSyncNotificationActive"));
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileSettingsStore::open(&path).unwrap();
        store.set_i64("lastSuccessfulSyncTime", Some(1_700_000_000));
        store.set_bool("staleSyncNotificationActive", true);
        store.set_i64("removed", Some(1));
        store.set_i64("removed", None);

        let reopened = FileSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get_i64("lastSuccessfulSyncTime"), Some(1_700_000_000));
        assert!(reopened.get_bool("staleSyncNotificationActive"));
        assert_eq!(reopened.get_i64("removed"), None);
    }

    #[test]
    fn concurrent_writers_leave_latest_state_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileSettingsStore::open(&path).unwrap();

        std::thread::scope(|scope| {
            for writer in 0..8i64 {
                let store = &store;
                scope.spawn(move || {
                    for n in 0..25 {
                        store.set_i64(&format!("writer-{writer}"), Some(n));
                    }
                });
            }
        });

        let reopened = FileSettingsStore::open(&path).unwrap();
        for writer in 0..8 {
            assert_eq!(reopened.get_i64(&format!("writer-{writer}")), Some(24));
        }
    }

    #[test]
    fn malformed_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"[1, 2").unwrap();

        let err = FileSettingsStore::open(&path).unwrap_err();
        assert!(matches!(err, StateFileError::Malformed { .. }));
    }
}
