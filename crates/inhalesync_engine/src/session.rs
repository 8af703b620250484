//! Per-cycle session state.

use chrono::{DateTime, Utc};
use inhalesync_model::SyncBatch;
use std::time::Instant;

/// Transient state of one sync cycle.
///
/// Created when a cycle starts and discarded when it returns to idle.
#[derive(Debug)]
pub struct SyncSession {
    /// Cycle start on the application clock.
    pub started_at: DateTime<Utc>,
    /// Cycle start on the monotonic clock, for duration reporting.
    pub started: Instant,
    /// Offset obtained this cycle.
    pub offset: Option<i64>,
    /// Server time obtained this cycle, on the application timeline.
    pub server_time: Option<DateTime<Utc>>,
    /// Whether the server time query succeeded this cycle.
    pub has_server_time: bool,
    /// Whether the account has never completed a sync.
    pub first_sync: bool,
    /// Whether the bootstrap download completed.
    pub bootstrap_complete: bool,
    /// Whether the normal download completed this pass.
    pub has_downloaded: bool,
    /// Records pending upload.
    pub batch: SyncBatch,
}

impl SyncSession {
    /// Starts a session at `started_at`.
    pub fn new(started_at: DateTime<Utc>, first_sync: bool) -> Self {
        Self {
            started_at,
            started: Instant::now(),
            offset: None,
            server_time: None,
            has_server_time: false,
            first_sync,
            bootstrap_complete: false,
            has_downloaded: false,
            batch: SyncBatch::new(),
        }
    }

    /// Records the reconciled server time.
    pub fn set_server_time(&mut self, server_time: DateTime<Utc>, offset: i64) {
        self.server_time = Some(server_time);
        self.offset = Some(offset);
        self.has_server_time = true;
    }

    /// Chooses the next phase of the cycle.
    pub fn next_step(&self) -> Step {
        if !self.has_server_time {
            Step::AwaitServerTime
        } else if !self.batch.is_empty() {
            Step::Upload
        } else if self.first_sync && !self.bootstrap_complete {
            Step::DownloadBootstrap
        } else if !self.has_downloaded {
            Step::Download
        } else {
            Step::Complete
        }
    }
}

/// A phase of the sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No server time yet; nothing may be uploaded or downloaded.
    AwaitServerTime,
    /// Upload the pending batch.
    Upload,
    /// Download prescriptions and devices ahead of a first full sync.
    DownloadBootstrap,
    /// Download remote changes.
    Download,
    /// Nothing left to do.
    Complete,
}
