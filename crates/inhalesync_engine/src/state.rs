//! Sync state machine.

use crate::clock::AppClock;
use crate::collector::ChangeSetCollector;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{DownloadOutcome, SyncGateway};
use crate::health::{SyncHealth, SyncHealthMonitor};
use crate::hooks::{SyncActivity, SyncHooks};
use crate::merge::{MergeReport, MergeResolver};
use crate::reconciler::ServerTimeReconciler;
use crate::session::{Step, SyncSession};
use crate::store::{Repositories, SettingsStore, WriteSection};
use chrono::{DateTime, Utc};
use inhalesync_model::SyncBatch;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// A cycle has started and is waiting for the server time.
    Syncing,
    /// Engine is uploading local changes.
    Uploading,
    /// Engine is downloading remote changes.
    Downloading,
    /// The active profile is an emancipated minor; nothing syncs until the
    /// engine is reinitialized.
    Emancipated,
}

impl SyncState {
    /// Returns true if a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Syncing | SyncState::Uploading | SyncState::Downloading
        )
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Cycles that completed every phase.
    pub cycles_completed: u64,
    /// Cycles that ended on a gateway failure.
    pub cycles_failed: u64,
    /// Cycles abandoned because the server time was unavailable.
    pub cycles_deferred: u64,
    /// Records uploaded successfully.
    pub records_uploaded: u64,
    /// Records downloaded.
    pub records_downloaded: u64,
    /// Merge totals across all downloads.
    pub merged: MergeReport,
    /// End of the last successful cycle, on the application clock.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Everything the engine needs from its host.
#[derive(Clone)]
pub struct SyncContext {
    /// Change-tracked repositories.
    pub repositories: Repositories,
    /// Remote service.
    pub gateway: Arc<dyn SyncGateway>,
    /// Application clock.
    pub clock: Arc<dyn AppClock>,
    /// Durable settings, used for sync health.
    pub settings: Arc<dyn SettingsStore>,
    /// Host collaborators.
    pub hooks: SyncHooks,
    /// Write section shared with the host's other datastore writers.
    pub write_section: WriteSection,
}

struct Inner {
    state: SyncState,
    session: Option<SyncSession>,
    /// A thread is inside the driver loop.
    driving: bool,
    /// A completion that arrived while the cycle was being driven.
    pending: Option<Resume>,
}

/// A gateway completion waiting to be processed.
enum Resume {
    ServerTime(Option<DateTime<Utc>>),
    Uploaded(bool),
    Downloaded(DownloadOutcome),
}

/// Drives sync cycles: server time, upload, download, merge.
///
/// Every gateway call completes through a callback that hands its result to
/// a single driver loop. A callback that fires while the loop is already on
/// the stack only queues its result, so gateways that complete synchronously
/// never nest one phase inside another. No engine lock is held while calling
/// the gateway or a host hook, so callbacks may run synchronously on the
/// calling thread or later on any other thread.
pub struct SyncManager {
    config: Arc<SyncConfig>,
    repositories: Repositories,
    gateway: Arc<dyn SyncGateway>,
    clock: Arc<dyn AppClock>,
    hooks: SyncHooks,
    reconciler: ServerTimeReconciler,
    collector: ChangeSetCollector,
    merger: MergeResolver,
    health: SyncHealthMonitor,
    inner: Mutex<Inner>,
    stats: RwLock<SyncStats>,
}

impl SyncManager {
    /// Creates an idle sync manager.
    pub fn new(config: SyncConfig, ctx: SyncContext) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            reconciler: ServerTimeReconciler::new(
                ctx.clock.clone(),
                config.max_acceptable_offset_secs,
            ),
            collector: ChangeSetCollector::new(
                ctx.repositories.clone(),
                config.clone(),
                ctx.write_section.clone(),
            ),
            merger: MergeResolver::new(
                ctx.repositories.clone(),
                ctx.hooks.clone(),
                config.clone(),
                ctx.clock.clone(),
                ctx.write_section,
            ),
            health: SyncHealthMonitor::new(
                ctx.settings,
                ctx.hooks.notifications.clone(),
                config.stale_sync_threshold_days,
            ),
            config,
            repositories: ctx.repositories,
            gateway: ctx.gateway,
            clock: ctx.clock,
            hooks: ctx.hooks,
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                session: None,
                driving: false,
                pending: None,
            }),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Gets the stored sync health.
    pub fn health(&self) -> SyncHealth {
        self.health.health()
    }

    /// Returns true once the account has completed a first sync.
    pub fn has_synced(&self) -> bool {
        !self.gateway.is_first_sync()
    }

    /// Latest server time offset in seconds.
    pub fn server_time_offset(&self) -> Option<i64> {
        self.reconciler.offset()
    }

    /// Returns true if the latest offset is known and acceptable.
    pub fn is_offset_within_acceptable_range(&self) -> bool {
        self.reconciler.is_within_acceptable_range()
    }

    /// Forgets the latest server time offset.
    pub fn clear_server_time_offset(&self) {
        self.reconciler.clear();
    }

    /// Stamps the latest offset, or the unknown-offset sentinel, on every
    /// dirty record that has none. Nothing is uploaded.
    ///
    /// Returns the number of records stamped.
    pub fn stamp_pending_offsets(&self) -> usize {
        let offset = self.reconciler.offset().unwrap_or(self.config.unknown_offset);
        self.collector.stamp_offsets(offset)
    }

    /// Leaves the emancipated state.
    pub fn reinitialize(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != SyncState::Emancipated {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", inner.state),
                to: format!("{:?}", SyncState::Idle),
            });
        }
        info!("sync reinitialized");
        inner.state = SyncState::Idle;
        Ok(())
    }

    /// Starts a sync cycle.
    ///
    /// Returns as soon as the server time has been requested. Only one cycle
    /// runs at a time: calling this while a cycle is active changes nothing
    /// and returns an error.
    pub fn sync(self: &Arc<Self>) -> SyncResult<()> {
        let first_sync = self.gateway.is_first_sync();
        let started_at = self.clock.now();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SyncState::Idle => {}
                SyncState::Emancipated => return Err(SyncError::Emancipated),
                state => {
                    debug!(?state, "sync already in progress");
                    return Err(SyncError::InvalidStateTransition {
                        from: format!("{state:?}"),
                        to: format!("{:?}", SyncState::Syncing),
                    });
                }
            }
            inner.state = SyncState::Syncing;
            inner.session = Some(SyncSession::new(started_at, first_sync));
        }

        info!(first_sync, "sync started");
        let manager = Arc::clone(self);
        self.gateway.server_time_async(Box::new(move |server_time| {
            manager.drive(Resume::ServerTime(server_time));
        }));
        Ok(())
    }

    /// Processes a completion and every phase it leads to.
    ///
    /// Only the outermost caller loops; a completion delivered while it runs
    /// is queued and picked up once the current gateway call returns.
    fn drive(self: &Arc<Self>, resume: Resume) {
        {
            let mut inner = self.inner.lock();
            if inner.driving {
                inner.pending = Some(resume);
                return;
            }
            inner.driving = true;
        }

        let mut next = Some(resume);
        while let Some(resume) = next {
            let proceed = match resume {
                Resume::ServerTime(server_time) => self.server_time_completed(server_time),
                Resume::Uploaded(success) => self.upload_completed(success),
                Resume::Downloaded(outcome) => self.download_completed(outcome),
            };
            if proceed {
                self.continue_sync();
            }

            let mut inner = self.inner.lock();
            next = inner.pending.take();
            if next.is_none() {
                inner.driving = false;
            }
        }
    }

    /// Returns true if the cycle should move on to its next phase.
    fn server_time_completed(&self, server_time: Option<DateTime<Utc>>) -> bool {
        let Some(sample) = self.reconciler.reconcile(server_time) else {
            self.defer();
            return false;
        };

        let within_range = self.reconciler.is_acceptable(sample.offset);
        if !within_range {
            warn!(offset = sample.offset, "server time offset out of range");
        }
        self.hooks
            .listener
            .on_activity(&SyncActivity::ServerTimeOffsetUpdated {
                offset: sample.offset,
                within_range,
            });

        if self.active_profile_emancipated() {
            info!("active profile is emancipated; sync disabled");
            let mut inner = self.inner.lock();
            inner.session = None;
            inner.state = SyncState::Emancipated;
            return false;
        }

        let mut inner = self.inner.lock();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.set_server_time(sample.server_time, sample.offset);
        true
    }

    /// Collects changes and starts the next phase.
    fn continue_sync(self: &Arc<Self>) {
        let (offset, server_time, started_at, first_sync) = {
            let inner = self.inner.lock();
            let Some(session) = inner.session.as_ref() else {
                return;
            };
            (
                session.offset.unwrap_or(self.config.unknown_offset),
                session.server_time,
                session.started_at,
                session.first_sync,
            )
        };

        let cutoff = self
            .collector
            .upload_cutoff(server_time, started_at, self.clock.now());
        let batch = self.collector.collect(offset, cutoff, first_sync);

        let (step, upload) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            session.batch = batch;
            let step = session.next_step();
            let upload = match step {
                Step::Upload => Some(session.batch.clone()),
                _ => None,
            };
            inner.state = match step {
                Step::Upload => SyncState::Uploading,
                Step::DownloadBootstrap | Step::Download => SyncState::Downloading,
                Step::AwaitServerTime | Step::Complete => inner.state,
            };
            (step, upload)
        };

        let manager = Arc::clone(self);
        match step {
            Step::Upload => {
                let batch = upload.unwrap_or_default();
                info!(uploading = %batch.counts(), "uploading");
                self.gateway.upload_async(
                    batch,
                    Box::new(move |success| manager.drive(Resume::Uploaded(success))),
                );
            }
            Step::DownloadBootstrap => {
                info!("downloading prescriptions and devices");
                self.gateway.download_bootstrap_async(Box::new(move |outcome| {
                    manager.drive(Resume::Downloaded(outcome));
                }));
            }
            Step::Download => {
                info!("downloading");
                self.gateway.download_async(Box::new(move |outcome| {
                    manager.drive(Resume::Downloaded(outcome));
                }));
            }
            Step::AwaitServerTime => self.defer(),
            Step::Complete => {
                self.hooks.listener.on_sync_complete();
                self.idle(true, None);
            }
        }
    }

    fn upload_completed(&self, success: bool) -> bool {
        let batch = {
            let mut inner = self.inner.lock();
            match inner.session.as_mut() {
                Some(session) => std::mem::take(&mut session.batch),
                None => return false,
            }
        };

        if success {
            self.stats.write().records_uploaded += batch.len() as u64;
            self.report_large_batch(&batch, true);
            true
        } else {
            let restored = self.collector.restore_dirty_flags(&batch);
            warn!(restored, "upload failed");
            self.idle(false, Some(SyncError::gateway("upload")));
            false
        }
    }

    fn download_completed(&self, outcome: DownloadOutcome) -> bool {
        if !outcome.success {
            warn!("download failed");
            self.idle(false, Some(SyncError::gateway("download")));
            return false;
        }

        let first_sync = match self.inner.lock().session.as_ref() {
            Some(session) => session.first_sync,
            None => return false,
        };

        let report = self.merger.merge(&outcome.batch, first_sync);
        if let Some(post_process) = outcome.post_process {
            post_process();
        }
        {
            let mut stats = self.stats.write();
            stats.records_downloaded += outcome.batch.len() as u64;
            stats.merged += report;
        }
        self.report_large_batch(&outcome.batch, false);

        let first_sync_finished = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.as_mut() else {
                return false;
            };
            session.has_downloaded = true;
            if outcome.more_data {
                session.bootstrap_complete = true;
                session.has_downloaded = false;
                false
            } else if session.first_sync {
                // A first sync runs the full pass twice.
                session.has_downloaded = false;
                session.first_sync = false;
                true
            } else {
                false
            }
        };

        if first_sync_finished {
            debug!("first sync finished; running second pass");
            self.gateway.set_first_sync(false);
        }
        true
    }

    /// Ends the cycle and records its outcome.
    fn idle(&self, success: bool, error: Option<SyncError>) {
        let session = self.inner.lock().session.take();
        let duration = session
            .map(|session| session.started.elapsed())
            .unwrap_or_default();

        self.hooks
            .listener
            .on_activity(&SyncActivity::CycleFinished { success, duration });

        let now = self.clock.now();
        let update = self.health.record_outcome(success, now);
        {
            let mut stats = self.stats.write();
            if success {
                stats.cycles_completed += 1;
                stats.last_sync_time = Some(now);
                stats.last_error = None;
            } else {
                stats.cycles_failed += 1;
                stats.last_error = error.map(|err| err.to_string());
            }
        }

        info!(success, ?duration, ?update, "sync finished");
        self.inner.lock().state = SyncState::Idle;
    }

    /// Abandons a cycle that could not obtain the server time.
    fn defer(&self) {
        warn!("server time unavailable; sync deferred");
        {
            let mut stats = self.stats.write();
            stats.cycles_deferred += 1;
            stats.last_error = Some(SyncError::ServerTimeUnavailable.to_string());
        }
        let mut inner = self.inner.lock();
        inner.session = None;
        inner.state = SyncState::Idle;
    }

    fn report_large_batch(&self, batch: &SyncBatch, upload: bool) {
        let count = batch.inhale_events.len();
        if count > self.config.monitored_inhale_event_count {
            info!(count, upload, "large inhale event batch");
            self.hooks
                .listener
                .on_activity(&SyncActivity::LargeInhaleBatch { count, upload });
        }
    }

    fn active_profile_emancipated(&self) -> bool {
        match self.repositories.profiles.get_all() {
            Ok(profiles) => profiles
                .iter()
                .any(|profile| profile.is_active && profile.is_emancipated),
            Err(err) => {
                warn!(error = %err, "failed to read profiles");
                false
            }
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
