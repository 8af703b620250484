//! # Inhalesync Engine
//!
//! Cloud sync engine for an offline-first inhaler tracking datastore.
//!
//! This crate provides:
//! - Server time reconciliation (local/server clock offset)
//! - Change-set collection with offset stamping and an upload cutoff
//! - Sync state machine (idle → syncing → uploading/downloading → idle)
//! - Last-writer-wins merge of downloaded records
//! - Sync health monitoring and the stale-sync notification
//! - In-memory repositories and a mock gateway for tests and demos
//!
//! ## Architecture
//!
//! The engine implements an **upload-then-download** cycle:
//! 1. Query the server time and compute the clock offset
//! 2. Collect dirty records that are due and upload them
//! 3. Download remote changes, page by page, and merge them
//! 4. Repeat from 2 until nothing is left to upload or download
//!
//! A first sync downloads prescriptions and devices before anything else and
//! runs the whole pass twice.
//!
//! ## Key Invariants
//!
//! - At most one cycle runs at a time
//! - Every gateway call resumes through exactly one continuation
//! - No engine lock is held across a gateway call or a host hook
//! - A record is only reported clean once it is part of an upload; a failed
//!   upload marks it dirty again
//! - Downloaded records never replace a local copy of equal or later change time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod collector;
mod config;
mod error;
mod gateway;
mod health;
mod hooks;
mod memory;
mod merge;
mod reconciler;
mod session;
mod state;
mod store;

pub use clock::{AcceleratedClock, AppClock, ManualClock, SystemClock};
pub use collector::ChangeSetCollector;
pub use config::{SyncConfig, GOOD_INHALATION_FEEDBACK_SETTING};
pub use error::{SyncError, SyncResult};
pub use gateway::{
    DownloadCallback, DownloadOutcome, GatewayCall, MockGateway, PostProcess, ScriptedDownload,
    ServerTimeCallback, SyncGateway, UploadCallback,
};
pub use health::{
    HealthUpdate, SyncHealth, SyncHealthMonitor, LAST_FAILED_SYNC_KEY, LAST_SUCCESSFUL_SYNC_KEY,
    STALE_SYNC_ACTIVE_KEY, STALE_SYNC_NOTIFICATION_ID,
};
pub use hooks::{
    DeviceLifecycle, HookEvent, NoopHooks, NotificationSink, ProgramDirectory, RecordingHooks,
    ReminderScheduler, SyncActivity, SyncHooks, SyncListener,
};
pub use memory::{MemoryRepository, MemorySettingsStore, MemoryStores};
pub use merge::{MergeOutcome, MergeReport, MergeResolver};
pub use reconciler::{ServerTimeReconciler, ServerTimeSample};
pub use session::{Step, SyncSession};
pub use state::{SyncContext, SyncManager, SyncState, SyncStats};
pub use store::{Repositories, Repository, SettingsStore, StoredRecord, WriteSection};
