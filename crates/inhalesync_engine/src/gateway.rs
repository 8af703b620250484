//! Remote sync gateway abstraction.

use chrono::{DateTime, Utc};
use inhalesync_model::SyncBatch;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Completion of a server time query; `None` when the query failed.
pub type ServerTimeCallback = Box<dyn FnOnce(Option<DateTime<Utc>>) + Send>;

/// Completion of an upload.
pub type UploadCallback = Box<dyn FnOnce(bool) + Send>;

/// Completion of a download.
pub type DownloadCallback = Box<dyn FnOnce(DownloadOutcome) + Send>;

/// Work the gateway wants run after the engine merged a download.
pub type PostProcess = Box<dyn FnOnce() + Send>;

/// Result of a download request.
pub struct DownloadOutcome {
    /// Whether the download succeeded.
    pub success: bool,
    /// Downloaded records.
    pub batch: SyncBatch,
    /// Whether the service holds more data for this account.
    pub more_data: bool,
    /// Run once the batch has been merged.
    pub post_process: Option<PostProcess>,
}

impl DownloadOutcome {
    /// A successful download.
    pub fn success(batch: SyncBatch, more_data: bool) -> Self {
        Self {
            success: true,
            batch,
            more_data,
            post_process: None,
        }
    }

    /// A failed download.
    pub fn failure() -> Self {
        Self {
            success: false,
            batch: SyncBatch::new(),
            more_data: false,
            post_process: None,
        }
    }

    /// Attaches post-merge work.
    pub fn with_post_process(mut self, post_process: impl FnOnce() + Send + 'static) -> Self {
        self.post_process = Some(Box::new(post_process));
        self
    }
}

impl fmt::Debug for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOutcome")
            .field("success", &self.success)
            .field("batch", &self.batch.counts())
            .field("more_data", &self.more_data)
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

/// Network access to the remote service of record.
///
/// Every call returns immediately and reports through its callback, either
/// on the calling thread before returning or later on any thread. The engine
/// holds no lock while calling in, so both are safe.
pub trait SyncGateway: Send + Sync {
    /// Whether this account has never completed a sync.
    fn is_first_sync(&self) -> bool;

    /// Records whether the account has completed a sync.
    fn set_first_sync(&self, first_sync: bool);

    /// Queries the service's current time.
    fn server_time_async(&self, on_complete: ServerTimeCallback);

    /// Uploads a batch of locally changed records.
    fn upload_async(&self, batch: SyncBatch, on_complete: UploadCallback);

    /// Downloads the next page of remote changes.
    fn download_async(&self, on_complete: DownloadCallback);

    /// Downloads prescriptions and devices ahead of a first full sync.
    fn download_bootstrap_async(&self, on_complete: DownloadCallback);
}

/// A call received by [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// Server time query.
    ServerTime,
    /// Upload with the uploaded batch.
    Upload(SyncBatch),
    /// Normal download.
    Download,
    /// Bootstrap download.
    DownloadBootstrap,
}

/// Scripted download result for [`MockGateway`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedDownload {
    /// Whether the download succeeds.
    pub success: bool,
    /// Batch to return.
    pub batch: SyncBatch,
    /// Whether more data remains.
    pub more_data: bool,
}

impl ScriptedDownload {
    /// A successful download of `batch`.
    pub fn ok(batch: SyncBatch, more_data: bool) -> Self {
        Self {
            success: true,
            batch,
            more_data,
        }
    }

    /// A failed download.
    pub fn failed() -> Self {
        Self::default()
    }

    fn into_outcome(self) -> DownloadOutcome {
        if self.success {
            DownloadOutcome::success(self.batch, self.more_data)
        } else {
            DownloadOutcome::failure()
        }
    }
}

enum PendingCall {
    Upload(UploadCallback),
    Download(DownloadCallback),
}

/// A mock gateway for testing.
///
/// Completes calls from scripted queues: uploads succeed and downloads
/// return an empty final page unless scripted otherwise. In held mode
/// upload and download callbacks are parked until completed by hand.
pub struct MockGateway {
    first_sync: AtomicBool,
    held: AtomicBool,
    server_time: Mutex<Option<DateTime<Utc>>>,
    upload_results: Mutex<VecDeque<bool>>,
    downloads: Mutex<VecDeque<ScriptedDownload>>,
    bootstrap_downloads: Mutex<VecDeque<ScriptedDownload>>,
    calls: Mutex<Vec<GatewayCall>>,
    pending: Mutex<VecDeque<PendingCall>>,
}

impl MockGateway {
    /// Creates a mock reporting `server_time` for every time query.
    pub fn new(server_time: Option<DateTime<Utc>>) -> Self {
        Self {
            first_sync: AtomicBool::new(false),
            held: AtomicBool::new(false),
            server_time: Mutex::new(server_time),
            upload_results: Mutex::new(VecDeque::new()),
            downloads: Mutex::new(VecDeque::new()),
            bootstrap_downloads: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the server time reported from now on.
    pub fn set_server_time(&self, server_time: Option<DateTime<Utc>>) {
        *self.server_time.lock() = server_time;
    }

    /// Queues the result of the next upload.
    pub fn push_upload_result(&self, success: bool) {
        self.upload_results.lock().push_back(success);
    }

    /// Queues the result of the next normal download.
    pub fn push_download(&self, download: ScriptedDownload) {
        self.downloads.lock().push_back(download);
    }

    /// Queues the result of the next bootstrap download.
    pub fn push_bootstrap_download(&self, download: ScriptedDownload) {
        self.bootstrap_downloads.lock().push_back(download);
    }

    /// Parks upload and download callbacks instead of completing them.
    pub fn set_held(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }

    /// Number of parked callbacks.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Completes the oldest parked call with its scripted result.
    ///
    /// Returns false if nothing was parked.
    pub fn complete_next(&self) -> bool {
        let Some(pending) = self.pending.lock().pop_front() else {
            return false;
        };
        match pending {
            PendingCall::Upload(on_complete) => on_complete(self.next_upload_result()),
            PendingCall::Download(on_complete) => {
                on_complete(self.next_download().into_outcome())
            }
        }
        true
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Number of uploads received.
    pub fn upload_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, GatewayCall::Upload(_)))
            .count()
    }

    /// Batches received by uploads, in order.
    pub fn uploaded_batches(&self) -> Vec<SyncBatch> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Upload(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    fn next_upload_result(&self) -> bool {
        self.upload_results.lock().pop_front().unwrap_or(true)
    }

    fn next_download(&self) -> ScriptedDownload {
        self.downloads
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedDownload::ok(SyncBatch::new(), false))
    }

    fn next_bootstrap_download(&self) -> ScriptedDownload {
        self.bootstrap_downloads
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedDownload::ok(SyncBatch::new(), true))
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SyncGateway for MockGateway {
    fn is_first_sync(&self) -> bool {
        self.first_sync.load(Ordering::SeqCst)
    }

    fn set_first_sync(&self, first_sync: bool) {
        self.first_sync.store(first_sync, Ordering::SeqCst);
    }

    fn server_time_async(&self, on_complete: ServerTimeCallback) {
        self.record(GatewayCall::ServerTime);
        let server_time = *self.server_time.lock();
        on_complete(server_time);
    }

    fn upload_async(&self, batch: SyncBatch, on_complete: UploadCallback) {
        self.record(GatewayCall::Upload(batch));
        if self.held.load(Ordering::SeqCst) {
            self.pending.lock().push_back(PendingCall::Upload(on_complete));
            return;
        }
        on_complete(self.next_upload_result());
    }

    fn download_async(&self, on_complete: DownloadCallback) {
        self.record(GatewayCall::Download);
        if self.held.load(Ordering::SeqCst) {
            self.pending.lock().push_back(PendingCall::Download(on_complete));
            return;
        }
        on_complete(self.next_download().into_outcome());
    }

    fn download_bootstrap_async(&self, on_complete: DownloadCallback) {
        self.record(GatewayCall::DownloadBootstrap);
        // Bootstrap completions are never parked; held mode targets the
        // steady-state phases.
        on_complete(self.next_bootstrap_download().into_outcome());
    }
}
