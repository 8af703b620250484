//! A simulated service of record.
//!
//! Implements [`SyncGateway`] against an in-process record store so engine
//! cycles can run end to end without a network.

use chrono::{DateTime, Duration, Utc};
use inhalesync_engine::{
    AppClock, DownloadCallback, DownloadOutcome, ServerTimeCallback, SyncGateway, UploadCallback,
};
use inhalesync_model::{BatchMember, SyncBatch};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Default number of records per download page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// How the service completes callbacks.
#[derive(Debug, Clone, Default)]
pub enum Delivery {
    /// On the calling thread, before the gateway call returns.
    #[default]
    Immediate,
    /// On a task spawned onto the given tokio runtime.
    Spawned(Handle),
}

/// Counters kept by [`SimulatedService`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Server time queries answered.
    pub time_queries: usize,
    /// Upload requests received.
    pub uploads: usize,
    /// Upload requests rejected.
    pub failed_uploads: usize,
    /// Normal download requests received.
    pub downloads: usize,
    /// Bootstrap download requests received.
    pub bootstrap_downloads: usize,
    /// Download requests rejected.
    pub failed_downloads: usize,
    /// Records accepted from uploads.
    pub records_received: usize,
    /// Records served by downloads.
    pub records_served: usize,
}

struct ServiceState {
    cloud: SyncBatch,
    outbox: SyncBatch,
    stats: ServiceStats,
}

/// An in-process remote service.
///
/// Uploaded records are stored in the service's copy of the account.
/// Records published through [`publish`](Self::publish) play the part of
/// changes made on another phone and are served to the client in pages.
pub struct SimulatedService {
    clock: Arc<dyn AppClock>,
    skew: Mutex<Duration>,
    page_size: usize,
    delivery: Delivery,
    first_sync: AtomicBool,
    offline: AtomicBool,
    fail_uploads: AtomicUsize,
    fail_downloads: AtomicUsize,
    state: Mutex<ServiceState>,
}

impl SimulatedService {
    /// Creates an empty account whose server clock reads `clock`.
    pub fn new(clock: Arc<dyn AppClock>) -> Self {
        Self {
            clock,
            skew: Mutex::new(Duration::zero()),
            page_size: DEFAULT_PAGE_SIZE,
            delivery: Delivery::Immediate,
            first_sync: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            fail_uploads: AtomicUsize::new(0),
            fail_downloads: AtomicUsize::new(0),
            state: Mutex::new(ServiceState {
                cloud: SyncBatch::new(),
                outbox: SyncBatch::new(),
                stats: ServiceStats::default(),
            }),
        }
    }

    /// Seeds an existing account that this client has never synced.
    ///
    /// Everything in `records` is served on the client's first sync.
    pub fn with_account(self, records: SyncBatch) -> Self {
        self.first_sync.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            upsert_all(&mut state.cloud, &records);
            upsert_all(&mut state.outbox, &records);
        }
        self
    }

    /// Sets the number of records per download page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets how callbacks are completed.
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Makes the server clock run `skew` ahead of the client clock.
    pub fn set_skew(&self, skew: Duration) {
        *self.skew.lock() = skew;
    }

    /// Takes the service off the network, or brings it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Rejects the next `count` uploads.
    pub fn fail_next_uploads(&self, count: usize) {
        self.fail_uploads.store(count, Ordering::SeqCst);
    }

    /// Rejects the next `count` downloads.
    pub fn fail_next_downloads(&self, count: usize) {
        self.fail_downloads.store(count, Ordering::SeqCst);
    }

    /// Records changes made elsewhere, to be downloaded by this client.
    pub fn publish(&self, records: SyncBatch) {
        let mut state = self.state.lock();
        upsert_all(&mut state.cloud, &records);
        upsert_all(&mut state.outbox, &records);
    }

    /// The service's copy of the account.
    pub fn cloud(&self) -> SyncBatch {
        self.state.lock().cloud.clone()
    }

    /// Records waiting to be downloaded.
    pub fn pending(&self) -> usize {
        self.state.lock().outbox.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> ServiceStats {
        self.state.lock().stats
    }

    fn server_time(&self) -> Option<DateTime<Utc>> {
        if self.offline.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.clock.now() + *self.skew.lock())
    }

    fn should_fail(&self, counter: &AtomicUsize) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return true;
        }
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn deliver(&self, complete: impl FnOnce() + Send + 'static) {
        match &self.delivery {
            Delivery::Immediate => complete(),
            Delivery::Spawned(handle) => {
                handle.spawn(async move { complete() });
            }
        }
    }

    fn next_page(&self) -> DownloadOutcome {
        let mut state = self.state.lock();
        let mut page = SyncBatch::new();
        let mut room = self.page_size;
        take_into(&mut state.outbox.prescriptions, &mut page.prescriptions, &mut room);
        take_into(&mut state.outbox.devices, &mut page.devices, &mut room);
        take_into(&mut state.outbox.inhale_events, &mut page.inhale_events, &mut room);
        take_into(&mut state.outbox.daily_feelings, &mut page.daily_feelings, &mut room);
        take_into(&mut state.outbox.reminder_settings, &mut page.reminder_settings, &mut room);
        take_into(&mut state.outbox.profiles, &mut page.profiles, &mut room);

        let more_data = !state.outbox.is_empty();
        state.stats.records_served += page.len();
        debug!(served = %page.counts(), more_data, "download page");
        DownloadOutcome::success(page, more_data)
    }

    fn bootstrap(&self) -> DownloadOutcome {
        let mut state = self.state.lock();
        let mut batch = SyncBatch::new();
        batch.prescriptions = std::mem::take(&mut state.outbox.prescriptions);
        batch.devices = std::mem::take(&mut state.outbox.devices);
        state.stats.records_served += batch.len();
        debug!(served = %batch.counts(), "bootstrap download");
        // The normal download always follows a bootstrap.
        DownloadOutcome::success(batch, true)
    }
}

impl SyncGateway for SimulatedService {
    fn is_first_sync(&self) -> bool {
        self.first_sync.load(Ordering::SeqCst)
    }

    fn set_first_sync(&self, first_sync: bool) {
        self.first_sync.store(first_sync, Ordering::SeqCst);
    }

    fn server_time_async(&self, on_complete: ServerTimeCallback) {
        self.state.lock().stats.time_queries += 1;
        let server_time = self.server_time();
        self.deliver(move || on_complete(server_time));
    }

    fn upload_async(&self, batch: SyncBatch, on_complete: UploadCallback) {
        let success = !self.should_fail(&self.fail_uploads);
        {
            let mut state = self.state.lock();
            state.stats.uploads += 1;
            if success {
                state.stats.records_received += batch.len();
                upsert_all(&mut state.cloud, &batch);
            } else {
                state.stats.failed_uploads += 1;
            }
        }
        debug!(success, uploaded = %batch.counts(), "upload");
        self.deliver(move || on_complete(success));
    }

    fn download_async(&self, on_complete: DownloadCallback) {
        self.state.lock().stats.downloads += 1;
        let outcome = if self.should_fail(&self.fail_downloads) {
            self.state.lock().stats.failed_downloads += 1;
            DownloadOutcome::failure()
        } else {
            self.next_page()
        };
        self.deliver(move || on_complete(outcome));
    }

    fn download_bootstrap_async(&self, on_complete: DownloadCallback) {
        self.state.lock().stats.bootstrap_downloads += 1;
        let outcome = if self.should_fail(&self.fail_downloads) {
            self.state.lock().stats.failed_downloads += 1;
            DownloadOutcome::failure()
        } else {
            self.bootstrap()
        };
        self.deliver(move || on_complete(outcome));
    }
}

impl std::fmt::Debug for SimulatedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedService")
            .field("page_size", &self.page_size)
            .field("delivery", &self.delivery)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn take_into<R>(from: &mut Vec<R>, to: &mut Vec<R>, room: &mut usize) {
    let count = from.len().min(*room);
    to.extend(from.drain(..count));
    *room -= count;
}

fn upsert_all(into: &mut SyncBatch, records: &SyncBatch) {
    upsert::<inhalesync_model::Prescription>(into, records);
    upsert::<inhalesync_model::Device>(into, records);
    upsert::<inhalesync_model::InhaleEvent>(into, records);
    upsert::<inhalesync_model::DailyFeeling>(into, records);
    upsert::<inhalesync_model::ReminderSetting>(into, records);
    upsert::<inhalesync_model::UserProfile>(into, records);
}

/// Replaces records with the same key, appends the rest.
fn upsert<R: BatchMember>(into: &mut SyncBatch, records: &SyncBatch) {
    for record in records.records::<R>() {
        let mut record = record.clone();
        record.tracking_mut().has_changed = false;
        let list = R::list_mut(into);
        let key = record.key();
        match list.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => *existing = record,
            None => list.push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, clean_device};
    use inhalesync_engine::ManualClock;

    fn service() -> SimulatedService {
        SimulatedService::new(Arc::new(ManualClock::new(at(0))))
    }

    fn capture_download(service: &SimulatedService, bootstrap: bool) -> DownloadOutcome {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        let callback: DownloadCallback = Box::new(move |outcome| *sink.lock() = Some(outcome));
        if bootstrap {
            service.download_bootstrap_async(callback);
        } else {
            service.download_async(callback);
        }
        let outcome = slot.lock().take();
        outcome.expect("immediate delivery")
    }

    #[test]
    fn downloads_are_paged() {
        let service = service().with_page_size(2);
        let mut batch = SyncBatch::new();
        for n in 0..3 {
            batch.push(clean_device(&format!("SN-{n}"), at(n)));
        }
        service.publish(batch);

        let first = capture_download(&service, false);
        assert_eq!(first.batch.len(), 2);
        assert!(first.more_data);

        let second = capture_download(&service, false);
        assert_eq!(second.batch.len(), 1);
        assert!(!second.more_data);
        assert_eq!(service.stats().records_served, 3);
    }

    #[test]
    fn bootstrap_serves_devices_only() {
        let mut batch = SyncBatch::new();
        batch.push(clean_device("SN-1", at(0)));
        batch.push(inhalesync_model::InhaleEvent::new("SN-1", 1, at(0)));
        let service = service().with_account(batch);
        assert!(service.is_first_sync());

        let outcome = capture_download(&service, true);
        assert_eq!(outcome.batch.devices.len(), 1);
        assert!(outcome.batch.inhale_events.is_empty());
        assert!(outcome.more_data);
        assert_eq!(service.pending(), 1);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let service = service();
        service.fail_next_downloads(1);
        assert!(!capture_download(&service, false).success);
        assert!(capture_download(&service, false).success);
        assert_eq!(service.stats().failed_downloads, 1);
    }

    #[test]
    fn uploads_are_stored() {
        let service = service();
        let mut batch = SyncBatch::new();
        batch.push(clean_device("SN-1", at(0)));

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        service.upload_async(batch.clone(), Box::new(move |ok| *sink.lock() = Some(ok)));

        assert_eq!(*result.lock(), Some(true));
        assert_eq!(service.cloud().devices.len(), 1);
        service.upload_async(batch, Box::new(|_| {}));
        assert_eq!(service.cloud().devices.len(), 1);
    }

    #[test]
    fn offline_service_has_no_time() {
        let service = service();
        service.set_skew(Duration::seconds(30));
        service.set_offline(true);

        let slot = Arc::new(Mutex::new(Some(at(0))));
        let sink = Arc::clone(&slot);
        service.server_time_async(Box::new(move |time| *sink.lock() = time));
        assert_eq!(*slot.lock(), None);

        service.set_offline(false);
        let sink = Arc::clone(&slot);
        service.server_time_async(Box::new(move |time| *sink.lock() = time));
        assert_eq!(*slot.lock(), Some(at(30)));
    }
}
