//! Test fixtures: timestamps, record builders, and a wired-up engine.

use crate::service::SimulatedService;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use inhalesync_engine::{
    ManualClock, MemorySettingsStore, MemoryStores, MockGateway, RecordingHooks, SyncConfig,
    SyncContext, SyncGateway, SyncHooks, SyncManager, SyncState, WriteSection,
};
use inhalesync_model::{
    ChangeTracking, DailyFeeling, Device, FeelingLevel, InhaleEvent, Prescription,
    ReminderSetting, UserProfile,
};
use std::sync::Arc;

/// Unix seconds of the fixed instant every fixture counts from.
pub const EPOCH_SECS: i64 = 1_700_000_000;

/// The instant `secs` seconds after the fixture epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(EPOCH_SECS + secs, 0)
        .single()
        .expect("fixture timestamps are in range")
}

/// The instant `days` whole days after the fixture epoch.
pub fn day(days: i64) -> DateTime<Utc> {
    at(0) + Duration::days(days)
}

/// A calendar date for daily feelings.
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid fixture date")
}

/// A device changed locally at `time`.
pub fn dirty_device(serial: &str, time: DateTime<Utc>) -> Device {
    let mut device = Device::new(serial, "albuterol");
    device.tracking = ChangeTracking::changed_at(time);
    device
}

/// A device in sync with the server, last changed at `time`.
pub fn clean_device(serial: &str, time: DateTime<Utc>) -> Device {
    let mut device = Device::new(serial, "albuterol");
    device.tracking = ChangeTracking::clean(time);
    device
}

/// An inhale event recorded locally at `time`.
pub fn dirty_event(serial: &str, uid: u32, time: DateTime<Utc>) -> InhaleEvent {
    let mut event = InhaleEvent::new(serial, uid, time);
    event.duration_ms = 1_500;
    event.peak_flow = 600;
    event.tracking = ChangeTracking::changed_at(time);
    event
}

/// A prescription changed locally at `time`.
pub fn dirty_prescription(drug: &str, time: DateTime<Utc>) -> Prescription {
    let mut prescription = Prescription::new(drug, at(0));
    prescription.doses_per_day = 2;
    prescription.tracking = ChangeTracking::changed_at(time);
    prescription
}

/// A daily feeling changed locally at `time`.
pub fn dirty_feeling(on: NaiveDate, feeling: FeelingLevel, time: DateTime<Utc>) -> DailyFeeling {
    let mut record = DailyFeeling::new(on, feeling);
    record.tracking = ChangeTracking::changed_at(time);
    record
}

/// A reminder setting with the given tracking.
pub fn reminder(name: &str, enabled: bool, tracking: ChangeTracking) -> ReminderSetting {
    let mut setting = ReminderSetting::new(name, enabled);
    setting.tracking = tracking;
    setting
}

/// The active account owner.
pub fn owner(profile_id: &str, time: DateTime<Utc>) -> UserProfile {
    let mut profile = UserProfile::account_owner(profile_id);
    profile.first_name = "Alex".into();
    profile.date_of_birth = Some(date(1985, 6, 1));
    profile.tracking = ChangeTracking::clean(time);
    profile
}

/// A sync engine wired to in-memory stores, a manual clock, and recording
/// hooks.
pub struct Harness<G: SyncGateway + 'static = MockGateway> {
    /// The engine.
    pub manager: Arc<SyncManager>,
    /// The gateway.
    pub gateway: Arc<G>,
    /// Local datastore.
    pub stores: MemoryStores,
    /// Application clock.
    pub clock: Arc<ManualClock>,
    /// Durable settings.
    pub settings: Arc<MemorySettingsStore>,
    /// Every hook call.
    pub hooks: Arc<RecordingHooks>,
}

impl Harness<MockGateway> {
    /// A harness around a [`MockGateway`] whose server clock agrees with the
    /// client.
    pub fn mock() -> Self {
        let gateway = Arc::new(MockGateway::new(Some(at(0))));
        Self::with_gateway(gateway, Arc::new(ManualClock::new(at(0))), SyncConfig::default())
    }
}

impl Harness<SimulatedService> {
    /// A harness around a fresh [`SimulatedService`] sharing the client clock.
    pub fn simulated() -> Self {
        Self::simulated_with(|service| service)
    }

    /// A harness around a [`SimulatedService`] customised by `build`.
    pub fn simulated_with(build: impl FnOnce(SimulatedService) -> SimulatedService) -> Self {
        let clock = Arc::new(ManualClock::new(at(0)));
        let service = Arc::new(build(SimulatedService::new(clock.clone())));
        Self::with_gateway(service, clock, SyncConfig::default())
    }
}

impl<G: SyncGateway + 'static> Harness<G> {
    /// Wires an engine around `gateway`.
    pub fn with_gateway(gateway: Arc<G>, clock: Arc<ManualClock>, config: SyncConfig) -> Self {
        let stores = MemoryStores::new();
        let settings = Arc::new(MemorySettingsStore::new());
        let hooks = Arc::new(RecordingHooks::new());
        let manager = SyncManager::new(
            config,
            SyncContext {
                repositories: stores.repositories(),
                gateway: gateway.clone(),
                clock: clock.clone(),
                settings: settings.clone(),
                hooks: SyncHooks::all(hooks.clone()),
                write_section: WriteSection::new(),
            },
        );
        Self {
            manager,
            gateway,
            stores,
            clock,
            settings,
            hooks,
        }
    }

    /// Runs one cycle whose callbacks complete synchronously.
    ///
    /// # Panics
    ///
    /// Panics if the cycle could not start or did not return to idle.
    pub fn sync(&self) {
        self.manager.sync().expect("sync should start");
        assert_eq!(
            self.manager.state(),
            SyncState::Idle,
            "cycle should finish synchronously"
        );
    }

    /// Moves the clock forward by whole days.
    pub fn advance_days(&self, days: i64) {
        self.clock.advance(Duration::days(days));
    }
}

/// Waits until `manager` is idle again, polling every few milliseconds.
///
/// Returns false if `timeout` elapsed first.
pub async fn wait_for_idle(manager: &SyncManager, timeout: std::time::Duration) -> bool {
    let poll = async {
        while manager.state() != SyncState::Idle {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}
