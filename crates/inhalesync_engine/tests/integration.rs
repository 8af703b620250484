//! Integration tests for the sync engine against the simulated service.

use chrono::Duration;
use inhalesync_engine::{
    HookEvent, ManualClock, MemoryStores, MergeResolver, ScriptedDownload, SyncConfig, SyncError, SyncGateway, SyncHooks,
    SyncState, WriteSection, GOOD_INHALATION_FEEDBACK_SETTING, STALE_SYNC_NOTIFICATION_ID,
};
use inhalesync_model::{ChangeTracking, FeelingLevel, SyncBatch, TrackedRecord};
use inhalesync_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use tokio::runtime::Handle;

fn existing_account() -> SyncBatch {
    let mut batch = SyncBatch::new();
    let mut prescription = dirty_prescription("albuterol", at(-3_600));
    prescription.tracking = ChangeTracking::clean(at(-3_600));
    batch.push(prescription);
    batch.push(clean_device("SN-1", at(-3_600)));
    batch.push(clean_device("SN-2", at(-3_600)));
    for uid in 0..3 {
        let mut event = dirty_event("SN-1", uid, at(-1_800));
        event.tracking = ChangeTracking::clean(at(-1_800));
        batch.push(event);
    }
    batch.push(reminder(
        "DailySelfAssessment",
        true,
        ChangeTracking::clean(at(-600)),
    ));
    batch
}

fn stored(stores: &MemoryStores) -> SyncBatch {
    SyncBatch {
        prescriptions: stores.prescriptions.snapshot(),
        devices: stores.devices.snapshot(),
        inhale_events: stores.inhale_events.snapshot(),
        daily_feelings: stores.daily_feelings.snapshot(),
        reminder_settings: stores.reminder_settings.snapshot(),
        profiles: stores.profiles.snapshot(),
    }
}

fn assert_clean_with_offset<R: TrackedRecord>(records: &[R], offset: i64) {
    for record in records {
        assert!(!record.has_changed(), "{record:?} still dirty");
        assert_eq!(record.tracking().server_time_offset, Some(offset));
    }
}

#[test]
fn first_sync_bootstraps_then_runs_two_passes() {
    let harness = Harness::simulated_with(|service| service.with_account(existing_account()));
    assert!(!harness.manager.has_synced());

    harness.sync();

    assert!(harness.manager.has_synced());
    assert!(!harness.gateway.is_first_sync());
    assert_eq!(harness.stores.prescriptions.len(), 1);
    assert_eq!(harness.stores.devices.len(), 2);
    assert_eq!(harness.stores.inhale_events.len(), 3);
    assert_eq!(harness.stores.reminder_settings.len(), 1);
    assert_eq!(harness.stores.dirty_count(), 0);

    let service = harness.gateway.stats();
    assert_eq!(service.bootstrap_downloads, 1);
    assert_eq!(service.downloads, 2);
    assert_eq!(service.uploads, 0);

    assert_eq!(
        harness.hooks.count(|e| matches!(e, HookEvent::DevicesChanged)),
        1
    );
    assert!(harness.hooks.events().contains(&HookEvent::ReminderApplied {
        name: "DailySelfAssessment".into(),
        enabled: true,
    }));
    assert_eq!(harness.hooks.completions(), 1);
    assert_eq!(harness.manager.stats().cycles_completed, 1);
}

#[test]
fn changes_ahead_of_server_clock_wait_for_a_later_cycle() {
    let harness = Harness::simulated();
    harness.stores.devices.put(dirty_device("SN-1", at(0)));
    harness
        .stores
        .prescriptions
        .put(dirty_prescription("albuterol", at(600)));

    harness.sync();

    let cloud = harness.gateway.cloud();
    assert_eq!(cloud.devices.len(), 1);
    assert!(cloud.prescriptions.is_empty());

    let device = harness
        .stores
        .devices
        .find(&"SN-1".to_string())
        .expect("device stored");
    assert!(!device.has_changed());
    assert_eq!(device.tracking.server_time_offset, Some(0));

    let prescription = &harness.stores.prescriptions.snapshot()[0];
    assert!(prescription.has_changed());
    assert_eq!(prescription.tracking.server_time_offset, Some(0));

    harness.clock.set(at(600));
    harness.sync();

    assert_eq!(harness.gateway.cloud().prescriptions.len(), 1);
    assert_eq!(harness.stores.dirty_count(), 0);
}

#[test]
fn failed_upload_marks_every_record_dirty_again() {
    let harness = Harness::simulated();
    for serial in ["SN-1", "SN-2", "SN-3"] {
        harness.stores.devices.put(dirty_device(serial, at(0)));
    }
    harness.stores.inhale_events.put(dirty_event("SN-1", 1, at(0)));
    harness.stores.inhale_events.put(dirty_event("SN-2", 1, at(0)));
    harness.gateway.fail_next_uploads(1);

    harness.sync();

    assert_eq!(harness.stores.dirty_count(), 5);
    let stats = harness.manager.stats();
    assert_eq!(stats.cycles_failed, 1);
    assert_eq!(stats.records_uploaded, 0);
    assert!(stats.last_error.is_some());

    let service = harness.gateway.stats();
    assert_eq!(service.failed_uploads, 1);
    assert_eq!(service.downloads, 0);
    assert_eq!(harness.manager.health().last_failed, Some(at(0)));

    harness.sync();

    assert_eq!(harness.stores.dirty_count(), 0);
    let cloud = harness.gateway.cloud();
    assert_eq!(cloud.devices.len(), 3);
    assert_eq!(cloud.inhale_events.len(), 2);
}

#[test]
fn only_one_cycle_runs_at_a_time() {
    let harness = Harness::mock();
    harness.stores.devices.put(dirty_device("SN-1", at(0)));
    harness.gateway.set_held(true);

    let started = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| harness.manager.sync()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("sync thread"))
            .filter(Result::is_ok)
            .count()
    });

    assert_eq!(started, 1);
    assert!(harness.manager.state().is_active());
    assert!(matches!(
        harness.manager.sync(),
        Err(SyncError::InvalidStateTransition { .. })
    ));

    while harness.gateway.complete_next() {}

    assert_eq!(harness.manager.state(), SyncState::Idle);
    assert_eq!(harness.gateway.upload_count(), 1);
    assert_eq!(harness.manager.stats().cycles_completed, 1);
}

#[test]
fn stale_sync_raised_once_and_cleared_on_recovery() {
    let harness = Harness::simulated();
    harness.sync();

    for _ in 1..14 {
        harness.advance_days(1);
        harness.gateway.fail_next_downloads(1);
        harness.sync();
    }
    assert_eq!(harness.hooks.raised(STALE_SYNC_NOTIFICATION_ID), 0);

    for _ in 14..17 {
        harness.advance_days(1);
        harness.gateway.fail_next_downloads(1);
        harness.sync();
    }
    assert_eq!(harness.hooks.raised(STALE_SYNC_NOTIFICATION_ID), 1);
    assert!(harness.manager.health().notification_active);

    harness.advance_days(1);
    harness.sync();

    assert_eq!(harness.hooks.cleared(STALE_SYNC_NOTIFICATION_ID), 1);
    let health = harness.manager.health();
    assert!(!health.notification_active);
    assert_eq!(health.last_successful, Some(day(17)));
}

#[test]
fn offline_service_defers_without_touching_health() {
    let harness = Harness::simulated();
    harness.stores.devices.put(dirty_device("SN-1", at(0)));
    harness.gateway.set_offline(true);

    harness.sync();

    let stats = harness.manager.stats();
    assert_eq!(stats.cycles_deferred, 1);
    assert_eq!(stats.cycles_failed, 0);
    assert_eq!(harness.manager.health().last_failed, None);
    assert_eq!(harness.stores.dirty_count(), 1);
    assert_eq!(harness.hooks.completions(), 0);
}

#[test]
fn successful_cycle_leaves_every_record_clean_and_stamped() {
    let harness = Harness::simulated();
    harness.gateway.set_skew(Duration::seconds(30));
    harness
        .stores
        .prescriptions
        .put(dirty_prescription("albuterol", at(0)));
    harness.stores.devices.put(dirty_device("SN-1", at(0)));
    harness.stores.inhale_events.put(dirty_event("SN-1", 7, at(0)));
    harness.stores.daily_feelings.put(dirty_feeling(
        date(2024, 3, 1),
        FeelingLevel::Good,
        at(0),
    ));
    harness.stores.reminder_settings.put(reminder(
        "DailySelfAssessment",
        true,
        ChangeTracking::changed_at(at(0)),
    ));

    harness.sync();

    assert_eq!(harness.manager.server_time_offset(), Some(30));
    let local = stored(&harness.stores);
    assert_eq!(local.len(), 5);
    assert_clean_with_offset(&local.prescriptions, 30);
    assert_clean_with_offset(&local.devices, 30);
    assert_clean_with_offset(&local.inhale_events, 30);
    assert_clean_with_offset(&local.daily_feelings, 30);
    assert_clean_with_offset(&local.reminder_settings, 30);
    assert_eq!(harness.gateway.cloud().len(), 5);
}

#[test]
fn device_local_settings_stay_on_the_phone() {
    let harness = Harness::simulated();
    harness.stores.reminder_settings.put(reminder(
        GOOD_INHALATION_FEEDBACK_SETTING,
        false,
        ChangeTracking::changed_at(at(0)),
    ));
    let mut remote = SyncBatch::new();
    remote.push(reminder(
        GOOD_INHALATION_FEEDBACK_SETTING,
        true,
        ChangeTracking::clean(at(60)),
    ));
    harness.gateway.publish(remote);

    harness.sync();

    let setting = harness
        .stores
        .reminder_settings
        .find(&GOOD_INHALATION_FEEDBACK_SETTING.to_string())
        .expect("setting kept");
    assert!(!setting.is_enabled);
    assert_eq!(harness.gateway.stats().uploads, 0);
    assert_eq!(
        harness
            .hooks
            .count(|e| matches!(e, HookEvent::ReminderApplied { .. })),
        0
    );
}

#[test]
fn paged_download_merges_every_page() {
    let harness = Harness::simulated_with(|service| service.with_page_size(2));
    let mut remote = SyncBatch::new();
    remote.push(clean_device("SN-9", at(0)));
    for uid in 0..5 {
        let mut event = dirty_event("SN-9", uid, at(0));
        event.tracking = ChangeTracking::clean(at(0));
        remote.push(event);
    }
    harness.gateway.publish(remote);

    harness.sync();

    assert_eq!(harness.gateway.stats().downloads, 3);
    assert_eq!(harness.gateway.pending(), 0);
    assert_eq!(harness.stores.inhale_events.len(), 5);
    let stats = harness.manager.stats();
    assert_eq!(stats.records_downloaded, 6);
    assert_eq!(stats.merged.inserted, 6);
}

#[test]
fn events_for_unknown_devices_are_dropped() {
    let harness = Harness::simulated();
    let mut remote = SyncBatch::new();
    remote.push(dirty_event("SN-404", 1, at(0)));
    remote.push(dirty_event("SN-404", 2, at(0)));
    harness.gateway.publish(remote);

    harness.sync();

    assert!(harness.stores.inhale_events.is_empty());
    assert_eq!(harness.manager.stats().merged.dropped_events, 2);
}

#[test]
fn newer_local_change_survives_download() {
    let harness = Harness::simulated();
    let mut local = dirty_device("SN-1", at(120));
    local.nickname = "mine".into();
    harness.stores.devices.put(local);

    let mut remote = SyncBatch::new();
    let mut theirs = clean_device("SN-1", at(60));
    theirs.nickname = "theirs".into();
    remote.push(theirs);
    harness.gateway.publish(remote);
    harness.clock.set(at(180));

    harness.sync();

    let device = harness
        .stores
        .devices
        .find(&"SN-1".to_string())
        .expect("device stored");
    assert_eq!(device.nickname, "mine");
    assert_eq!(harness.gateway.cloud().devices[0].nickname, "mine");
    assert_eq!(harness.manager.stats().merged.discarded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_on_runtime_threads_finish_the_cycle() {
    let handle = Handle::current();
    let harness =
        Harness::simulated_with(move |service| service.with_delivery(Delivery::Spawned(handle)));
    for serial in ["SN-1", "SN-2", "SN-3"] {
        harness.stores.devices.put(dirty_device(serial, at(0)));
    }

    harness.manager.sync().expect("sync should start");

    assert!(wait_for_idle(&harness.manager, std::time::Duration::from_secs(5)).await);
    assert_eq!(harness.stores.dirty_count(), 0);
    assert_eq!(harness.gateway.cloud().devices.len(), 3);
    assert_eq!(harness.hooks.completions(), 1);
}

#[test]
fn first_sync_pushes_local_owner_birth_date() {
    let harness = Harness::mock();
    harness.gateway.set_first_sync(true);
    harness.clock.set(at(30));
    harness.gateway.set_server_time(Some(at(30)));

    let mut local = owner("owner-1", at(0));
    local.date_of_birth = Some(date(1980, 1, 1));
    local.tracking = ChangeTracking::default();
    harness.stores.profiles.put(local);

    let mut remote = owner("owner-1", at(10));
    remote.date_of_birth = Some(date(1981, 2, 2));
    let mut bootstrap = SyncBatch::new();
    bootstrap.push(remote);
    harness
        .gateway
        .push_bootstrap_download(ScriptedDownload::ok(bootstrap, true));

    harness.sync();

    let uploaded: Vec<_> = harness
        .gateway
        .uploaded_batches()
        .into_iter()
        .flat_map(|batch| batch.profiles)
        .collect();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].date_of_birth, Some(date(1980, 1, 1)));
    assert_eq!(uploaded[0].tracking.change_time, Some(at(30)));
    assert_eq!(harness.stores.dirty_count(), 0);
}

fn resolver(stores: &MemoryStores) -> MergeResolver {
    MergeResolver::new(
        stores.repositories(),
        SyncHooks::noop(),
        Arc::new(SyncConfig::default()),
        Arc::new(ManualClock::new(at(0))),
        WriteSection::new(),
    )
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn merging_twice_changes_nothing(batch in download_batch_strategy()) {
        let stores = MemoryStores::new();
        let merger = resolver(&stores);

        merger.merge(&batch, false);
        let once = stored(&stores);
        let again = merger.merge(&batch, false);

        prop_assert_eq!(stored(&stores), once);
        prop_assert_eq!(again.inserted, 0);
        prop_assert_eq!(again.updated, 0);
        prop_assert_eq!(stores.dirty_count(), 0);
    }

    #[test]
    fn latest_change_wins(batch in download_batch_strategy()) {
        let stores = MemoryStores::new();
        let mut local = dirty_device("SN-000", day(2));
        local.nickname = "local".into();
        stores.devices.put(local.clone());

        resolver(&stores).merge(&batch, false);

        for device in &batch.devices {
            let latest = batch
                .devices
                .iter()
                .filter(|other| other.serial_number == device.serial_number)
                .map(|other| other.tracking.change_time)
                .max()
                .flatten();
            let merged = stores.devices.find(&device.serial_number).expect("merged");
            if device.serial_number == "SN-000" {
                prop_assert_eq!(&merged, &local);
            } else {
                prop_assert_eq!(merged.tracking.change_time, latest);
            }
        }
    }
}
