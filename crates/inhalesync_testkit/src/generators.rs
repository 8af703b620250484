//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records and batches that keep the
//! change-tracking invariant: a dirty record always has a change time.

use crate::fixtures::at;
use chrono::{DateTime, Utc};
use inhalesync_model::{
    ChangeTracking, DailyFeeling, Device, FeelingLevel, InhaleEvent, ReminderSetting, SyncBatch,
};
use proptest::prelude::*;

/// Strategy for instants within a day of the fixture epoch.
pub fn instant_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..86_400).prop_map(at)
}

/// Strategy for change tracking as downloaded from the service.
///
/// Downloaded records are clean; a few carry no change time at all.
pub fn remote_tracking_strategy() -> impl Strategy<Value = ChangeTracking> {
    prop_oneof![
        9 => instant_strategy().prop_map(ChangeTracking::clean),
        1 => Just(ChangeTracking::default()),
    ]
}

/// Strategy for change tracking of local records.
pub fn local_tracking_strategy() -> impl Strategy<Value = ChangeTracking> {
    (instant_strategy(), any::<bool>(), prop::option::of(-120i64..120)).prop_map(
        |(time, dirty, offset)| {
            let mut tracking = if dirty {
                ChangeTracking::changed_at(time)
            } else {
                ChangeTracking::clean(time)
            };
            tracking.server_time_offset = offset;
            tracking
        },
    )
}

/// Strategy for device serial numbers from a small pool, so keys collide.
pub fn serial_strategy() -> impl Strategy<Value = String> {
    (0u8..6).prop_map(|n| format!("SN-{n:03}"))
}

/// Strategy for devices.
pub fn device_strategy(
    tracking: impl Strategy<Value = ChangeTracking>,
) -> impl Strategy<Value = Device> {
    (serial_strategy(), "[a-z]{0,8}", any::<u16>(), tracking).prop_map(
        |(serial, nickname, remaining, tracking)| {
            let mut device = Device::new(serial, "albuterol");
            device.nickname = nickname;
            device.remaining_doses = u32::from(remaining);
            device.tracking = tracking;
            device
        },
    )
}

/// Strategy for inhale events on devices from [`serial_strategy`].
pub fn inhale_event_strategy(
    tracking: impl Strategy<Value = ChangeTracking>,
) -> impl Strategy<Value = InhaleEvent> {
    (serial_strategy(), 0u32..20, instant_strategy(), 0u32..4_000, tracking).prop_map(
        |(serial, uid, time, duration_ms, tracking)| {
            let mut event = InhaleEvent::new(serial, uid, time);
            event.duration_ms = duration_ms;
            event.tracking = tracking;
            event
        },
    )
}

/// Strategy for daily feelings within one week.
pub fn daily_feeling_strategy(
    tracking: impl Strategy<Value = ChangeTracking>,
) -> impl Strategy<Value = DailyFeeling> {
    let feeling = prop_oneof![
        Just(FeelingLevel::Poor),
        Just(FeelingLevel::Bad),
        Just(FeelingLevel::Ok),
        Just(FeelingLevel::Good),
        Just(FeelingLevel::Great),
    ];
    (1u32..8, feeling, tracking).prop_map(|(day, feeling, tracking)| {
        let mut record = DailyFeeling::new(crate::fixtures::date(2024, 3, day), feeling);
        record.tracking = tracking;
        record
    })
}

/// Strategy for reminder settings from a small pool of names.
pub fn reminder_setting_strategy(
    tracking: impl Strategy<Value = ChangeTracking>,
) -> impl Strategy<Value = ReminderSetting> {
    (
        prop_oneof![Just("DailySelfAssessment"), Just("DailyEnvironmental")],
        any::<bool>(),
        tracking,
    )
        .prop_map(|(name, enabled, tracking)| {
            let mut setting = ReminderSetting::new(name, enabled);
            setting.tracking = tracking;
            setting
        })
}

/// Strategy for a batch as downloaded from the service.
///
/// Keys may repeat within a batch, as they do across pages.
pub fn download_batch_strategy() -> impl Strategy<Value = SyncBatch> {
    (
        prop::collection::vec(device_strategy(remote_tracking_strategy()), 0..6),
        prop::collection::vec(inhale_event_strategy(remote_tracking_strategy()), 0..12),
        prop::collection::vec(daily_feeling_strategy(remote_tracking_strategy()), 0..6),
        prop::collection::vec(reminder_setting_strategy(remote_tracking_strategy()), 0..3),
    )
        .prop_map(|(devices, inhale_events, daily_feelings, reminder_settings)| SyncBatch {
            devices,
            inhale_events,
            daily_feelings,
            reminder_settings,
            ..SyncBatch::default()
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
