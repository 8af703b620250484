//! Host collaborators notified by the engine.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Raises and clears user-visible notifications.
pub trait NotificationSink: Send + Sync {
    /// Raises the notification `id` with the given payload.
    fn raise_notification(&self, id: &str, data: &BTreeMap<String, String>);

    /// Clears the notification `id` if it is showing.
    fn clear_notification(&self, id: &str);
}

/// Schedules device-level reminders.
pub trait ReminderScheduler: Send + Sync {
    /// Reschedules or cancels the reminder to match a merged setting.
    fn apply_reminder_state(&self, setting_name: &str, enabled: bool);
}

/// Device connection management.
pub trait DeviceLifecycle: Send + Sync {
    /// Called once per merge that inserted new devices.
    fn on_devices_changed(&self);
}

/// Care programs a profile is enrolled in.
pub trait ProgramDirectory: Send + Sync {
    /// Refreshes the program list of the given profile.
    fn refresh_program_list(&self, profile_id: &str);
}

/// Something worth telling the host about during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncActivity {
    /// A cycle returned to idle.
    CycleFinished {
        /// Whether the cycle succeeded.
        success: bool,
        /// Wall time spent in the cycle.
        duration: Duration,
    },
    /// A single batch carried more inhale events than expected.
    LargeInhaleBatch {
        /// Number of inhale events in the batch.
        count: usize,
        /// Whether the batch was being uploaded rather than downloaded.
        upload: bool,
    },
    /// A new server time offset was computed.
    ServerTimeOffsetUpdated {
        /// Offset in seconds.
        offset: i64,
        /// Whether the offset is within the acceptable range.
        within_range: bool,
    },
}

/// Observes cycle completion and engine activity.
pub trait SyncListener: Send + Sync {
    /// Called when a cycle finished all its phases successfully.
    fn on_sync_complete(&self);

    /// Called for every [`SyncActivity`].
    fn on_activity(&self, _activity: &SyncActivity) {}
}

/// Hook that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl NotificationSink for NoopHooks {
    fn raise_notification(&self, _id: &str, _data: &BTreeMap<String, String>) {}
    fn clear_notification(&self, _id: &str) {}
}

impl ReminderScheduler for NoopHooks {
    fn apply_reminder_state(&self, _setting_name: &str, _enabled: bool) {}
}

impl DeviceLifecycle for NoopHooks {
    fn on_devices_changed(&self) {}
}

impl ProgramDirectory for NoopHooks {
    fn refresh_program_list(&self, _profile_id: &str) {}
}

impl SyncListener for NoopHooks {
    fn on_sync_complete(&self) {}
}

/// Every host collaborator the engine calls into.
#[derive(Clone)]
pub struct SyncHooks {
    /// Notification sink.
    pub notifications: Arc<dyn NotificationSink>,
    /// Reminder scheduler.
    pub reminders: Arc<dyn ReminderScheduler>,
    /// Device lifecycle.
    pub devices: Arc<dyn DeviceLifecycle>,
    /// Program directory.
    pub programs: Arc<dyn ProgramDirectory>,
    /// Sync listener.
    pub listener: Arc<dyn SyncListener>,
}

impl SyncHooks {
    /// Hooks that ignore everything.
    pub fn noop() -> Self {
        Self::all(Arc::new(NoopHooks))
    }

    /// Uses one object for every collaborator.
    pub fn all<H>(hooks: Arc<H>) -> Self
    where
        H: NotificationSink
            + ReminderScheduler
            + DeviceLifecycle
            + ProgramDirectory
            + SyncListener
            + 'static,
    {
        Self {
            notifications: hooks.clone(),
            reminders: hooks.clone(),
            devices: hooks.clone(),
            programs: hooks.clone(),
            listener: hooks,
        }
    }
}

impl Default for SyncHooks {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHooks").finish_non_exhaustive()
    }
}

/// A call received by [`RecordingHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// `raise_notification`.
    NotificationRaised {
        /// Notification ID.
        id: String,
        /// Payload.
        data: BTreeMap<String, String>,
    },
    /// `clear_notification`.
    NotificationCleared(String),
    /// `apply_reminder_state`.
    ReminderApplied {
        /// Setting name.
        name: String,
        /// New state.
        enabled: bool,
    },
    /// `on_devices_changed`.
    DevicesChanged,
    /// `refresh_program_list`.
    ProgramListRefreshed(String),
    /// `on_sync_complete`.
    SyncComplete,
    /// `on_activity`.
    Activity(SyncActivity),
}

/// Hooks that record every call, for tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far.
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&HookEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Number of times notification `id` was raised.
    pub fn raised(&self, id: &str) -> usize {
        self.count(|event| matches!(event, HookEvent::NotificationRaised { id: raised, .. } if raised == id))
    }

    /// Number of times notification `id` was cleared.
    pub fn cleared(&self, id: &str) -> usize {
        self.count(|event| matches!(event, HookEvent::NotificationCleared(cleared) if cleared == id))
    }

    /// Number of completed cycles.
    pub fn completions(&self) -> usize {
        self.count(|event| matches!(event, HookEvent::SyncComplete))
    }

    /// Recorded activities, in order.
    pub fn activities(&self) -> Vec<SyncActivity> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HookEvent::Activity(activity) => Some(activity.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().push(event);
    }
}

impl NotificationSink for RecordingHooks {
    fn raise_notification(&self, id: &str, data: &BTreeMap<String, String>) {
        self.push(HookEvent::NotificationRaised {
            id: id.to_string(),
            data: data.clone(),
        });
    }

    fn clear_notification(&self, id: &str) {
        self.push(HookEvent::NotificationCleared(id.to_string()));
    }
}

impl ReminderScheduler for RecordingHooks {
    fn apply_reminder_state(&self, setting_name: &str, enabled: bool) {
        self.push(HookEvent::ReminderApplied {
            name: setting_name.to_string(),
            enabled,
        });
    }
}

impl DeviceLifecycle for RecordingHooks {
    fn on_devices_changed(&self) {
        self.push(HookEvent::DevicesChanged);
    }
}

impl ProgramDirectory for RecordingHooks {
    fn refresh_program_list(&self, profile_id: &str) {
        self.push(HookEvent::ProgramListRefreshed(profile_id.to_string()));
    }
}

impl SyncListener for RecordingHooks {
    fn on_sync_complete(&self) {
        self.push(HookEvent::SyncComplete);
    }

    fn on_activity(&self, activity: &SyncActivity) {
        self.push(HookEvent::Activity(activity.clone()));
    }
}
