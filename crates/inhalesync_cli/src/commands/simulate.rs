//! Simulate command implementation.
//!
//! Runs one phone against the simulated service on an accelerated clock. Each
//! simulated day the phone records inhalations, another phone on the same
//! account occasionally publishes a change, and the engine runs one sync
//! cycle whose gateway callbacks complete on runtime tasks.

use crate::state_file::FileSettingsStore;
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use inhalesync_engine::{
    AcceleratedClock, AppClock, MemorySettingsStore, MemoryStores, RecordingHooks, SettingsStore,
    SyncConfig, SyncContext, SyncHealth, SyncHooks, SyncManager, SyncStats, SystemClock,
    WriteSection, STALE_SYNC_NOTIFICATION_ID,
};
use inhalesync_model::{
    BatchCounts, ChangeTracking, DailyFeeling, Device, FeelingLevel, InhaleEvent, Prescription,
    ReminderSetting, SyncBatch, UserProfile,
};
use inhalesync_testkit::{wait_for_idle, Delivery, ServiceStats, SimulatedService};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serial number of the inhaler paired with the simulated phone.
pub const PHONE_DEVICE: &str = "SN-PHONE-1";

const CYCLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Options for `simulate`.
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Simulated days, one sync cycle per day
    #[arg(short, long, default_value_t = 21)]
    pub days: u32,

    /// Clock acceleration factor
    #[arg(short, long, default_value_t = 1_000_000)]
    pub rate: i32,

    /// Inhalations recorded on this phone per day
    #[arg(long, default_value_t = 4)]
    pub events_per_day: u32,

    /// Another phone publishes a change every N days (0 disables)
    #[arg(long, default_value_t = 3)]
    pub remote_every: u32,

    /// First day of a service outage
    #[arg(long)]
    pub outage_from: Option<u32>,

    /// Length of the outage in days
    #[arg(long, default_value_t = 0)]
    pub outage_days: u32,

    /// Seconds the server clock runs ahead of the phone (negative: behind)
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub skew_secs: i64,

    /// Records per download page
    #[arg(long, default_value_t = inhalesync_testkit::DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Start from an account that already has records on the service
    #[arg(long)]
    pub existing_account: bool,

    /// JSON file keeping sync health between runs
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            days: 21,
            rate: 1_000_000,
            events_per_day: 4,
            remote_every: 3,
            outage_from: None,
            outage_days: 0,
            skew_secs: 0,
            page_size: inhalesync_testkit::DEFAULT_PAGE_SIZE,
            existing_account: false,
            state: None,
            format: "text".to_string(),
        }
    }
}

impl SimulateArgs {
    fn in_outage(&self, day: u32) -> bool {
        self.outage_from
            .is_some_and(|from| day >= from && day - from < self.outage_days)
    }
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Run identifier, also the account owner's profile ID.
    pub run_id: Uuid,
    /// Simulated days.
    pub days: u32,
    /// Application time when the run started.
    pub started_at: DateTime<Utc>,
    /// Application time when the run finished.
    pub finished_at: DateTime<Utc>,
    /// Engine statistics.
    pub stats: SyncStats,
    /// Stored sync health.
    pub health: SyncHealth,
    /// Service counters.
    pub service: ServiceStats,
    /// Records held by the phone.
    pub local: BatchCounts,
    /// Records still waiting for upload.
    pub pending_uploads: usize,
    /// Latest server time offset in seconds.
    pub server_time_offset: Option<i64>,
    /// Times the stale-sync notification was raised.
    pub stale_notifications_raised: usize,
    /// Times the stale-sync notification was cleared.
    pub stale_notifications_cleared: usize,
    /// State file, if one was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

/// Runs the simulation.
///
/// Must be called on a multi-threaded tokio runtime.
pub async fn run(args: &SimulateArgs) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let run_id = Uuid::new_v4();
    let clock = Arc::new(AcceleratedClock::new(args.rate));
    let started_at = clock.now();
    info!(%run_id, days = args.days, rate = clock.rate(), "starting simulation");

    // The service reports wall-clock time, like a real server.
    let mut service = SimulatedService::new(Arc::new(SystemClock))
        .with_page_size(args.page_size)
        .with_delivery(Delivery::Spawned(Handle::current()));
    if args.existing_account {
        service = service.with_account(existing_account(started_at));
    }
    let service = Arc::new(service);
    service.set_skew(Duration::nanoseconds(
        args.skew_secs.saturating_mul(1_000_000_000) / i64::from(clock.rate()),
    ));

    let (settings, state_file): (Arc<dyn SettingsStore>, _) = match &args.state {
        Some(path) => {
            let store = FileSettingsStore::open(path)?;
            let shown = store.path().display().to_string();
            (Arc::new(store), Some(shown))
        }
        None => (Arc::new(MemorySettingsStore::new()), None),
    };

    let stores = MemoryStores::new();
    let mut owner = UserProfile::account_owner(run_id.to_string());
    owner.tracking = ChangeTracking::clean(started_at);
    stores.profiles.put(owner);
    if !args.existing_account {
        let mut device = Device::new(PHONE_DEVICE, "albuterol");
        device.tracking = ChangeTracking::changed_at(started_at);
        stores.devices.put(device);
    }

    let hooks = Arc::new(RecordingHooks::new());
    let manager = SyncManager::new(
        SyncConfig::default(),
        SyncContext {
            repositories: stores.repositories(),
            gateway: service.clone(),
            clock: clock.clone(),
            settings,
            hooks: SyncHooks::all(hooks.clone()),
            write_section: WriteSection::new(),
        },
    );

    let mut next_uid = 0;
    for day in 0..args.days {
        wait_until(&clock, started_at + Duration::days(i64::from(day))).await;
        let now = clock.now();
        for n in 0..args.events_per_day {
            let time = now - Duration::minutes(i64::from(n) * 30);
            let mut event = InhaleEvent::new(PHONE_DEVICE, next_uid, time);
            event.duration_ms = 1_200 + n * 100;
            event.tracking = ChangeTracking::changed_at(time);
            stores.inhale_events.put(event);
            next_uid += 1;
        }
        if args.remote_every > 0 && day > 0 && day % args.remote_every == 0 {
            debug!(day, "other phone publishes changes");
            service.publish(remote_change(day, now));
        }

        let outage = args.in_outage(day);
        if outage {
            service.fail_next_uploads(1);
            service.fail_next_downloads(1);
        }

        match manager.sync() {
            Ok(()) => {
                if !wait_for_idle(&manager, CYCLE_TIMEOUT).await {
                    return Err(format!("day {day}: sync cycle did not finish").into());
                }
            }
            Err(err) => warn!(day, error = %err, "sync not started"),
        }
        service.fail_next_uploads(0);
        service.fail_next_downloads(0);

        let health = manager.health();
        info!(
            day,
            outage,
            pending = stores.dirty_count(),
            stale = health.notification_active,
            "day finished"
        );
    }

    let report = SimulationReport {
        run_id,
        days: args.days,
        started_at,
        finished_at: clock.now(),
        stats: manager.stats(),
        health: manager.health(),
        service: service.stats(),
        local: BatchCounts {
            prescriptions: stores.prescriptions.len(),
            devices: stores.devices.len(),
            inhale_events: stores.inhale_events.len(),
            daily_feelings: stores.daily_feelings.len(),
            reminder_settings: stores.reminder_settings.len(),
            profiles: stores.profiles.len(),
        },
        pending_uploads: stores.dirty_count(),
        server_time_offset: manager.server_time_offset(),
        stale_notifications_raised: hooks.raised(STALE_SYNC_NOTIFICATION_ID),
        stale_notifications_cleared: hooks.cleared(STALE_SYNC_NOTIFICATION_ID),
        state_file,
    };
    info!(%run_id, cycles = report.stats.cycles_completed, "simulation finished");
    Ok(report)
}

/// Prints `report` in the requested format.
pub fn print(report: &SimulationReport, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(report)?),
        _ => print_text_output(report),
    }
    Ok(())
}

/// Sleeps until the application clock reads `target`.
async fn wait_until(clock: &AcceleratedClock, target: DateTime<Utc>) {
    if let Ok(remaining) = (target - clock.now()).to_std() {
        tokio::time::sleep(remaining / clock.rate().unsigned_abs()).await;
    }
}

fn existing_account(now: DateTime<Utc>) -> SyncBatch {
    let since = now - Duration::days(30);
    let mut batch = SyncBatch::new();

    let mut prescription = Prescription::new("albuterol", since);
    prescription.doses_per_day = 2;
    prescription.tracking = ChangeTracking::clean(since);
    batch.push(prescription);

    let mut device = Device::new(PHONE_DEVICE, "albuterol");
    device.tracking = ChangeTracking::clean(since);
    batch.push(device);

    let mut setting = ReminderSetting::new("DailySelfAssessment", true);
    setting.tracking = ChangeTracking::clean(since);
    batch.push(setting);
    batch
}

fn remote_change(day: u32, now: DateTime<Utc>) -> SyncBatch {
    let mut batch = SyncBatch::new();
    let mut feeling = DailyFeeling::new(now.date_naive(), FeelingLevel::Good);
    feeling.tracking = ChangeTracking::clean(now);
    batch.push(feeling);

    let mut setting = ReminderSetting::new("DailySelfAssessment", day % 2 == 0);
    setting.tracking = ChangeTracking::clean(now);
    batch.push(setting);
    batch
}

fn print_text_output(report: &SimulationReport) {
    println!("Inhalesync Simulation");
    println!("=====================");
    println!();
    println!("Run:      {}", report.run_id);
    println!("Days:     {}", report.days);
    println!("Started:  {}", report.started_at.to_rfc3339());
    println!("Finished: {}", report.finished_at.to_rfc3339());
    if let Some(path) = &report.state_file {
        println!("State:    {path}");
    }
    println!();
    println!("Cycles:");
    println!("  Completed: {}", report.stats.cycles_completed);
    println!("  Failed:    {}", report.stats.cycles_failed);
    println!("  Deferred:  {}", report.stats.cycles_deferred);
    if let Some(error) = &report.stats.last_error {
        println!("  Last error: {error}");
    }
    println!();
    println!("Records:");
    println!("  Uploaded:   {}", report.stats.records_uploaded);
    println!("  Downloaded: {}", report.stats.records_downloaded);
    println!(
        "  Merged:     {} inserted, {} updated, {} discarded, {} dropped",
        report.stats.merged.inserted,
        report.stats.merged.updated,
        report.stats.merged.discarded,
        report.stats.merged.dropped_events
    );
    println!("  On phone:   {}", report.local);
    println!("  Pending:    {}", report.pending_uploads);
    println!();
    println!("Server:");
    match report.server_time_offset {
        Some(offset) => println!("  Clock offset: {offset}s"),
        None => println!("  Clock offset: unknown"),
    }
    println!(
        "  Requests:     {} uploads ({} failed), {} downloads ({} failed)",
        report.service.uploads,
        report.service.failed_uploads,
        report.service.downloads + report.service.bootstrap_downloads,
        report.service.failed_downloads
    );
    println!();
    println!("Health:");
    println!("  Last success: {}", format_time(report.health.last_successful));
    println!("  Last failure: {}", format_time(report.health.last_failed));
    println!(
        "  Stale alert:  {} (raised {}, cleared {})",
        if report.health.notification_active {
            "active"
        } else {
            "inactive"
        },
        report.stale_notifications_raised,
        report.stale_notifications_cleared
    );
}

/// Formats an optional instant for text output.
pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(|| "never".to_string(), |time| time.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick(days: u32) -> SimulateArgs {
        SimulateArgs {
            days,
            events_per_day: 2,
            ..SimulateArgs::default()
        }
    }

    #[test]
    fn outage_window() {
        let args = SimulateArgs {
            outage_from: Some(2),
            outage_days: 3,
            ..SimulateArgs::default()
        };
        assert!(!args.in_outage(1));
        assert!(args.in_outage(2));
        assert!(args.in_outage(4));
        assert!(!args.in_outage(5));
        assert!(!SimulateArgs::default().in_outage(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn uploads_every_inhalation() {
        let report = run(&quick(4)).await.unwrap();

        assert_eq!(report.stats.cycles_completed, 4);
        assert_eq!(report.pending_uploads, 0);
        assert_eq!(report.local.inhale_events, 8);
        assert_eq!(report.service.records_received, 9);
        assert!(report.server_time_offset.is_some());
        assert!(report.health.last_successful.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn existing_account_is_downloaded_first() {
        let args = SimulateArgs {
            existing_account: true,
            ..quick(1)
        };
        let report = run(&args).await.unwrap();

        assert_eq!(report.service.bootstrap_downloads, 1);
        assert_eq!(report.local.prescriptions, 1);
        assert_eq!(report.local.devices, 1);
        assert_eq!(report.local.reminder_settings, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn long_outage_raises_stale_alert() {
        let dir = tempdir().unwrap();
        let args = SimulateArgs {
            outage_from: Some(1),
            outage_days: 15,
            state: Some(dir.path().join("state.json")),
            ..quick(17)
        };
        let report = run(&args).await.unwrap();

        assert_eq!(report.stats.cycles_failed, 15);
        assert_eq!(report.stale_notifications_raised, 1);
        assert_eq!(report.stale_notifications_cleared, 1);
        assert!(!report.health.notification_active);
        assert_eq!(report.pending_uploads, 0);
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn report_renders_as_json() {
        let report = SimulationReport {
            run_id: Uuid::nil(),
            days: 0,
            started_at: DateTime::from_timestamp(0, 0).unwrap(),
            finished_at: DateTime::from_timestamp(0, 0).unwrap(),
            stats: SyncStats::default(),
            health: SyncHealth::default(),
            service: ServiceStats::default(),
            local: BatchCounts::default(),
            pending_uploads: 0,
            server_time_offset: None,
            stale_notifications_raised: 0,
            stale_notifications_cleared: 0,
            state_file: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["days"], 0);
        assert!(json.get("state_file").is_none());
    }

    #[test]
    fn never_synced_formats() {
        assert_eq!(format_time(None), "never");
    }
}
