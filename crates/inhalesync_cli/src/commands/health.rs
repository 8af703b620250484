//! Health command implementation.

use super::simulate::format_time;
use crate::state_file::FileSettingsStore;
use inhalesync_engine::{NoopHooks, SyncConfig, SyncHealth, SyncHealthMonitor};
use std::path::Path;
use std::sync::Arc;

/// Reads the sync health kept in a state file.
pub fn read(path: &Path) -> Result<SyncHealth, Box<dyn std::error::Error>> {
    let store = FileSettingsStore::open(path)?;
    let monitor = SyncHealthMonitor::new(
        Arc::new(store),
        Arc::new(NoopHooks),
        SyncConfig::default().stale_sync_threshold_days,
    );
    Ok(monitor.health())
}

/// Runs the health command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let health = read(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&health)?),
        _ => {
            println!("Sync Health");
            println!("===========");
            println!();
            println!("State file:   {}", path.display());
            println!("Last success: {}", format_time(health.last_successful));
            println!("Last failure: {}", format_time(health.last_failed));
            println!(
                "Stale alert:  {}",
                if health.notification_active {
                    "active"
                } else {
                    "inactive"
                }
            );
        }
    }
    Ok(())
}
