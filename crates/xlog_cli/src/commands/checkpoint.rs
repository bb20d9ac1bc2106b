//! Checkpoint command implementation.

use super::Cluster;
use std::path::Path;
use xlog_core::{Collaborators, WalManager};

/// Runs the checkpoint command: opens the data directory, which replays
/// any log past the last checkpoint, then shuts down cleanly.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = Cluster::open(path)?;
    let config = cluster.config();
    drop(cluster);

    let manager = WalManager::open(path, config, Collaborators::default())?;
    let report = manager.startup_report().clone();
    let outcome = manager.shutdown()?;

    if report.performed_recovery {
        println!(
            "Recovery replayed {} records, log ended at {}",
            report.records_replayed, report.end_of_log
        );
        if let Some(tli) = report.new_timeline {
            println!("Switched to timeline {tli}");
        }
    } else {
        println!("No recovery needed");
    }
    println!("Shutdown checkpoint at {} (redo {})", outcome.lsn, outcome.redo);
    Ok(())
}
