//! Init command implementation.

use std::path::Path;
use xlog_core::{Config, WalManager};

/// Runs the init command.
pub fn run(
    path: &Path,
    page_size: u32,
    segment_size: u32,
    archive: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new()
        .wal_page_size(page_size)
        .segment_size(segment_size)
        .archive_mode(archive);
    let system_id = WalManager::bootstrap(path, &config)?;

    println!("Initialized data directory at {}", path.display());
    println!("  System identifier: {system_id}");
    println!("  WAL page size:     {page_size}");
    println!("  Segment size:      {segment_size}");
    Ok(())
}
