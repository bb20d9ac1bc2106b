//! Verify command implementation.

use super::Cluster;
use std::path::Path;
use xlog_core::records::{
    CheckpointRecord, RM_XLOG_ID, XLOG_CHECKPOINT_ONLINE, XLOG_CHECKPOINT_SHUTDOWN,
};
use xlog_core::Lsn;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of records read.
    pub records_checked: usize,
    /// Number of full-page images seen.
    pub backup_blocks: usize,
    /// End of the last valid record.
    pub end: Lsn,
    /// Why the scan stopped.
    pub end_reason: Option<String>,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            records_checked: 0,
            backup_blocks: 0,
            end: Lsn::INVALID,
            end_reason: None,
            errors: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying data directory at {}", path.display());
    println!();

    let cluster = Cluster::open(path)?;
    let result = verify(&cluster)?;

    println!("Records checked:      {}", result.records_checked);
    println!("Full-page images:     {}", result.backup_blocks);
    println!("End of valid log:     {}", result.end);
    if let Some(reason) = &result.end_reason {
        println!("Scan stopped at:      {reason}");
    }
    for error in &result.errors {
        println!("  ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err("Verification failed".into())
    }
}

fn verify(cluster: &Cluster) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let control = &cluster.control;
    let mut result = VerifyResult::new();
    if !control.checkpoint.is_valid() {
        result.errors.push("control file has no checkpoint".to_string());
        return Ok(result);
    }

    let mut reader = cluster.reader(None)?;
    match reader.read_record(Some(control.checkpoint))? {
        None => result.errors.push(format!(
            "checkpoint record at {} is missing or invalid",
            control.checkpoint
        )),
        Some(record) => {
            let op = record.op();
            let is_checkpoint = record.rmid() == RM_XLOG_ID
                && (op == XLOG_CHECKPOINT_SHUTDOWN || op == XLOG_CHECKPOINT_ONLINE);
            if !is_checkpoint {
                result.errors.push(format!(
                    "record at {} is not a checkpoint",
                    control.checkpoint
                ));
            } else if let Some(body) = CheckpointRecord::decode(&record.data) {
                if body.checkpoint != control.checkpoint_copy {
                    result.errors.push(format!(
                        "checkpoint record at {} does not match the control file copy",
                        control.checkpoint
                    ));
                }
            } else {
                result.errors.push(format!(
                    "checkpoint record at {} has an invalid body",
                    control.checkpoint
                ));
            }
        }
    }

    let redo = control.checkpoint_copy.redo;
    if !redo.is_valid() || redo > control.checkpoint {
        result
            .errors
            .push(format!("invalid redo pointer {redo} in checkpoint"));
        return Ok(result);
    }

    let mut next = reader.read_record(Some(redo))?;
    while let Some(record) = next {
        result.records_checked += 1;
        result.backup_blocks += record.backup_blocks.len();
        next = reader.read_record(None)?;
    }
    result.end = reader.end_of_last();
    result.end_reason = reader.end_reason().map(str::to_string);

    if result.records_checked == 0 {
        result
            .errors
            .push(format!("no readable records from redo pointer {redo}"));
    } else if result.end <= control.checkpoint {
        result.errors.push(format!(
            "log ends at {} before the checkpoint record at {}",
            result.end, control.checkpoint
        ));
    }
    if control.min_recovery_point.is_valid() && result.end < control.min_recovery_point {
        result.errors.push(format!(
            "log ends at {} before the minimum recovery point {}",
            result.end, control.min_recovery_point
        ));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xlog_core::{Collaborators, Config, RecordRequest, WalManager};

    fn small_config() -> Config {
        Config::new().wal_page_size(1024).segment_size(64 * 1024)
    }

    #[test]
    fn fresh_directory_verifies() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        WalManager::bootstrap(&path, &small_config()).unwrap();

        let result = verify(&Cluster::open(&path).unwrap()).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 1);
    }

    #[test]
    fn crashed_directory_verifies_through_flushed_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        let config = small_config();
        WalManager::bootstrap(&path, &config).unwrap();

        let wal = WalManager::open(&path, config, Collaborators::default()).unwrap();
        let mut end = Lsn::INVALID;
        for i in 0..3u32 {
            end = wal
                .insert(&RecordRequest::new(16, 0x10).xid(i + 1).data(b"row"))
                .unwrap();
        }
        wal.flush_through(end).unwrap();
        drop(wal);

        let result = verify(&Cluster::open(&path).unwrap()).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert!(result.records_checked >= 4);
        assert_eq!(result.end, end);
    }
}
