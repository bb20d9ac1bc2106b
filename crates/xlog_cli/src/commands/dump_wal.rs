//! Dump-wal command implementation.

use super::Cluster;
use serde::Serialize;
use std::path::Path;
use xlog_core::{DecodedRecord, Lsn, RmgrRegistry, TimeLineId};

/// Log record representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Start of the record.
    pub lsn: Lsn,
    /// Start of the previous record.
    pub prev: Lsn,
    /// Resource manager name.
    pub rmgr: String,
    /// Owning transaction (0 if none).
    pub xid: u32,
    /// Total length including full-page images.
    pub total_len: u32,
    /// Payload length.
    pub data_len: u32,
    /// Number of full-page images.
    #[serde(skip_serializing_if = "is_zero")]
    pub backup_blocks: usize,
    /// Human-readable description.
    pub description: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Records read plus where the scan stopped.
#[derive(Debug, Serialize)]
pub struct DumpOutput {
    /// Records in log order.
    pub records: Vec<WalRecordInfo>,
    /// End of the last record read.
    pub end: Lsn,
    /// Why the scan stopped, if it hit invalid or missing log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    start: Option<Lsn>,
    timeline: Option<TimeLineId>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = Cluster::open(path)?;
    let start = start.unwrap_or(cluster.control.checkpoint_copy.redo);
    if !start.is_valid() {
        return Err("No start position given and the control file has no checkpoint".into());
    }

    let mut reader = cluster.reader(timeline)?;
    let rmgrs = RmgrRegistry::new();
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();

    let mut next = reader.read_record(Some(start))?;
    while let Some(record) = next {
        if records.len() >= max_records {
            break;
        }
        records.push(describe(&rmgrs, &record));
        next = reader.read_record(None)?;
    }

    let output = DumpOutput {
        records,
        end: reader.end_of_last(),
        end_reason: reader.end_reason().map(str::to_string),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            print_text_output(&output);
        }
    }

    Ok(())
}

fn describe(rmgrs: &RmgrRegistry, record: &DecodedRecord) -> WalRecordInfo {
    WalRecordInfo {
        lsn: record.lsn,
        prev: record.header.prev,
        rmgr: rmgrs.name_of(record.rmid()),
        xid: record.xid(),
        total_len: record.header.tot_len,
        data_len: record.header.len,
        backup_blocks: record.backup_blocks.len(),
        description: rmgrs.describe(record),
    }
}

fn print_text_output(output: &DumpOutput) {
    println!("WAL Records ({} total)", output.records.len());
    println!("================");
    println!();

    for record in &output.records {
        print!(
            "rmgr: {:<12} len (rec/tot): {:>6}/{:>6}, tx: {:>8}, lsn: {:>12}, prev {:>12}, ",
            record.rmgr,
            record.data_len,
            record.total_len,
            record.xid,
            record.lsn.to_string(),
            record.prev.to_string()
        );
        if record.backup_blocks > 0 {
            print!("bkp: {}, ", record.backup_blocks);
        }
        println!("desc: {}", record.description);
    }

    println!();
    println!("End of log: {}", output.end);
    if let Some(reason) = &output.end_reason {
        println!("Stopped at: {reason}");
    }
}
