//! Controldata command implementation.

use super::Cluster;
use serde::Serialize;
use std::path::Path;
use xlog_core::control::ControlFileData;

/// Control file contents for output.
#[derive(Debug, Serialize)]
pub struct ControlInfo {
    /// Path of the control file.
    pub path: String,
    /// Decoded contents.
    #[serde(flatten)]
    pub data: ControlFileData,
}

/// Runs the controldata command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = Cluster::open(path)?;
    let info = ControlInfo {
        path: cluster.dir.control_path().display().to_string(),
        data: cluster.control,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        _ => {
            print_text_output(&info);
        }
    }

    Ok(())
}

fn print_text_output(info: &ControlInfo) {
    let c = &info.data;
    let ckpt = &c.checkpoint_copy;
    println!("Control file: {}", info.path);
    println!("========================================");
    println!("System identifier:               {}", c.system_identifier);
    println!("Control version:                 {}", c.control_version);
    println!("Catalog version:                 {}", c.catalog_version);
    println!("Cluster state:                   {}", c.state);
    println!("Last modified:                   {}", c.time);
    println!(
        "Newest segment opened:           log {} seg {}",
        c.log_id, c.log_seg
    );
    println!("Latest checkpoint location:      {}", c.checkpoint);
    println!("Prior checkpoint location:       {}", c.prev_checkpoint);
    println!("Latest checkpoint's REDO:        {}", ckpt.redo);
    println!("Latest checkpoint's TimeLineID:  {}", ckpt.this_timeline);
    println!(
        "Latest checkpoint's NextXID:     {}/{}",
        ckpt.next_xid_epoch, ckpt.next_xid
    );
    println!("Latest checkpoint's NextOID:     {}", ckpt.next_oid);
    println!("Latest checkpoint's NextMultiXactId: {}", ckpt.next_multi);
    println!("Latest checkpoint's NextMultiOffset: {}", ckpt.next_multi_offset);
    println!("Time of latest checkpoint:       {}", ckpt.time);
    println!("Minimum recovery ending location: {}", c.min_recovery_point);
    println!("Backup start location:           {}", c.backup_start_point);
    println!("End-of-backup record required:   {}", c.backup_end_required);
    println!();
    let compat = &c.compat;
    println!("Maximum data alignment:          {}", compat.max_align);
    println!("Database block size:             {}", compat.data_page_size);
    println!("Blocks per segment of large relation: {}", compat.relseg_size);
    println!("WAL block size:                  {}", compat.wal_page_size);
    println!("Bytes per WAL segment:           {}", compat.segment_size);
    println!("Maximum length of identifiers:   {}", compat.name_data_len);
    println!("Maximum columns in an index:     {}", compat.index_max_keys);
    println!(
        "Date/time type storage:          {}",
        if compat.integer_datetimes {
            "64-bit integers"
        } else {
            "floating-point numbers"
        }
    );
    println!("LC_COLLATE:                      {}", compat.lc_collate);
    println!("LC_CTYPE:                        {}", compat.lc_ctype);
}
