//! Checkpoint scheduling, skipping and log file retention.

use std::fs;
use xlog_core::wal::segment_file_name;
use xlog_core::NextIds;
use xlog_testkit::prelude::*;

/// Writes 512-byte records until the insert position reaches `segno`.
fn advance_to_segment(wal: &WalManager, segno: u64) {
    let seg = u64::from(SMALL_SEGMENT_SIZE);
    let payload = vec![0xAB; 512];
    let mut xid = 1;
    while wal.positions().insert.segno(seg) < segno {
        records::write(wal, xid, &payload);
        xid += 1;
    }
    wal.flush_through(wal.positions().insert).unwrap();
}

fn segment_name(cluster: &TestCluster, segno: u64) -> String {
    segment_file_name(1, segno, &cluster.config().geometry())
}

#[test]
fn test_idle_checkpoint_is_skipped() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let before = wal.control_snapshot().checkpoint;
    let control_path = cluster.path().join("global").join("pg_control");
    let control_bytes = std::fs::read(&control_path).unwrap();
    let positions = wal.positions();
    let segments = cluster.segment_files();

    let outcome = wal.checkpoint(false, false).unwrap();
    assert!(outcome.skipped);
    assert_eq!(outcome.lsn, before);
    assert_eq!(std::fs::read(&control_path).unwrap(), control_bytes);
    assert_eq!(wal.positions(), positions);
    assert_eq!(cluster.segment_files(), segments);

    records::write_numbered(&wal, 1, 1);
    let outcome = wal.checkpoint(false, false).unwrap();
    assert!(!outcome.skipped);
    assert!(outcome.lsn > before);
    assert_eq!(wal.control_snapshot().checkpoint, outcome.lsn);
    assert_eq!(wal.control_snapshot().prev_checkpoint, before);
    assert_eq!(wal.redo_pointer(), outcome.redo);
    wal.shutdown().unwrap();
}

#[test]
fn test_forced_checkpoint_runs_when_idle() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let before = wal.control_snapshot().checkpoint;
    let outcome = wal.checkpoint(false, true).unwrap();
    assert!(!outcome.skipped);
    assert!(outcome.lsn > before);
    assert!(wal.positions().flush > outcome.lsn);
    wal.shutdown().unwrap();
}

#[test]
fn test_hooks_supply_next_ids() {
    let cluster = TestCluster::new();
    let hooks = RecordingHooks::new();
    let ids = NextIds {
        next_xid: 9_000,
        next_oid: 777_000,
        ..NextIds::default()
    };
    hooks.set_next_ids(ids);
    let wal = cluster.open_with(Collaborators::new().hooks(hooks.clone()));
    records::write_numbered(&wal, 1, 1);
    wal.checkpoint(false, false).unwrap();
    assert_eq!(hooks.flushes(), 1);
    wal.shutdown().unwrap();
    assert_eq!(hooks.flushes(), 2);
    assert_eq!(hooks.shutdown_flushes(), 1);

    let wal = cluster.open();
    assert_eq!(wal.next_ids(), ids);
    assert_eq!(wal.control_snapshot().checkpoint_copy.next_oid, 777_000);
}

#[test]
fn test_log_volume_requests_checkpoint() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    assert!(!wal.checkpoint_requested());
    assert!(wal.maybe_checkpoint().unwrap().is_none());

    advance_to_segment(&wal, 5);
    assert!(wal.checkpoint_requested());

    let outcome = wal.maybe_checkpoint().unwrap().unwrap();
    assert!(!outcome.skipped);
    assert!(!wal.checkpoint_requested());
    assert!(wal.maybe_checkpoint().unwrap().is_none());
    wal.shutdown().unwrap();
}

#[test]
fn test_old_segments_are_retired() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let first = segment_name(&cluster, 1);
    assert!(cluster.segment_files().contains(&first));

    advance_to_segment(&wal, 2);
    let a = wal.checkpoint(false, true).unwrap();
    assert_eq!(a.recycled + a.removed, 0);
    assert!(cluster.segment_files().contains(&first));

    let b = wal.checkpoint(false, true).unwrap();
    assert!(b.recycled + b.removed >= 1);
    assert!(!cluster.segment_files().contains(&first));
    wal.shutdown().unwrap();

    // Recycled files carry future names, so the log still opens cleanly.
    let (collab, rmgr) = recording_collab();
    let wal = cluster.open_with(collab);
    assert!(!wal.startup_report().performed_recovery);
    assert!(rmgr.payloads().is_empty());
}

#[test]
fn test_keep_segments_holds_back_retention() {
    let cluster = TestCluster::with_config(small_config().keep_segments(8));
    let wal = cluster.open();
    let first = segment_name(&cluster, 1);
    advance_to_segment(&wal, 3);
    wal.checkpoint(false, true).unwrap();
    wal.checkpoint(false, true).unwrap();
    assert!(cluster.segment_files().contains(&first));
    wal.shutdown().unwrap();
}

#[test]
fn test_archive_mode_keeps_unarchived_segments() {
    let cluster = TestCluster::with_config(small_config().archive_mode(true));
    let wal = cluster.open();
    let first = segment_name(&cluster, 1);
    let status = cluster.xlog_dir().join("archive_status");

    advance_to_segment(&wal, 3);
    assert!(status.join(format!("{first}.ready")).exists());
    wal.checkpoint(false, true).unwrap();
    wal.checkpoint(false, true).unwrap();
    assert!(cluster.segment_files().contains(&first));

    fs::rename(
        status.join(format!("{first}.ready")),
        status.join(format!("{first}.done")),
    )
    .unwrap();
    records::write_numbered(&wal, 1, 1);
    wal.checkpoint(false, true).unwrap();
    assert!(!cluster.segment_files().contains(&first));
    assert!(!status.join(format!("{first}.done")).exists());
    wal.shutdown().unwrap();
}

#[test]
fn test_switch_segment_starts_new_file() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let seg = u64::from(SMALL_SEGMENT_SIZE);
    records::write_numbered(&wal, 1, 2);
    let end = wal.switch_segment().unwrap();
    assert_eq!(end.segment_offset(seg), 0);
    assert_eq!(end.segno(seg), 2);

    let after = records::write_numbered(&wal, 3, 1);
    assert_eq!(after.segno(seg), 2);
    cluster.crash(wal);

    let (collab, rmgr) = recording_collab();
    let _wal = cluster.open_with(collab);
    assert_eq!(
        rmgr.payloads(),
        (1..=3).map(records::numbered_payload).collect::<Vec<_>>()
    );
}
