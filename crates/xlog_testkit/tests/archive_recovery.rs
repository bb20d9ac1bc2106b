//! Archive recovery from a base backup, with and without a target.

use xlog_core::records::XACT_COMMIT;
use xlog_testkit::prelude::*;

/// Three transactions, each a test record followed by its commit at
/// 1000, 2000 and 3000.
fn three_transactions(wal: &WalManager) {
    for (xid, time) in [(1u32, 1000i64), (2, 2000), (3, 3000)] {
        records::write(wal, xid, format!("tx {xid}").as_bytes());
        wal.log_xact(xid, true, time).unwrap();
    }
    wal.flush_through(wal.positions().insert).unwrap();
}

fn recover(cluster: &TestCluster, recovery: RecoveryConfig) -> (WalManager, std::sync::Arc<RecordingRmgr>) {
    let (collab, rmgr) = recording_collab();
    let config = cluster
        .config()
        .recovery(recovery.archive_dir(cluster.archive_dir()));
    let wal = cluster
        .try_open(config, collab)
        .expect("archive recovery failed");
    (wal, rmgr)
}

fn written(rmgr: &RecordingRmgr) -> Vec<String> {
    rmgr.redone()
        .into_iter()
        .filter(|r| r.op == TEST_OP_WRITE)
        .map(|r| String::from_utf8(r.data).unwrap())
        .collect()
}

fn committed(rmgr: &RecordingRmgr) -> Vec<u32> {
    rmgr.redone()
        .into_iter()
        .filter(|r| r.op == XACT_COMMIT)
        .map(|r| r.xid)
        .collect()
}

#[test]
fn test_replays_whole_archive_without_target() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    assert!(cluster.segment_files().is_empty());

    let (wal, rmgr) = recover(&cluster, RecoveryConfig::new());
    let report = wal.startup_report();
    assert!(report.archive_recovery);
    assert!(report.performed_recovery);
    assert!(report.stop.is_none());
    assert_eq!(written(&rmgr), ["tx 1", "tx 2", "tx 3"]);
    assert_eq!(committed(&rmgr), [1, 2, 3]);
    assert_eq!(report.new_timeline, Some(2));
    assert_eq!(wal.timeline(), 2);
    assert!(cluster.xlog_dir().join("00000002.history").exists());

    let json = TestCluster::report_json(&wal);
    assert_eq!(json["archive_recovery"], true);
    assert_eq!(json["timeline"], 2);
}

#[test]
fn test_stops_after_target_xid() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);

    let (wal, rmgr) = recover(&cluster, RecoveryConfig::new().target(RecoveryTarget::Xid(2)));
    let stop = wal.startup_report().stop.unwrap();
    assert_eq!(stop.xid, 2);
    assert!(stop.after);
    assert!(stop.is_commit);
    assert_eq!(written(&rmgr), ["tx 1", "tx 2"]);
    assert_eq!(committed(&rmgr), [1, 2]);
}

#[test]
fn test_stops_before_target_xid_when_exclusive() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);

    let recovery = RecoveryConfig::new()
        .target(RecoveryTarget::Xid(2))
        .target_inclusive(false);
    let (wal, rmgr) = recover(&cluster, recovery);
    let stop = wal.startup_report().stop.unwrap();
    assert!(!stop.after);
    assert_eq!(written(&rmgr), ["tx 1", "tx 2"]);
    assert_eq!(committed(&rmgr), [1]);
    assert!(wal.startup_report().end_of_log <= stop.lsn);
}

#[test]
fn test_time_target() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);

    let (wal, rmgr) = recover(&cluster, RecoveryConfig::new().target(RecoveryTarget::Time(2500)));
    let stop = wal.startup_report().stop.unwrap();
    assert_eq!(stop.xid, 3);
    assert_eq!(stop.time, 3000);
    assert!(!stop.after);
    assert_eq!(committed(&rmgr), [1, 2]);
    assert_eq!(written(&rmgr), ["tx 1", "tx 2", "tx 3"]);
}

#[test]
fn test_time_target_on_exact_commit_time() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);

    let (_, rmgr) = recover(&cluster, RecoveryConfig::new().target(RecoveryTarget::Time(2000)));
    assert_eq!(committed(&rmgr), [1, 2]);

    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    let recovery = RecoveryConfig::new()
        .target(RecoveryTarget::Time(2000))
        .target_inclusive(false);
    let (_, rmgr) = recover(&cluster, recovery);
    assert_eq!(committed(&rmgr), [1]);
}

#[test]
fn test_recovery_conf_is_consumed() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    cluster.write_recovery_conf(&format!(
        "# restore to the second transaction\narchive_dir = '{}'\nrecovery_target_xid = '2'\n",
        cluster.archive_dir().display()
    ));

    let (collab, rmgr) = recording_collab();
    let wal = cluster.open_with(collab);
    assert!(wal.startup_report().archive_recovery);
    assert_eq!(committed(&rmgr), [1, 2]);
    assert!(!cluster.path().join("recovery.conf").exists());
    assert!(cluster.path().join("recovery.done").exists());
    wal.shutdown().unwrap();

    // The next start is ordinary.
    let wal = cluster.open();
    assert!(!wal.startup_report().archive_recovery);
    assert_eq!(wal.timeline(), 2);
}

#[test]
fn test_new_timeline_keeps_running_after_crash() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    let (wal, _) = recover(&cluster, RecoveryConfig::new().target(RecoveryTarget::Xid(1)));
    records::write(&wal, 10, b"after branch");
    wal.flush_through(wal.positions().insert).unwrap();
    cluster.crash(wal);

    let (collab, rmgr) = recording_collab();
    let wal = cluster.open_with(collab);
    assert_eq!(wal.timeline(), 2);
    assert!(!wal.startup_report().archive_recovery);
    assert_eq!(written(&rmgr), ["after branch"]);
    assert!(cluster.segment_files().iter().all(|n| n.starts_with("00000002")));
}

#[test]
fn test_latest_timeline_follows_branch() {
    let cluster = TestCluster::new();
    let base = cluster.scratch("base0");
    cluster.copy_data_dir(&base);

    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    let (wal, _) = recover(&cluster, RecoveryConfig::new().target(RecoveryTarget::Xid(2)));
    assert_eq!(wal.timeline(), 2);
    records::write(&wal, 10, b"tx 10");
    wal.log_xact(10, true, 4000).unwrap();
    wal.shutdown().unwrap();
    cluster.archive_all();

    cluster.restore_data_dir(&base);
    cluster.remove_local_segments();
    let (wal, rmgr) = recover(
        &cluster,
        RecoveryConfig::new().target_timeline(TargetTimeline::Latest),
    );
    assert_eq!(written(&rmgr), ["tx 1", "tx 2", "tx 10"]);
    assert_eq!(committed(&rmgr), [1, 2, 10]);
    assert_eq!(wal.timeline(), 3);
    let history = std::fs::read_to_string(cluster.xlog_dir().join("00000003.history")).unwrap();
    assert_eq!(history.lines().filter(|l| !l.trim().is_empty()).count(), 2);
}

#[test]
fn test_unknown_target_timeline_is_rejected() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, three_transactions);
    let config = cluster.config().recovery(
        RecoveryConfig::new()
            .archive_dir(cluster.archive_dir())
            .target_timeline(TargetTimeline::Id(7)),
    );
    let (collab, _) = recording_collab();
    let opened = cluster.try_open(config, collab);
    assert!(matches!(opened, Err(WalError::InvalidTimeline { .. })));
}
