//! Standby mode: replay keeps waiting for more log until promoted.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xlog_core::{RecoverySignals, WalResult};
use xlog_testkit::prelude::*;

fn prepared_cluster() -> TestCluster {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    cluster.restore_with_archive(collab, |wal| {
        records::write_numbered(wal, 1, 4);
    });
    cluster
}

fn standby_config(cluster: &TestCluster, recovery: RecoveryConfig) -> Config {
    let mut config = cluster.config().recovery(
        recovery
            .standby_mode(true)
            .archive_dir(cluster.archive_dir()),
    );
    config.standby_wait_timeout = Duration::from_millis(10);
    config
}

fn spawn_standby(
    cluster: &TestCluster,
    config: Config,
    collab: Collaborators,
) -> thread::JoinHandle<WalResult<WalManager>> {
    let path = cluster.path();
    thread::spawn(move || WalManager::open(&path, config, collab))
}

#[test]
fn test_promote_signal_ends_standby() {
    let cluster = prepared_cluster();
    let signals = Arc::new(RecoverySignals::new());
    let (collab, rmgr) = recording_collab();
    let handle = spawn_standby(
        &cluster,
        standby_config(&cluster, RecoveryConfig::new()),
        collab.signals(Arc::clone(&signals)),
    );

    thread::sleep(Duration::from_millis(200));
    assert!(!handle.is_finished());
    signals.promote();

    let wal = handle.join().unwrap().unwrap();
    assert!(wal.startup_report().archive_recovery);
    assert_eq!(wal.timeline(), 2);
    assert_eq!(
        rmgr.payloads(),
        (1..=4).map(records::numbered_payload).collect::<Vec<_>>()
    );
    records::write_numbered(&wal, 5, 1);
    wal.shutdown().unwrap();
}

#[test]
fn test_trigger_file_promotes() {
    let cluster = prepared_cluster();
    let trigger = cluster.scratch("promote.trigger");
    let (collab, rmgr) = recording_collab();
    let handle = spawn_standby(
        &cluster,
        standby_config(&cluster, RecoveryConfig::new().trigger_file(&trigger)),
        collab,
    );

    thread::sleep(Duration::from_millis(100));
    std::fs::write(&trigger, b"").unwrap();

    let wal = handle.join().unwrap().unwrap();
    assert!(!trigger.exists());
    assert_eq!(rmgr.payloads().len(), 4);
    assert_eq!(wal.timeline(), 2);
}

#[test]
fn test_standby_picks_up_newly_archived_log() {
    let primary = TestCluster::new();
    let standby = primary.scratch("standby");
    primary.copy_data_dir(&standby);
    for name in list_segments(&standby.join("pg_xlog")) {
        std::fs::remove_file(standby.join("pg_xlog").join(name)).unwrap();
    }

    let wal = primary.open();
    records::write_numbered(&wal, 1, 2);
    primary.archive_all();

    let signals = Arc::new(RecoverySignals::new());
    let (collab, rmgr) = recording_collab();
    let config = standby_config(&primary, RecoveryConfig::new());
    let collab = collab.signals(Arc::clone(&signals));
    let handle = thread::spawn(move || WalManager::open(&standby, config, collab));

    thread::sleep(Duration::from_millis(150));
    assert_eq!(rmgr.payloads().len(), 2);
    records::write_numbered(&wal, 3, 2);
    primary.archive_all();
    signals.latch().set();
    thread::sleep(Duration::from_millis(150));
    signals.promote();

    let promoted = handle.join().unwrap().unwrap();
    assert_eq!(
        rmgr.payloads(),
        (1..=4).map(records::numbered_payload).collect::<Vec<_>>()
    );
    assert_eq!(promoted.timeline(), 2);
    wal.shutdown().unwrap();
}

#[test]
fn test_shutdown_signal_aborts_standby() {
    let cluster = prepared_cluster();
    let signals = Arc::new(RecoverySignals::new());
    let (collab, _) = recording_collab();
    let handle = spawn_standby(
        &cluster,
        standby_config(&cluster, RecoveryConfig::new()),
        collab.signals(Arc::clone(&signals)),
    );

    thread::sleep(Duration::from_millis(100));
    signals.shutdown();
    let opened = handle.join().unwrap();
    assert!(matches!(opened, Err(WalError::Shutdown)));
}

#[test]
fn test_standby_requests_streaming_at_end_of_files() {
    let cluster = prepared_cluster();
    let signals = Arc::new(RecoverySignals::new());
    let stream = ScriptedStream::new();
    let (collab, rmgr) = recording_collab();
    let handle = spawn_standby(
        &cluster,
        standby_config(&cluster, RecoveryConfig::new()),
        collab
            .signals(Arc::clone(&signals))
            .replication(stream.clone()),
    );

    thread::sleep(Duration::from_millis(200));
    let requests = stream.requests();
    assert!(!requests.is_empty());
    assert_eq!(requests[0].1, 1);
    signals.promote();

    let wal = handle.join().unwrap().unwrap();
    assert_eq!(rmgr.payloads().len(), 4);
    assert_eq!(wal.timeline(), 2);
}
