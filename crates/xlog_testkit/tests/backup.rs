//! Online base backups and recovery from them.

use xlog_core::parse_backup_label;
use xlog_testkit::prelude::*;

fn numbered(range: std::ops::RangeInclusive<u32>) -> Vec<Vec<u8>> {
    range.map(records::numbered_payload).collect()
}

fn archive_recovery(cluster: &TestCluster) -> Config {
    cluster
        .config()
        .recovery(RecoveryConfig::new().archive_dir(cluster.archive_dir()))
}

#[test]
fn test_recovers_copy_taken_during_backup() {
    let cluster = TestCluster::new();
    let (collab, _) = recording_collab();
    let wal = cluster.open_with(collab);
    records::write_numbered(&wal, 1, 3);

    let started = wal.start_backup("nightly", BackupMethod::Exclusive).unwrap();
    assert!(cluster.path().join("backup_label").exists());
    assert!(wal.forcing_page_writes());
    let base = cluster.scratch("base");
    cluster.copy_data_dir(&base);

    records::write_numbered(&wal, 4, 3);
    let stopped = wal.stop_backup(BackupMethod::Exclusive, None).unwrap();
    assert!(!cluster.path().join("backup_label").exists());
    assert!(stopped.history_file.exists());
    assert!(stopped.stop > started.label.start);
    records::write_numbered(&wal, 7, 1);
    wal.shutdown().unwrap();
    cluster.archive_all();

    cluster.restore_data_dir(&base);
    cluster.remove_local_segments();
    let (collab, rmgr) = recording_collab();
    let wal = cluster.try_open(archive_recovery(&cluster), collab).unwrap();
    let report = wal.startup_report();
    assert!(report.used_backup_label);
    assert_eq!(report.checkpoint, started.label.checkpoint);
    assert_eq!(report.checkpoint_redo, started.label.start);
    assert_eq!(rmgr.payloads(), numbered(4..=7));
    assert!(report.consistent_at.unwrap() >= stopped.stop);
    assert!(!cluster.path().join("backup_label").exists());
    assert!(cluster.path().join("backup_label.old").exists());
    let ctl = wal.control_snapshot();
    assert!(!ctl.backup_end_required);
    assert!(!ctl.backup_start_point.is_valid());
}

#[test]
fn test_records_during_backup_fall_inside_its_range() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let started = wal.start_backup("window", BackupMethod::Exclusive).unwrap();
    let inserted: Vec<_> = (0..5)
        .map(|i| {
            wal.insert_record(
                &RecordRequest::new(TEST_RMGR_ID, TEST_OP_WRITE)
                    .xid(i + 1)
                    .data(&records::numbered_payload(i)),
            )
            .unwrap()
        })
        .collect();
    let stopped = wal.stop_backup(BackupMethod::Exclusive, None).unwrap();

    for rec in &inserted {
        assert!(started.label.start <= rec.lsn);
        assert!(rec.end_lsn <= stopped.stop);
    }
}

#[test]
fn test_copy_without_backup_end_is_rejected() {
    let cluster = TestCluster::new();
    let wal = cluster.open_with(recording_collab().0);
    wal.start_backup("unfinished", BackupMethod::Exclusive).unwrap();
    let base = cluster.scratch("base");
    cluster.copy_data_dir(&base);
    records::write_numbered(&wal, 1, 3);
    cluster.crash(wal);
    cluster.archive_all();

    cluster.restore_data_dir(&base);
    cluster.remove_local_segments();
    let opened = cluster.try_open(archive_recovery(&cluster), recording_collab().0);
    assert!(matches!(opened, Err(WalError::InvalidState { .. })));
}

#[test]
fn test_one_exclusive_backup_at_a_time() {
    let cluster = TestCluster::with_config(small_config().full_page_writes(false));
    let wal = cluster.open();
    wal.start_backup("first", BackupMethod::Exclusive).unwrap();
    let second = wal.start_backup("second", BackupMethod::Exclusive);
    assert!(matches!(second, Err(WalError::Backup { .. })));

    wal.stop_backup(BackupMethod::Exclusive, None).unwrap();
    let again = wal.stop_backup(BackupMethod::Exclusive, None);
    assert!(matches!(again, Err(WalError::Backup { .. })));
    assert!(!wal.forcing_page_writes());
    wal.shutdown().unwrap();
}

#[test]
fn test_streamed_backup_returns_label() {
    let cluster = TestCluster::with_config(small_config().full_page_writes(false));
    let wal = cluster.open();
    let started = wal.start_backup("stream", BackupMethod::Streamed).unwrap();
    assert!(!cluster.path().join("backup_label").exists());
    assert_eq!(started.timeline, 1);

    let text = started.label.to_text();
    assert_eq!(parse_backup_label(&text).unwrap(), started.label);
    assert!(text.contains("LABEL: stream"));

    // An exclusive backup may run alongside a streamed one.
    wal.start_backup("exclusive", BackupMethod::Exclusive).unwrap();
    wal.stop_backup(BackupMethod::Exclusive, None).unwrap();
    assert!(wal.forcing_page_writes());

    let stopped = wal.stop_backup(BackupMethod::Streamed, Some(&text)).unwrap();
    let name = stopped.history_file.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with(&started.label.start_segment));
    assert!(name.ends_with(".backup"));
    let history = std::fs::read_to_string(&stopped.history_file).unwrap();
    assert!(history.contains("STOP WAL LOCATION"));
    assert!(!wal.forcing_page_writes());
    wal.shutdown().unwrap();
}

#[test]
fn test_streamed_stop_needs_label() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    wal.start_backup("stream", BackupMethod::Streamed).unwrap();
    let stopped = wal.stop_backup(BackupMethod::Streamed, None);
    assert!(matches!(stopped, Err(WalError::Backup { .. })));
    let garbled = wal.stop_backup(BackupMethod::Streamed, Some("not a label"));
    assert!(garbled.is_err());
    wal.shutdown().unwrap();
}

#[test]
fn test_backup_forces_page_images_without_full_page_writes() {
    let cluster = TestCluster::with_config(small_config().full_page_writes(false));
    let wal = cluster.open();
    assert!(!wal.forcing_page_writes());
    let started = wal.start_backup("fpw", BackupMethod::Streamed).unwrap();
    assert!(wal.forcing_page_writes());
    wal.stop_backup(BackupMethod::Streamed, Some(&started.label.to_text()))
        .unwrap();
    assert!(!wal.forcing_page_writes());
    wal.shutdown().unwrap();
}

#[test]
fn test_stray_label_survives_stop_without_session() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let started = wal.start_backup("stream", BackupMethod::Streamed).unwrap();
    let text = started.label.to_text();
    wal.stop_backup(BackupMethod::Streamed, Some(&text)).unwrap();

    // A label left behind with no backup session counted.
    let label_path = cluster.path().join("backup_label");
    std::fs::write(&label_path, &text).unwrap();
    let stopped = wal.stop_backup(BackupMethod::Exclusive, None);
    assert!(matches!(stopped, Err(WalError::Backup { .. })));
    assert_eq!(std::fs::read_to_string(&label_path).unwrap(), text);

    std::fs::remove_file(&label_path).unwrap();
    wal.shutdown().unwrap();
}
