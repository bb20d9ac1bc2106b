//! Test fixtures and data directory helpers.
//!
//! A [`TestCluster`] is a bootstrapped data directory inside a temporary
//! directory, plus a sibling archive directory. The log geometry is kept
//! small so that tests cross page and segment boundaries with only a few
//! records.

use crate::doubles::RecordingRmgr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use xlog_core::records::RM_XACT_ID;
use xlog_core::rmgr::ResourceManager;
use xlog_core::{Collaborators, Config, WalManager, WalResult};

/// Resource manager id used by test records.
pub const TEST_RMGR_ID: u8 = 16;

/// Op code of a plain test record.
pub const TEST_OP_WRITE: u8 = 0x10;

/// WAL page size of [`small_config`].
pub const SMALL_PAGE_SIZE: u32 = 1024;

/// Segment size of [`small_config`].
pub const SMALL_SEGMENT_SIZE: u32 = 16 * 1024;

/// Data page size of [`small_config`].
pub const SMALL_DATA_PAGE_SIZE: u32 = 512;

/// A configuration with 1 KiB log pages and 16 KiB segments.
pub fn small_config() -> Config {
    Config::new()
        .wal_page_size(SMALL_PAGE_SIZE)
        .segment_size(SMALL_SEGMENT_SIZE)
        .data_page_size(SMALL_DATA_PAGE_SIZE)
        .wal_buffers(8)
}

/// Collaborators whose resource manager records every test record and
/// every transaction commit or abort it replays.
pub fn recording_collab() -> (Collaborators, Arc<RecordingRmgr>) {
    let rmgr = RecordingRmgr::new();
    let mut rmgrs = RecordingRmgr::registry(&rmgr, TEST_RMGR_ID);
    rmgrs
        .register(RM_XACT_ID, Arc::clone(&rmgr) as Arc<dyn ResourceManager>)
        .expect("Failed to register resource manager");
    (Collaborators::new().rmgrs(rmgrs), rmgr)
}

/// A bootstrapped data directory with automatic cleanup.
pub struct TestCluster {
    root: TempDir,
    config: Config,
}

impl TestCluster {
    /// Bootstraps a cluster with [`small_config`].
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    /// Bootstraps a cluster with `config`.
    pub fn with_config(config: Config) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        WalManager::bootstrap(&root.path().join("data"), &config)
            .expect("Failed to bootstrap data directory");
        fs::create_dir_all(root.path().join("archive")).expect("Failed to create archive directory");
        Self { root, config }
    }

    /// Creates an empty, not yet bootstrapped cluster location.
    pub fn empty(config: Config) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(root.path().join("archive")).expect("Failed to create archive directory");
        Self { root, config }
    }

    /// The data directory.
    pub fn path(&self) -> PathBuf {
        self.root.path().join("data")
    }

    /// The segment directory inside the data directory.
    pub fn xlog_dir(&self) -> PathBuf {
        self.path().join("pg_xlog")
    }

    /// A directory next to the data directory standing in for an archive.
    pub fn archive_dir(&self) -> PathBuf {
        self.root.path().join("archive")
    }

    /// A scratch path next to the data directory.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// The configuration the cluster was bootstrapped with.
    pub fn config(&self) -> Config {
        self.config.clone()
    }

    /// Opens the cluster with default collaborators.
    pub fn open(&self) -> WalManager {
        self.open_with(Collaborators::new())
    }

    /// Opens the cluster with `collab`.
    pub fn open_with(&self, collab: Collaborators) -> WalManager {
        self.try_open(self.config(), collab)
            .expect("Failed to open data directory")
    }

    /// Opens the cluster, returning any startup error.
    pub fn try_open(&self, config: Config, collab: Collaborators) -> WalResult<WalManager> {
        WalManager::open(&self.path(), config, collab)
    }

    /// Simulates a crash: the manager goes away without a shutdown
    /// checkpoint. Whatever reached the OS stays on disk.
    pub fn crash(&self, wal: WalManager) {
        drop(wal);
    }

    /// Writes `recovery.conf` into the data directory.
    pub fn write_recovery_conf(&self, text: &str) {
        fs::write(self.path().join("recovery.conf"), text).expect("Failed to write recovery.conf");
    }

    /// Names of the segment files in `pg_xlog`, sorted.
    pub fn segment_files(&self) -> Vec<String> {
        list_segments(&self.xlog_dir())
    }

    /// Names of the segment files in the archive directory, sorted.
    pub fn archived_segments(&self) -> Vec<String> {
        list_segments(&self.archive_dir())
    }

    /// Copies every segment and history file from `pg_xlog` into the
    /// archive directory, the way an archiver would.
    pub fn archive_all(&self) {
        copy_log_files(&self.xlog_dir(), &self.archive_dir());
    }

    /// Copies the data directory to `dest` as a file-level base backup.
    /// The lock file is left behind.
    pub fn copy_data_dir(&self, dest: &Path) {
        copy_tree(&self.path(), dest);
        let _ = fs::remove_file(dest.join("LOCK"));
    }

    /// Replaces the data directory with the tree at `src`.
    pub fn restore_data_dir(&self, src: &Path) {
        let data = self.path();
        fs::remove_dir_all(&data).expect("Failed to remove data directory");
        copy_tree(src, &data);
    }

    /// Simulates restoring from a base backup plus archive: copies the shut
    /// down data directory, runs `work` on a fresh open, shuts down and
    /// archives every log file, then puts the copy back without its
    /// segment files so that replay has to read the archive.
    pub fn restore_with_archive<F>(&self, collab: Collaborators, work: F)
    where
        F: FnOnce(&WalManager),
    {
        let base = self.scratch("base");
        self.copy_data_dir(&base);
        let wal = self.open_with(collab);
        work(&wal);
        wal.shutdown().expect("Failed to shut down");
        self.archive_all();
        self.restore_data_dir(&base);
        self.remove_local_segments();
        fs::remove_dir_all(&base).expect("Failed to remove base copy");
    }

    /// Removes every segment file from `pg_xlog`, keeping history files.
    pub fn remove_local_segments(&self) {
        for name in self.segment_files() {
            fs::remove_file(self.xlog_dir().join(name)).expect("Failed to remove segment");
        }
    }

    /// The startup report of `wal` as JSON.
    pub fn report_json(wal: &WalManager) -> serde_json::Value {
        serde_json::to_value(wal.startup_report()).expect("Failed to serialize startup report")
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorted names of the 24-character segment files in `dir`.
pub fn list_segments(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.len() == 24 && n.bytes().all(|b| b.is_ascii_hexdigit()))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn copy_log_files(from: &Path, to: &Path) {
    fs::create_dir_all(to).expect("Failed to create directory");
    for entry in fs::read_dir(from).expect("Failed to read directory") {
        let entry = entry.expect("Failed to read directory entry");
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_segment = name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit());
        if is_segment || name.ends_with(".history") {
            fs::copy(entry.path(), to.join(&name)).expect("Failed to copy log file");
        }
    }
}

fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).expect("Failed to create directory");
    for entry in fs::read_dir(from).expect("Failed to read directory") {
        let entry = entry.expect("Failed to read directory entry");
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("Failed to copy file");
        }
    }
}

/// Record helpers.
pub mod records {
    use super::{TEST_OP_WRITE, TEST_RMGR_ID};
    use xlog_core::{Lsn, RecordRequest, WalManager};

    /// Inserts a test record carrying `payload`; returns its end.
    pub fn write(wal: &WalManager, xid: u32, payload: &[u8]) -> Lsn {
        wal.insert(&RecordRequest::new(TEST_RMGR_ID, TEST_OP_WRITE).xid(xid).data(payload))
            .expect("Failed to insert record")
    }

    /// Inserts `count` numbered records and flushes them; returns the end
    /// of the last one.
    pub fn write_numbered(wal: &WalManager, first: u32, count: u32) -> Lsn {
        let mut end = Lsn::INVALID;
        for i in first..first + count {
            end = write(wal, i, format!("record {i}").as_bytes());
        }
        wal.flush_through(end).expect("Failed to flush");
        end
    }

    /// Payload written by [`write_numbered`] for record `i`.
    pub fn numbered_payload(i: u32) -> Vec<u8> {
        format!("record {i}").into_bytes()
    }
}
