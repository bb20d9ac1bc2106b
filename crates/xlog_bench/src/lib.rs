//! Benchmark utilities.

use rand::Rng;
use std::sync::Arc;
use tempfile::TempDir;
use xlog_core::{
    Collaborators, Config, DecodedRecord, RmgrRegistry, ResourceManager, SyncMethod, WalManager,
    WalResult,
};

/// Resource manager id used by benchmark records.
pub const BENCH_RMGR_ID: u8 = 16;

/// Generate random record payload of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// 8 KiB pages in 1 MiB segments, so that segment setup does not dominate.
pub fn bench_config(sync: SyncMethod) -> Config {
    Config::new()
        .segment_size(1024 * 1024)
        .wal_buffers(64)
        .checkpoint_segments(64)
        .sync_method(sync)
}

/// A replay target that only counts records.
#[derive(Debug, Default)]
pub struct CountingRmgr {
    count: std::sync::atomic::AtomicU64,
}

impl CountingRmgr {
    /// Records replayed so far.
    pub fn count(&self) -> u64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl ResourceManager for CountingRmgr {
    fn name(&self) -> &str {
        "Bench"
    }

    fn redo(&self, _record: &DecodedRecord) -> WalResult<()> {
        self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

/// Collaborators that accept benchmark records during replay.
pub fn bench_collab() -> (Collaborators, Arc<CountingRmgr>) {
    let rmgr = Arc::new(CountingRmgr::default());
    let mut rmgrs = RmgrRegistry::new();
    rmgrs
        .register(BENCH_RMGR_ID, Arc::clone(&rmgr) as Arc<dyn ResourceManager>)
        .expect("Failed to register resource manager");
    (Collaborators::new().rmgrs(rmgrs), rmgr)
}

/// Bootstraps a fresh data directory and opens it.
pub fn fresh_log(config: &Config) -> (TempDir, WalManager) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("data");
    WalManager::bootstrap(&path, config).expect("Failed to bootstrap");
    let wal = WalManager::open(&path, config.clone(), bench_collab().0).expect("Failed to open");
    (dir, wal)
}
