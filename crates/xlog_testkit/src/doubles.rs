//! Recording doubles for the collaborators the log calls out to.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use xlog_core::checkpoint::{CheckpointHooks, NextIds};
use xlog_core::records::PreparedXact;
use xlog_core::recovery::ReplicationStream;
use xlog_core::rmgr::{ChangeTracker, PageStore, ResourceManager, TrackedRecord};
use xlog_core::{DecodedRecord, Lsn, PageTag, RmgrRegistry, TimeLineId, WalResult};

/// A replayed record as seen by [`RecordingRmgr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replayed {
    /// Start of the record.
    pub lsn: Lsn,
    /// Op code.
    pub op: u8,
    /// Owning transaction.
    pub xid: u32,
    /// Payload.
    pub data: Vec<u8>,
}

/// A resource manager that remembers everything it replays.
#[derive(Debug, Default)]
pub struct RecordingRmgr {
    redone: Mutex<Vec<Replayed>>,
    passes: Mutex<Vec<(u8, Lsn)>>,
    startups: AtomicUsize,
    cleanups: AtomicUsize,
    unsafe_restartpoint: AtomicBool,
    extra_passes: AtomicBool,
}

impl RecordingRmgr {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A registry with `rmgr` registered under `id`.
    pub fn registry(rmgr: &Arc<Self>, id: u8) -> RmgrRegistry {
        let mut registry = RmgrRegistry::new();
        registry
            .register(id, Arc::clone(rmgr) as Arc<dyn ResourceManager>)
            .expect("Failed to register resource manager");
        registry
    }

    /// Records replayed in the main pass, in order.
    pub fn redone(&self) -> Vec<Replayed> {
        self.redone.lock().clone()
    }

    /// Payloads replayed in the main pass, in order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.redone.lock().iter().map(|r| r.data.clone()).collect()
    }

    /// Records handed to later passes, as (pass, lsn).
    pub fn passes(&self) -> Vec<(u8, Lsn)> {
        self.passes.lock().clone()
    }

    /// Number of startup calls.
    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    /// Number of cleanup calls.
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Makes the manager veto restart points.
    pub fn set_unsafe_restartpoint(&self, value: bool) {
        self.unsafe_restartpoint.store(value, Ordering::SeqCst);
    }

    /// Asks for replay passes 2 and 3.
    pub fn set_extra_passes(&self, value: bool) {
        self.extra_passes.store(value, Ordering::SeqCst);
    }
}

impl ResourceManager for RecordingRmgr {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn redo(&self, record: &DecodedRecord) -> WalResult<()> {
        self.redone.lock().push(Replayed {
            lsn: record.lsn,
            op: record.op(),
            xid: record.xid(),
            data: record.data.clone(),
        });
        Ok(())
    }

    fn startup(&self) -> WalResult<()> {
        self.startups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) -> WalResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn safe_restartpoint(&self) -> bool {
        !self.unsafe_restartpoint.load(Ordering::SeqCst)
    }

    fn wants_pass(&self, _pass: u8) -> bool {
        self.extra_passes.load(Ordering::SeqCst)
    }

    fn replay_pass(&self, pass: u8, record: &DecodedRecord) -> WalResult<()> {
        self.passes.lock().push((pass, record.lsn));
        Ok(())
    }
}

/// A page store keeping the latest image of every page.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<PageTag, (Lsn, Vec<u8>)>>,
    restores: AtomicUsize,
}

impl MemoryPageStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The latest image of `tag` and the record that restored it.
    pub fn page(&self, tag: &PageTag) -> Option<(Lsn, Vec<u8>)> {
        self.pages.lock().get(tag).cloned()
    }

    /// Number of images restored.
    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

impl PageStore for MemoryPageStore {
    fn restore_page(&self, tag: PageTag, lsn: Lsn, image: &[u8]) -> WalResult<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.pages.lock().insert(tag, (lsn, image.to_vec()));
        Ok(())
    }
}

/// Checkpoint hooks that count calls and serve fixed state.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    flushes: AtomicUsize,
    shutdown_flushes: AtomicUsize,
    ids: Mutex<Option<NextIds>>,
    prepared: Mutex<Vec<PreparedXact>>,
}

impl RecordingHooks {
    /// Creates hooks with nothing to report.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `flush_state` calls.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Number of `flush_state` calls for shutdown checkpoints.
    pub fn shutdown_flushes(&self) -> usize {
        self.shutdown_flushes.load(Ordering::SeqCst)
    }

    /// Serves `ids` to the next checkpoints.
    pub fn set_next_ids(&self, ids: NextIds) {
        *self.ids.lock() = Some(ids);
    }

    /// Reports `prepared` as in flight.
    pub fn set_prepared(&self, prepared: Vec<PreparedXact>) {
        *self.prepared.lock() = prepared;
    }
}

impl CheckpointHooks for RecordingHooks {
    fn next_ids(&self) -> Option<NextIds> {
        *self.ids.lock()
    }

    fn flush_state(&self, is_shutdown: bool) -> WalResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if is_shutdown {
            self.shutdown_flushes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn prepared_transactions(&self) -> Vec<PreparedXact> {
        self.prepared.lock().clone()
    }
}

/// A change tracker remembering record positions.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    records: Mutex<Vec<(Lsn, Lsn, u8)>>,
}

impl MemoryTracker {
    /// Creates an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tracked records as (start, end, rmgr id).
    pub fn records(&self) -> Vec<(Lsn, Lsn, u8)> {
        self.records.lock().clone()
    }
}

impl ChangeTracker for MemoryTracker {
    fn append(&self, record: &TrackedRecord<'_>) {
        self.records
            .lock()
            .push((record.lsn, record.end_lsn, record.rmid));
    }
}

/// A replication stream whose progress is set by the test.
#[derive(Debug, Default)]
pub struct ScriptedStream {
    received: AtomicU64,
    streaming: AtomicBool,
    connectable: AtomicBool,
    requests: Mutex<Vec<(Lsn, TimeLineId)>>,
}

impl ScriptedStream {
    /// Creates a disconnected stream. Streaming requests succeed and
    /// connect it unless [`set_connectable`](Self::set_connectable) is
    /// turned off.
    pub fn new() -> Arc<Self> {
        let stream = Self::default();
        stream.connectable.store(true, Ordering::SeqCst);
        Arc::new(stream)
    }

    /// Reports log up to `lsn` as received.
    pub fn set_received(&self, lsn: Lsn) {
        self.received.store(lsn.as_u64(), Ordering::SeqCst);
    }

    /// Controls whether streaming requests connect.
    pub fn set_connectable(&self, value: bool) {
        self.connectable.store(value, Ordering::SeqCst);
    }

    /// Drops the connection.
    pub fn disconnect(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    /// Streaming requests made so far.
    pub fn requests(&self) -> Vec<(Lsn, TimeLineId)> {
        self.requests.lock().clone()
    }
}

impl ReplicationStream for ScriptedStream {
    fn received_upto(&self) -> Lsn {
        Lsn::new(self.received.load(Ordering::SeqCst))
    }

    fn request_streaming(&self, start: Lsn, tli: TimeLineId) -> WalResult<()> {
        self.requests.lock().push((start, tli));
        if self.connectable.load(Ordering::SeqCst) {
            self.streaming.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_stream_connects_on_request() {
        let stream = ScriptedStream::new();
        assert!(!stream.is_streaming());
        stream.request_streaming(Lsn::new(0x4000), 1).unwrap();
        assert!(stream.is_streaming());
        assert_eq!(stream.requests(), vec![(Lsn::new(0x4000), 1)]);
        stream.disconnect();
        assert!(!stream.is_streaming());
    }

    #[test]
    fn page_store_keeps_latest_image() {
        let store = MemoryPageStore::new();
        let tag = PageTag::default();
        store.restore_page(tag, Lsn::new(10), &[1; 4]).unwrap();
        store.restore_page(tag, Lsn::new(20), &[2; 4]).unwrap();
        assert_eq!(store.page(&tag), Some((Lsn::new(20), vec![2; 4])));
        assert_eq!(store.restores(), 2);
    }
}
