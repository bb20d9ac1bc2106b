//! Fault injection for crash recovery tests.
//!
//! [`FaultyOpener`] hands out segment backends that share one [`Faults`]
//! switchboard. A test flips a switch, drives the log until the fault
//! fires, abandons the manager and reopens the directory with a normal
//! opener to check what recovery makes of the damage.
//!
//! ```rust,ignore
//! let faults = Faults::new();
//! let wal = cluster.open_with(
//!     Collaborators::new().opener(Arc::new(FaultyOpener::new(Arc::clone(&faults)))),
//! );
//! faults.fail_syncs(true);
//! assert!(wal.flush_through(end).is_err());
//! ```

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xlog_storage::{FileOpener, SegmentOpener, StorageBackend, StorageError, StorageResult};

/// Switches shared by every backend a [`FaultyOpener`] creates.
#[derive(Debug)]
pub struct Faults {
    fail_syncs: AtomicBool,
    fail_creates: AtomicBool,
    sync_delay_ms: AtomicU64,
    tear_after: AtomicUsize,
    written: AtomicUsize,
    fired: AtomicUsize,
}

impl Faults {
    /// Creates a switchboard with every fault off.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_syncs: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
            sync_delay_ms: AtomicU64::new(0),
            tear_after: AtomicUsize::new(usize::MAX),
            written: AtomicUsize::new(0),
            fired: AtomicUsize::new(0),
        })
    }

    /// Makes every sync fail.
    pub fn fail_syncs(&self, value: bool) {
        self.fail_syncs.store(value, Ordering::SeqCst);
    }

    /// Makes segment creation fail.
    pub fn fail_creates(&self, value: bool) {
        self.fail_creates.store(value, Ordering::SeqCst);
    }

    /// Makes every sync take at least `delay`.
    pub fn delay_syncs(&self, delay: Duration) {
        self.sync_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Lets `bytes` more bytes through, then tears the write that crosses
    /// the limit and fails every write after it.
    pub fn tear_after(&self, bytes: usize) {
        self.written.store(0, Ordering::SeqCst);
        self.tear_after.store(bytes, Ordering::SeqCst);
    }

    /// Turns every fault off.
    pub fn reset(&self) {
        self.fail_syncs.store(false, Ordering::SeqCst);
        self.fail_creates.store(false, Ordering::SeqCst);
        self.sync_delay_ms.store(0, Ordering::SeqCst);
        self.tear_after.store(usize::MAX, Ordering::SeqCst);
        self.written.store(0, Ordering::SeqCst);
    }

    /// Number of operations failed so far.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    fn fire(&self, what: &str) -> StorageError {
        self.fired.fetch_add(1, Ordering::SeqCst);
        StorageError::Io(io::Error::new(io::ErrorKind::Other, format!("simulated {what}")))
    }

    fn sync_pause(&self) {
        let ms = self.sync_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }

    /// How many bytes of a `len`-byte write may go through.
    fn allow(&self, len: usize) -> usize {
        let limit = self.tear_after.load(Ordering::SeqCst);
        if limit == usize::MAX {
            return len;
        }
        let before = self.written.fetch_add(len, Ordering::SeqCst);
        limit.saturating_sub(before).min(len)
    }
}

/// A segment opener whose backends obey a [`Faults`] switchboard.
#[derive(Debug)]
pub struct FaultyOpener {
    faults: Arc<Faults>,
}

impl FaultyOpener {
    /// Creates an opener over real files.
    pub fn new(faults: Arc<Faults>) -> Self {
        Self { faults }
    }
}

impl SegmentOpener for FaultyOpener {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FaultyBackend {
            inner: FileOpener.open(path)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        if self.faults.fail_creates.load(Ordering::SeqCst) {
            return Err(self.faults.fire("failure creating segment"));
        }
        Ok(Box::new(FaultyBackend {
            inner: FileOpener.create(path)?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// A storage backend wrapper that can simulate crashes.
struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    faults: Arc<Faults>,
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let allowed = self.faults.allow(data.len());
        if allowed < data.len() {
            if allowed > 0 {
                let _ = self.inner.write_at(offset, &data[..allowed]);
            }
            return Err(self.faults.fire("crash during partial write"));
        }
        self.inner.write_at(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let allowed = self.faults.allow(data.len());
        if allowed < data.len() {
            if allowed > 0 {
                let _ = self.inner.append(&data[..allowed]);
            }
            return Err(self.faults.fire("crash during partial append"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(self.faults.fire("crash during sync"));
        }
        self.faults.sync_pause();
        self.inner.sync()
    }

    fn sync_data(&mut self) -> StorageResult<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(self.faults.fire("crash during sync"));
        }
        self.faults.sync_pause();
        self.inner.sync_data()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn torn_write_keeps_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let faults = Faults::new();
        let opener = FaultyOpener::new(Arc::clone(&faults));

        let mut backend = opener.create(&path).unwrap();
        backend.append(&[0u8; 16]).unwrap();
        faults.tear_after(4);
        assert!(backend.write_at(0, &[9u8; 8]).is_err());
        assert!(backend.write_at(8, &[9u8; 8]).is_err());
        assert_eq!(backend.read_at(0, 8).unwrap(), vec![9, 9, 9, 9, 0, 0, 0, 0]);
        assert_eq!(faults.fired(), 2);
    }

    #[test]
    fn sync_failure_is_reported() {
        let dir = tempdir().unwrap();
        let faults = Faults::new();
        let opener = FaultyOpener::new(Arc::clone(&faults));
        let mut backend = opener.create(&dir.path().join("seg")).unwrap();
        backend.append(b"abc").unwrap();
        faults.fail_syncs(true);
        assert!(backend.sync().is_err());
        faults.reset();
        backend.sync().unwrap();
    }
}
