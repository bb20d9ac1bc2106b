//! Standby mode: replaying a log that is still being produced.
//!
//! A standby reads segment files like any recovery, but when it runs out
//! of log it asks the replication stream for more and waits on a latch
//! rather than stopping. Waits are bounded so that shutdown and promotion
//! requests are noticed within one wait interval. Promotion is sticky:
//! once seen, the next read past the available log ends recovery.

use crate::error::{WalError, WalResult};
use crate::types::{Lsn, TimeLineId};
use crate::wal::{PageSource, SegmentFileSource};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consumer side of the replication connection. Streamed log is written
/// into `pg_xlog` by the receiver; this trait only reports progress.
pub trait ReplicationStream: Send + Sync {
    /// Highest position received and written to disk.
    fn received_upto(&self) -> Lsn;

    /// Asks the receiver to stream from `start` on timeline `tli`.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary cannot be reached.
    fn request_streaming(&self, start: Lsn, tli: TimeLineId) -> WalResult<()>;

    /// Returns true while the receiver is connected.
    fn is_streaming(&self) -> bool;
}

/// A wakeup flag with a bounded wait.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates an unset latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch, waking a waiter.
    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    /// Clears the latch.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    /// Waits until the latch is set or `timeout` passes, then clears it.
    /// Returns true if it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            let _ = self.cond.wait_for(&mut set, timeout);
        }
        std::mem::replace(&mut *set, false)
    }
}

/// Promotion and shutdown requests from outside the recovery process.
#[derive(Debug, Default)]
pub struct RecoverySignals {
    promote: AtomicBool,
    shutdown: AtomicBool,
    latch: Latch,
}

impl RecoverySignals {
    /// Creates signals with nothing requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests promotion. Never withdrawn.
    pub fn promote(&self) {
        self.promote.store(true, Ordering::Release);
        self.latch.set();
    }

    /// Requests shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.latch.set();
    }

    /// Returns true once promotion has been requested.
    #[must_use]
    pub fn promote_requested(&self) -> bool {
        self.promote.load(Ordering::Acquire)
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Latch that wakes standby replay; set it when new log arrives.
    #[must_use]
    pub fn latch(&self) -> &Latch {
        &self.latch
    }
}

/// Page source for standby mode: local and archived files, fed by a
/// replication stream.
pub struct StandbySource {
    files: SegmentFileSource,
    stream: Option<Arc<dyn ReplicationStream>>,
    signals: Arc<RecoverySignals>,
    trigger_file: Option<PathBuf>,
    wait: Duration,
    tli: TimeLineId,
}

impl StandbySource {
    /// Creates a standby source streaming on timeline `tli`.
    #[must_use]
    pub fn new(
        files: SegmentFileSource,
        stream: Option<Arc<dyn ReplicationStream>>,
        signals: Arc<RecoverySignals>,
        wait: Duration,
        tli: TimeLineId,
    ) -> Self {
        Self {
            files,
            stream,
            signals,
            trigger_file: None,
            wait,
            tli,
        }
    }

    /// Promotes when `path` appears. The file is removed once seen.
    #[must_use]
    pub fn with_trigger_file(mut self, path: Option<PathBuf>) -> Self {
        self.trigger_file = path;
        self
    }

    /// The underlying file source.
    #[must_use]
    pub fn files(&self) -> &SegmentFileSource {
        &self.files
    }

    fn check_promote(&self) -> bool {
        if self.signals.promote_requested() {
            return true;
        }
        if let Some(path) = &self.trigger_file {
            if path.exists() {
                info!(path = %path.display(), "trigger file found");
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "could not remove trigger file");
                }
                self.signals.promote();
                return true;
            }
        }
        false
    }

    fn check_shutdown(&self) -> WalResult<()> {
        if self.signals.shutdown_requested() {
            return Err(WalError::Shutdown);
        }
        Ok(())
    }

    fn start_streaming(&self, from: Lsn) {
        let Some(stream) = &self.stream else {
            return;
        };
        if stream.is_streaming() {
            return;
        }
        match stream.request_streaming(from, self.tli) {
            Ok(()) => debug!(lsn = %from, tli = self.tli, "requested streaming"),
            Err(e) => warn!(lsn = %from, error = %e, "could not start streaming"),
        }
    }
}

impl PageSource for StandbySource {
    fn read_page(&mut self, page_addr: Lsn, needed_upto: Lsn, buf: &mut [u8]) -> WalResult<bool> {
        loop {
            self.check_shutdown()?;

            let streaming = self.stream.as_ref().is_some_and(|s| s.is_streaming());
            let received = self.stream.as_ref().map_or(Lsn::INVALID, |s| s.received_upto());
            if !streaming || received >= needed_upto {
                if self.files.read_page(page_addr, needed_upto, buf)? {
                    return Ok(true);
                }
                self.files.close();
            }

            if self.check_promote() {
                info!(lsn = %page_addr, "promotion requested, ending standby replay");
                return Ok(false);
            }
            self.start_streaming(page_addr);
            self.signals.latch().wait_timeout(self.wait);
        }
    }

    fn report_invalid(&mut self, lsn: Lsn, err: &WalError) -> WalResult<bool> {
        self.check_shutdown()?;
        if self.check_promote() {
            return Ok(false);
        }
        warn!(lsn = %lsn, error = %err, "invalid record in standby mode, waiting for a valid copy");
        self.files.close();
        self.start_streaming(lsn.page_start(self.files.geometry().page_size));
        self.signals.latch().wait_timeout(self.wait);
        self.check_shutdown()?;
        Ok(!self.check_promote())
    }

    fn reposition(&mut self) {
        self.files.reposition();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn latch_wakes_waiter() {
        let signals = Arc::new(RecoverySignals::new());
        let s = Arc::clone(&signals);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let woke = s.latch().wait_timeout(Duration::from_secs(10));
            (woke, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        signals.latch().set();
        let (woke, elapsed) = handle.join().unwrap();
        assert!(woke);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn latch_times_out() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        latch.set();
        assert!(latch.wait_timeout(Duration::from_millis(5)));
        latch.set();
        latch.reset();
        assert!(!latch.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn promotion_is_sticky() {
        let signals = RecoverySignals::new();
        assert!(!signals.promote_requested());
        signals.promote();
        assert!(signals.promote_requested());
        assert!(signals.promote_requested());
        assert!(!signals.shutdown_requested());
        signals.shutdown();
        assert!(signals.shutdown_requested());
    }
}
