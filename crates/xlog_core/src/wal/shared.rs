//! State shared by every component of the log.
//!
//! One [`SharedLogState`] exists per open data directory. Each field group
//! carries its own lock:
//!
//! - `insert`: position of the next record, previous record, redo pointer
//!   and full-page-write forcing. Held while copying a record into the
//!   ring, never across disk I/O except when the ring is completely full.
//! - `write`: the open segment. Held while writing or syncing the ring.
//! - `info`: short-lived copies of the redo pointer and the requested
//!   write and flush positions, readable without the insert lock.
//! - `checkpoint_lock`: at most one checkpoint at a time.
//!
//! Locks are always taken in the order insert, write, info/control.
//! Write and flush results are atomics so they can be read without locks.

use crate::config::{Config, Geometry};
use crate::control::ControlFileStore;
use crate::critical;
use crate::error::{WalError, WalResult};
use crate::types::{Lsn, TimeLineId};
use crate::wal::buffer::PageRing;
use crate::wal::record::RECORD_HEADER_SIZE;
use crate::wal::page::header_size_at;
use crate::wal::segment::{SegmentDir, SegmentHandle};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Insertion position and the state record assembly depends on.
#[derive(Debug)]
pub(crate) struct InsertState {
    /// Log page currently being filled.
    pub(crate) page_no: u64,
    /// Next free byte on that page.
    pub(crate) offset: usize,
    /// Start of the last record inserted.
    pub(crate) prev_record: Lsn,
    /// Redo pointer of the checkpoint in progress or last completed.
    pub(crate) redo: Lsn,
    /// Configured full-page-write setting.
    pub(crate) full_page_writes: bool,
    /// Online backups in progress.
    pub(crate) backup_sessions: u32,
    /// Timeline new pages are stamped with.
    pub(crate) tli: TimeLineId,
}

impl InsertState {
    /// Byte position just after the last inserted data.
    pub(crate) fn position(&self, page_size: u64) -> Lsn {
        Lsn::new(self.page_no * page_size + self.offset as u64)
    }

    /// Where the next record will start.
    pub(crate) fn next_record_position(&self, geometry: &Geometry) -> Lsn {
        let page_size = geometry.page_size;
        if page_size - (self.offset as u64) < RECORD_HEADER_SIZE as u64 {
            let next = Lsn::new((self.page_no + 1) * page_size);
            next.add(header_size_at(next, geometry.segment_size) as u64)
        } else {
            self.position(page_size)
        }
    }

    pub(crate) fn force_page_writes(&self) -> bool {
        self.full_page_writes || self.backup_sessions > 0
    }
}

/// Copies of insert state readable without the insert lock.
#[derive(Debug, Default)]
pub(crate) struct InfoState {
    /// Highest position anyone asked to have written.
    pub(crate) requested_write: Lsn,
    /// Highest position anyone asked to have flushed.
    pub(crate) requested_flush: Lsn,
    /// Mirror of the insert state's redo pointer.
    pub(crate) redo: Lsn,
    /// Mirror of the insert state's page-write forcing.
    pub(crate) force_page_writes: bool,
    /// End of the last checkpoint record written.
    pub(crate) last_checkpoint_end: Lsn,
    /// Unused tails of switched segments not yet reached by the writer,
    /// oldest first: from the page after each switch record to its
    /// segment end.
    pub(crate) switch_gaps: VecDeque<(Lsn, Lsn)>,
}

/// Writer state: the segment file currently open for writing.
#[derive(Debug, Default)]
pub(crate) struct WriteState {
    pub(crate) segment: Option<SegmentHandle>,
}

/// State shared between the inserter, writer, checkpointer, backup
/// coordinator and recovery.
pub struct SharedLogState {
    pub(crate) config: Config,
    pub(crate) geometry: Geometry,
    pub(crate) system_id: u64,
    pub(crate) insert: Mutex<InsertState>,
    pub(crate) info: Mutex<InfoState>,
    pub(crate) write: Mutex<WriteState>,
    pub(crate) checkpoint_lock: Mutex<()>,
    pub(crate) ring: PageRing,
    pub(crate) segments: SegmentDir,
    pub(crate) control: Arc<ControlFileStore>,
    write_result: AtomicU64,
    flush_result: AtomicU64,
    checkpoint_requested: AtomicBool,
    in_recovery: AtomicBool,
    stopped: AtomicBool,
    timeline: AtomicU32,
}

impl SharedLogState {
    /// Creates the shared state for a log on timeline `tli`. The insert
    /// position is unset until recovery or bootstrap places it.
    #[must_use]
    pub fn new(
        config: &Config,
        system_id: u64,
        tli: TimeLineId,
        segments: SegmentDir,
        control: Arc<ControlFileStore>,
    ) -> Self {
        let geometry = config.geometry();
        Self {
            config: config.clone(),
            geometry,
            system_id,
            insert: Mutex::new(InsertState {
                page_no: 0,
                offset: 0,
                prev_record: Lsn::INVALID,
                redo: Lsn::INVALID,
                full_page_writes: config.full_page_writes,
                backup_sessions: 0,
                tli,
            }),
            info: Mutex::new(InfoState {
                force_page_writes: config.full_page_writes,
                ..InfoState::default()
            }),
            write: Mutex::new(WriteState::default()),
            checkpoint_lock: Mutex::new(()),
            ring: PageRing::new(config.wal_buffers, geometry.page_size),
            segments,
            control,
            write_result: AtomicU64::new(0),
            flush_result: AtomicU64::new(0),
            checkpoint_requested: AtomicBool::new(false),
            in_recovery: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            timeline: AtomicU32::new(tli),
        }
    }

    /// Layout sizes.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Configuration the log was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cluster identity stamped into segment headers.
    #[must_use]
    pub fn system_identifier(&self) -> u64 {
        self.system_id
    }

    /// The control file.
    #[must_use]
    pub fn control(&self) -> &Arc<ControlFileStore> {
        &self.control
    }

    /// The segment directory.
    #[must_use]
    pub fn segments(&self) -> &SegmentDir {
        &self.segments
    }

    /// Position just after the last inserted record.
    #[must_use]
    pub fn insert_position(&self) -> Lsn {
        self.insert.lock().position(self.geometry.page_size)
    }

    /// Everything below this position has been handed to the OS.
    #[must_use]
    pub fn write_result(&self) -> Lsn {
        Lsn::new(self.write_result.load(Ordering::Acquire))
    }

    /// Everything below this position is durable.
    #[must_use]
    pub fn flush_result(&self) -> Lsn {
        Lsn::new(self.flush_result.load(Ordering::Acquire))
    }

    pub(crate) fn advance_write_result(&self, lsn: Lsn) {
        self.write_result.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    pub(crate) fn advance_flush_result(&self, lsn: Lsn) {
        self.flush_result.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    /// Sets both results outright; used when positions are first placed.
    pub(crate) fn reset_results(&self, lsn: Lsn) {
        self.write_result.store(lsn.as_u64(), Ordering::Release);
        self.flush_result.store(lsn.as_u64(), Ordering::Release);
    }

    /// Timeline new log is written on.
    #[must_use]
    pub fn timeline(&self) -> TimeLineId {
        self.timeline.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeline(&self, tli: TimeLineId) {
        self.timeline.store(tli, Ordering::Release);
        self.insert.lock().tli = tli;
    }

    /// Returns true while recovery is replaying the log.
    #[must_use]
    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_recovery(&self, value: bool) {
        self.in_recovery.store(value, Ordering::Release);
    }

    /// Returns true once a failure inside a critical section has stopped
    /// the log.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Fails with `Stopped` once the log has been stopped.
    pub(crate) fn ensure_running(&self) -> WalResult<()> {
        if self.is_stopped() {
            return Err(WalError::Stopped);
        }
        Ok(())
    }

    /// Like [`critical::escalate`], but first stops the log so that no
    /// other thread builds on state the panicking one left half changed.
    pub(crate) fn escalate<T>(&self, result: WalResult<T>) -> WalResult<T> {
        if result.is_err() && critical::in_critical_section() {
            self.stopped.store(true, Ordering::Release);
        }
        critical::escalate(result)
    }

    /// Returns true if enough log has accumulated that a checkpoint should
    /// be taken.
    #[must_use]
    pub fn checkpoint_requested(&self) -> bool {
        self.checkpoint_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_checkpoint(&self) {
        self.checkpoint_requested.store(true, Ordering::Release);
    }

    pub(crate) fn clear_checkpoint_request(&self) {
        self.checkpoint_requested.store(false, Ordering::Release);
    }

    /// Redo pointer of the latest checkpoint.
    #[must_use]
    pub fn redo_pointer(&self) -> Lsn {
        self.info.lock().redo
    }

    /// Returns true if full-page images are currently forced.
    #[must_use]
    pub fn forcing_page_writes(&self) -> bool {
        self.info.lock().force_page_writes
    }

    /// Sets the redo pointer in both the insert state and its mirror.
    pub(crate) fn publish_redo(&self, ins: &mut InsertState, redo: Lsn) {
        ins.redo = redo;
        self.info.lock().redo = redo;
    }

    /// Recomputes page-write forcing after the backup count or setting
    /// changed.
    pub(crate) fn publish_force(&self, ins: &InsertState) {
        self.info.lock().force_page_writes = ins.force_page_writes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            page_size: 8192,
            segment_size: 64 * 1024,
            data_page_size: 8192,
        }
    }

    fn state(page_no: u64, offset: usize) -> InsertState {
        InsertState {
            page_no,
            offset,
            prev_record: Lsn::INVALID,
            redo: Lsn::INVALID,
            full_page_writes: false,
            backup_sessions: 0,
            tli: 1,
        }
    }

    #[test]
    fn next_record_skips_short_tail() {
        let g = geometry();
        let ins = state(9, 8192 - 16);
        assert_eq!(ins.next_record_position(&g), Lsn::new(10 * 8192 + 16));

        // The next page starts a segment and gets a long header.
        let ins = state(7, 8192);
        assert_eq!(ins.next_record_position(&g), Lsn::new(8 * 8192 + 32));

        let ins = state(9, 100);
        assert_eq!(ins.next_record_position(&g), Lsn::new(9 * 8192 + 100));
    }

    #[test]
    fn backups_force_page_writes() {
        let mut ins = state(1, 16);
        assert!(!ins.force_page_writes());
        ins.backup_sessions = 2;
        assert!(ins.force_page_writes());
    }
}
