//! Moving ring pages to segment files.
//!
//! Consecutive pages of one segment are gathered into a single write. A
//! segment is synced only when a flush is requested or when the writer
//! finishes it; finishing also hands the file to the archiver, advances
//! the control file's segment watermark and may request a checkpoint.
//! The unused tail of a switched segment is never written: reaching it
//! finishes the segment and moves on to the next one.

use crate::error::{WalError, WalResult};
use crate::types::Lsn;
use crate::wal::segment::SegmentHandle;
use crate::wal::shared::{SharedLogState, WriteState};
use std::sync::Arc;
use tracing::{debug, error};

/// Writes and flushes the ring.
#[derive(Clone)]
pub struct WalWriter {
    shared: Arc<SharedLogState>,
}

impl WalWriter {
    /// Creates a writer over `shared`.
    #[must_use]
    pub fn new(shared: Arc<SharedLogState>) -> Self {
        Self { shared }
    }

    /// Ensures everything inserted below `upto` has been written.
    ///
    /// # Errors
    ///
    /// Returns I/O errors, or `FlushShortfall` if `upto` is beyond the
    /// inserted log.
    pub fn write_through(&self, upto: Lsn) -> WalResult<()> {
        self.shared.ensure_running()?;
        if upto <= self.shared.write_result() {
            return Ok(());
        }
        let target = self.request(Lsn::INVALID);
        let mut ws = self.shared.write.lock();
        self.write_locked(&mut ws, target, Lsn::INVALID)?;
        self.check_reached(upto, self.shared.write_result())
    }

    /// Ensures everything inserted below `upto` is durable.
    ///
    /// During recovery nothing is written; the control file's minimum
    /// recovery point is advanced instead.
    ///
    /// # Errors
    ///
    /// Returns I/O errors, `Stopped` after a critical-section failure, or
    /// `FlushShortfall` if `upto` is beyond the inserted log. Inside a
    /// critical section errors panic and stop the log.
    pub fn flush_through(&self, upto: Lsn) -> WalResult<()> {
        self.shared.ensure_running()?;
        if self.shared.in_recovery() {
            return self.shared.escalate(self.advance_min_recovery_point(upto));
        }
        if upto <= self.shared.flush_result() {
            return Ok(());
        }
        let target = self.request(upto);
        let mut ws = self.shared.write.lock();
        let result = self
            .write_locked(&mut ws, target, upto)
            .and_then(|()| self.check_reached(upto, self.shared.flush_result()));
        self.shared.escalate(result)
    }

    /// Writes and flushes completed pages if the write path is free.
    /// Returns true if anything was done.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn background_flush(&self) -> WalResult<bool> {
        self.shared.ensure_running()?;
        if self.shared.in_recovery() {
            return Ok(false);
        }
        let requested = self.shared.info.lock().requested_write;
        let page_size = self.shared.geometry.page_size;
        let mut target = requested.page_start(page_size);
        if target <= self.shared.flush_result() {
            target = requested;
        }
        if target <= self.shared.flush_result() {
            return Ok(false);
        }
        let Some(mut ws) = self.shared.write.try_lock() else {
            return Ok(false);
        };
        self.write_locked(&mut ws, target, target)?;
        Ok(true)
    }

    /// Writes completed pages without waiting for the write lock.
    pub(crate) fn try_write_completed(&self) -> WalResult<bool> {
        self.shared.ensure_running()?;
        let requested = self.shared.info.lock().requested_write;
        let target = requested.page_start(self.shared.geometry.page_size);
        if target <= self.shared.write_result() {
            return Ok(false);
        }
        let Some(mut ws) = self.shared.write.try_lock() else {
            return Ok(false);
        };
        self.write_locked(&mut ws, target, Lsn::INVALID)?;
        Ok(true)
    }

    /// Closes the open segment, syncing it first.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn close_segment(&self) -> WalResult<()> {
        let mut ws = self.shared.write.lock();
        if let Some(mut handle) = ws.segment.take() {
            handle.sync(self.shared.config.sync_method)?;
            handle.close()?;
        }
        Ok(())
    }

    /// Records a flush request and returns how far to write: everything
    /// inserted so far, which covers `upto` unless it is past the end.
    fn request(&self, flush: Lsn) -> Lsn {
        let mut info = self.shared.info.lock();
        if flush > info.requested_flush {
            info.requested_flush = flush;
        }
        info.requested_write
    }

    fn check_reached(&self, requested: Lsn, reached: Lsn) -> WalResult<()> {
        if reached < requested {
            error!(requested = %requested, reached = %reached, "log position not reached");
            return Err(WalError::FlushShortfall {
                requested,
                flushed: reached,
            });
        }
        Ok(())
    }

    fn advance_min_recovery_point(&self, upto: Lsn) -> WalResult<()> {
        let control = &self.shared.control;
        if upto <= control.snapshot().min_recovery_point {
            return Ok(());
        }
        control.update(upto, |c| {
            if upto > c.min_recovery_point {
                c.min_recovery_point = upto;
            }
        })?;
        debug!(lsn = %upto, "updated minimum recovery point");
        Ok(())
    }

    /// Writes the ring up to `write_upto` and syncs up to `flush_upto`.
    /// The caller holds the write lock.
    pub(crate) fn write_locked(
        &self,
        ws: &mut WriteState,
        write_upto: Lsn,
        flush_upto: Lsn,
    ) -> WalResult<()> {
        let shared = &*self.shared;
        let geometry = shared.geometry;
        let page_size = geometry.page_size;
        let pages_per_segment = geometry.pages_per_segment();

        let written = shared.write_result();
        if write_upto > written {
            let last = (write_upto.as_u64() - 1) / page_size;
            let mut page_no = written.as_u64() / page_size;
            let mut buf = Vec::new();
            while page_no <= last {
                let gap = shared.info.lock().switch_gaps.front().copied();
                if let Some((gap_start, gap_end)) = gap {
                    if page_no * page_size >= gap_start.as_u64() {
                        self.finish_switch(ws, gap_end)?;
                        shared.info.lock().switch_gaps.pop_front();
                        page_no = gap_end.as_u64() / page_size;
                        continue;
                    }
                }

                let segno = page_no / pages_per_segment;
                let mut run_end = last.min((segno + 1) * pages_per_segment - 1);
                if let Some((gap_start, _)) = gap {
                    run_end = run_end.min(gap_start.as_u64() / page_size - 1);
                }

                buf.clear();
                for p in page_no..=run_end {
                    if !shared.ring.copy_page(p, &mut buf) {
                        return Err(WalError::invalid_state(format!(
                            "log page at {} is no longer in the ring buffer",
                            Lsn::new(p * page_size)
                        )));
                    }
                }

                let handle = self.segment_for(ws, segno)?;
                let offset = (page_no % pages_per_segment) * page_size;
                handle.write_at(offset, &buf)?;

                let run_end_lsn = Lsn::new((run_end + 1) * page_size);
                shared.advance_write_result(run_end_lsn.min(write_upto));

                if run_end_lsn.segment_offset(geometry.segment_size) == 0
                    && write_upto >= run_end_lsn
                {
                    self.finish_segment(ws, run_end_lsn)?;
                }
                page_no = run_end + 1;
            }
        }

        if flush_upto > shared.flush_result() {
            let upto = shared.write_result();
            if let Some(handle) = ws.segment.as_mut() {
                handle.sync(shared.config.sync_method)?;
            }
            shared.advance_flush_result(upto);
        }
        Ok(())
    }

    /// Returns the handle for `segno`, opening it if needed.
    fn segment_for<'a>(&self, ws: &'a mut WriteState, segno: u64) -> WalResult<&'a mut SegmentHandle> {
        let tli = self.shared.timeline();
        let reopen = match &ws.segment {
            Some(h) => h.segno() != segno || h.tli() != tli,
            None => true,
        };
        if reopen {
            if let Some(mut old) = ws.segment.take() {
                old.sync(self.shared.config.sync_method)?;
                old.close()?;
            }
            let handle = self.shared.segments.open_for_write(tli, segno, true)?;
            debug!(segment = %handle.name(), "opened log file for writing");
            self.advance_watermark(segno)?;
            ws.segment = Some(handle);
        }
        match ws.segment.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(WalError::invalid_state("no log file open")),
        }
    }

    /// Records in the control file that the writer has reached `segno`.
    fn advance_watermark(&self, segno: u64) -> WalResult<()> {
        let per_log = self.shared.geometry.segments_per_log();
        let (log_id, log_seg) = ((segno / per_log) as u32, (segno % per_log) as u32);
        let control = &self.shared.control;
        let current = control.snapshot();
        if (current.log_id, current.log_seg) >= (log_id, log_seg) {
            return Ok(());
        }
        control.update(self.shared.flush_result(), |c| {
            c.log_id = log_id;
            c.log_seg = log_seg;
        })?;
        Ok(())
    }

    /// Completes the open segment, whose end is `seg_end`: sync, archive
    /// notification, checkpoint trigger, close.
    fn finish_segment(&self, ws: &mut WriteState, seg_end: Lsn) -> WalResult<()> {
        let shared = &*self.shared;
        let Some(mut handle) = ws.segment.take() else {
            return Ok(());
        };
        handle.sync(shared.config.sync_method)?;
        shared.advance_write_result(seg_end);
        shared.advance_flush_result(seg_end);
        if shared.config.archive_mode {
            shared.segments.mark_ready(handle.name())?;
        }

        let segno = handle.segno();
        if !shared.in_recovery() {
            let redo_segno = shared.info.lock().redo.segno(shared.geometry.segment_size);
            let threshold = u64::from(shared.config.checkpoint_segments.saturating_sub(1));
            if segno.saturating_sub(redo_segno) >= threshold {
                debug!(segment = %handle.name(), "checkpoint requested by log volume");
                shared.request_checkpoint();
            }
        }
        handle.close()
    }

    /// Completes the segment a switch record was written into: everything
    /// up to `seg_end` counts as written and flushed.
    fn finish_switch(&self, ws: &mut WriteState, seg_end: Lsn) -> WalResult<()> {
        if self.shared.flush_result() >= seg_end {
            return Ok(());
        }
        let segno = seg_end.segno(self.shared.geometry.segment_size) - 1;
        self.segment_for(ws, segno)?;
        self.finish_segment(ws, seg_end)
    }
}
