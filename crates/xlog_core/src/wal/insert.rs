//! Record insertion into the page ring.
//!
//! The record body, including any full-page images, is assembled and
//! checksummed before the insert lock is taken. Whether a touched page
//! needs an image depends on the redo pointer and on page-write forcing,
//! both of which a concurrent checkpoint or backup start may change in
//! the meantime; once the lock is held the decision is re-checked and the
//! attempt is retried if an image that is now required was left out.

use crate::critical::CriticalSection;
use crate::error::{WalError, WalResult};
use crate::records::{RM_XLOG_ID, XLOG_SWITCH};
use crate::rmgr::{ChangeTracker, TrackedRecord};
use crate::types::{maxalign, Lsn, Outcome};
use crate::wal::page::{
    encode_cont_header, PageHeader, CONT_RECORD_HEADER_SIZE, LONG_PAGE_HEADER_SIZE,
    XLP_FIRST_IS_CONTRECORD,
};
use crate::wal::record::{AssembledBody, RecordHeader, RecordRequest, MAX_BKP_BLOCKS, RECORD_HEADER_SIZE};
use crate::wal::shared::{InsertState, SharedLogState};
use crate::wal::writer::WalWriter;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace};

/// A record placed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// Where the record starts.
    pub lsn: Lsn,
    /// Where the next record may start.
    pub end_lsn: Lsn,
}

/// Appends records to the page ring.
#[derive(Clone)]
pub struct Inserter {
    shared: Arc<SharedLogState>,
    writer: WalWriter,
    tracker: Option<Arc<dyn ChangeTracker>>,
}

impl Inserter {
    /// Creates an inserter over `shared`.
    #[must_use]
    pub fn new(
        shared: Arc<SharedLogState>,
        writer: WalWriter,
        tracker: Option<Arc<dyn ChangeTracker>>,
    ) -> Self {
        Self {
            shared,
            writer,
            tracker,
        }
    }

    /// Inserts a record and returns its end LSN.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert_record`].
    pub fn insert(&self, req: &RecordRequest<'_>) -> WalResult<Lsn> {
        self.insert_record(req).map(|r| r.end_lsn)
    }

    /// Inserts a record and returns where it starts and ends.
    ///
    /// A segment switch requested while the insert point is already at the
    /// start of a segment writes nothing and returns that position. Any
    /// other switch returns once the switched segment is flushed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a malformed request, `InvalidState`
    /// during recovery, `Stopped` after a critical-section failure, and I/O
    /// errors if ring space could not be freed.
    pub fn insert_record(&self, req: &RecordRequest<'_>) -> WalResult<Inserted> {
        self.shared.ensure_running()?;
        if self.shared.in_recovery() {
            return Err(WalError::invalid_state(
                "cannot make new WAL entries during recovery",
            ));
        }
        req.validate(self.shared.geometry.data_page_size)?;

        let (inserted, bytes) = loop {
            match self.try_insert(req) {
                Outcome::Done(done) => break done,
                Outcome::Retry => {
                    debug!("redo pointer moved during insert, reassembling record");
                }
                Outcome::Fatal(err) => return Err(err),
            }
        };

        if let (Some(tracker), Some(bytes)) = (&self.tracker, &bytes) {
            tracker.append(&TrackedRecord {
                lsn: inserted.lsn,
                end_lsn: inserted.end_lsn,
                rmid: req.rmid,
                info: bytes[25],
                xid: req.xid,
                bytes,
            });
        }

        let pending = inserted.end_lsn.as_u64().saturating_sub(self.shared.write_result().as_u64());
        if pending > self.shared.ring.capacity() / 2 {
            self.writer.try_write_completed()?;
        }
        Ok(inserted)
    }

    fn try_insert(&self, req: &RecordRequest<'_>) -> Outcome<(Inserted, Option<Vec<u8>>), WalError> {
        let (redo, force) = {
            let info = self.shared.info.lock();
            (info.redo, info.force_page_writes)
        };
        let backed_up = needs_backup(req, redo, force);
        let body = AssembledBody::assemble(req, backed_up);

        let mut ins = self.shared.insert.lock();
        if ins.redo != redo || ins.force_page_writes() != force {
            let now = needs_backup(req, ins.redo, ins.force_page_writes());
            if (0..MAX_BKP_BLOCKS).any(|i| now[i] && !body.backed_up[i]) {
                return Outcome::Retry;
            }
        }

        if req.is_switch() {
            let done = match self.insert_switch(&mut ins, &body) {
                Ok(done) => done,
                Err(err) => return Outcome::Fatal(err),
            };
            drop(ins);
            let inserted = done.0;
            if inserted.end_lsn > inserted.lsn {
                if let Err(err) = self.writer.flush_through(inserted.end_lsn) {
                    return Outcome::Fatal(err);
                }
            }
            return Outcome::Done(done);
        }

        let page_size = self.shared.geometry.page_size;
        if page_size - (ins.offset as u64) < RECORD_HEADER_SIZE as u64 {
            if let Err(err) = self.advance_page(&mut ins, None) {
                return Outcome::Fatal(err);
            }
        }

        let start = ins.position(page_size);
        let bytes = body.finish(RecordHeader {
            prev: ins.prev_record,
            xid: req.xid,
            rmid: req.rmid,
            info: req.info,
            ..RecordHeader::default()
        });
        {
            let _cs = CriticalSection::enter();
            if let Err(err) = self.shared.escalate(self.copy_record(&mut ins, &bytes)) {
                return Outcome::Fatal(err);
            }
        }
        ins.prev_record = start;
        let end = ins.position(page_size);
        drop(ins);

        self.publish_request(end);
        trace!(lsn = %start, end = %end, rmid = req.rmid, "inserted record");
        let inserted = Inserted {
            lsn: start,
            end_lsn: end,
        };
        Outcome::Done((inserted, self.tracker.as_ref().map(|_| bytes)))
    }

    /// Places a switch record and moves the insert point to the start of
    /// the next segment. The rest of the segment is queued as a gap for
    /// the writer, which finishes the segment when it gets there.
    fn insert_switch(
        &self,
        ins: &mut MutexGuard<'_, InsertState>,
        body: &AssembledBody,
    ) -> WalResult<(Inserted, Option<Vec<u8>>)> {
        let geometry = self.shared.geometry;
        let page_size = geometry.page_size;
        let pos = ins.position(page_size);
        let mut seg_start = (pos.segment_offset(geometry.segment_size) == 0).then_some(pos);
        if seg_start.is_none() {
            if page_size - (ins.offset as u64) < RECORD_HEADER_SIZE as u64 {
                self.advance_page(ins, None)?;
            }
            if ins.page_no % geometry.pages_per_segment() == 0
                && ins.offset == LONG_PAGE_HEADER_SIZE
            {
                seg_start = Some(Lsn::new(ins.page_no * page_size));
            }
        }
        if let Some(seg_start) = seg_start {
            debug!(lsn = %seg_start, "segment switch at segment start, nothing to do");
            return Ok((
                Inserted {
                    lsn: seg_start,
                    end_lsn: seg_start,
                },
                None,
            ));
        }

        let start = ins.position(page_size);
        let bytes = body.finish(RecordHeader {
            prev: ins.prev_record,
            rmid: RM_XLOG_ID,
            info: XLOG_SWITCH,
            ..RecordHeader::default()
        });

        {
            let _cs = CriticalSection::enter();
            self.shared.escalate(self.copy_record(ins, &bytes))?;
        }
        ins.prev_record = start;
        let end = ins.position(page_size);
        let gap_start = if end.page_offset(page_size) == 0 {
            end
        } else {
            end.page_start(page_size).add(page_size)
        };
        let seg_end = Lsn::new((start.segno(geometry.segment_size) + 1) * geometry.segment_size);
        ins.page_no = seg_end.as_u64() / page_size - 1;
        ins.offset = page_size as usize;

        {
            let mut info = self.shared.info.lock();
            if gap_start < seg_end {
                info.switch_gaps.push_back((gap_start, seg_end));
            }
            if seg_end > info.requested_write {
                info.requested_write = seg_end;
            }
        }

        debug!(lsn = %start, segment_end = %seg_end, "switched to next log segment");
        let inserted = Inserted {
            lsn: start,
            end_lsn: seg_end,
        };
        Ok((inserted, self.tracker.as_ref().map(|_| bytes)))
    }

    fn publish_request(&self, end: Lsn) {
        let mut info = self.shared.info.lock();
        if end > info.requested_write {
            info.requested_write = end;
        }
    }

    /// Copies a finished record at the insert point, continuing onto as
    /// many pages as it needs.
    fn copy_record(&self, ins: &mut InsertState, bytes: &[u8]) -> WalResult<()> {
        let page_size = self.shared.geometry.page_size as usize;
        let mut rest = bytes;
        loop {
            let n = rest.len().min(page_size - ins.offset);
            {
                let slot = self.shared.ring.slot_of(ins.page_no);
                let mut page = self.shared.ring.page(slot);
                page[ins.offset..ins.offset + n].copy_from_slice(&rest[..n]);
            }
            ins.offset += n;
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
            self.advance_page(ins, Some(rest.len() as u32))?;
        }
        ins.offset = (maxalign(ins.offset as u64) as usize).min(page_size);
        Ok(())
    }

    /// Moves the insert point to a freshly initialised next page. With
    /// `cont`, the page starts with the continuation of a record that has
    /// that many bytes left.
    ///
    /// If the slot still holds a page that has not been written, it is
    /// written first, with the insert lock held.
    fn advance_page(&self, ins: &mut InsertState, cont: Option<u32>) -> WalResult<()> {
        let shared = &*self.shared;
        let geometry = shared.geometry;
        let next = ins.page_no + 1;
        let slot = shared.ring.slot_of(next);

        let old_end = shared.ring.slot_end(slot);
        if old_end > shared.write_result() {
            debug!(lsn = %old_end, "ring buffer full, writing before reuse");
            let mut ws = shared.write.lock();
            if old_end > shared.write_result() {
                self.writer.write_locked(&mut ws, old_end, Lsn::INVALID)?;
            }
        }

        let page_addr = Lsn::new(next * geometry.page_size);
        let mut header = PageHeader::new(page_addr, ins.tli, shared.system_id, &geometry);
        let mut data_start = header.size();
        if cont.is_some() {
            header.info |= XLP_FIRST_IS_CONTRECORD;
            data_start += CONT_RECORD_HEADER_SIZE;
        }
        {
            let mut page = shared.ring.page(slot);
            page.fill(0);
            header.encode_into(&mut page);
            if let Some(rem) = cont {
                encode_cont_header(&mut page, header.size(), rem);
            }
            shared.ring.set_slot_end(slot, page_addr.add(geometry.page_size));
        }
        ins.page_no = next;
        ins.offset = maxalign(data_start as u64) as usize;
        Ok(())
    }

    /// Places the insert point at `end` after recovery or bootstrap.
    ///
    /// `tail` is the image of the page containing `end` when `end` is not
    /// on a page boundary; bytes from `end` on are cleared.
    pub(crate) fn reset_position(
        &self,
        end: Lsn,
        prev_record: Lsn,
        redo: Lsn,
        tail: Option<&[u8]>,
    ) -> WalResult<()> {
        let shared = &*self.shared;
        let page_size = shared.geometry.page_size;
        let mut ins = shared.insert.lock();
        let offset = end.page_offset(page_size);
        if offset == 0 {
            ins.page_no = end.as_u64() / page_size - 1;
            ins.offset = page_size as usize;
        } else {
            let Some(tail) = tail.filter(|t| t.len() as u64 == page_size) else {
                return Err(WalError::invalid_state(format!(
                    "missing log page image for end of log {end}"
                )));
            };
            let page_no = end.as_u64() / page_size;
            let slot = shared.ring.slot_of(page_no);
            let mut page = shared.ring.page(slot);
            page.copy_from_slice(tail);
            page[offset as usize..].fill(0);
            shared.ring.set_slot_end(slot, Lsn::new((page_no + 1) * page_size));
            ins.page_no = page_no;
            ins.offset = offset as usize;
        }
        ins.prev_record = prev_record;
        ins.tli = shared.timeline();
        shared.publish_redo(&mut ins, redo);
        shared.publish_force(&ins);
        drop(ins);

        shared.reset_results(end);
        let mut info = shared.info.lock();
        info.requested_write = end;
        info.requested_flush = end;
        info.switch_gaps.clear();
        Ok(())
    }

    /// Current insert position.
    #[must_use]
    pub fn position(&self) -> Lsn {
        self.shared.insert_position()
    }
}

/// Decides which touched pages get full images.
fn needs_backup(req: &RecordRequest<'_>, redo: Lsn, force: bool) -> [bool; MAX_BKP_BLOCKS] {
    let mut out = [false; MAX_BKP_BLOCKS];
    if force {
        for (i, page) in req.pages.iter().enumerate() {
            out[i] = page.lsn <= redo;
        }
    }
    out
}
