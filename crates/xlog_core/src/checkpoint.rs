//! Checkpoints and restart points.
//!
//! A checkpoint fixes a redo pointer, asks the rest of the system to make
//! everything changed before it durable, logs a checkpoint record and
//! points the control file at it. Log older than the previous checkpoint's
//! redo pointer is then no longer needed for crash recovery and its
//! segments are recycled or removed.
//!
//! A restart point is the recovery-side equivalent: when archive recovery
//! replays a checkpoint record, the control file is moved forward so that
//! a crash during recovery restarts from there.

use crate::control::DbState;
use crate::critical::CriticalSection;
use crate::error::{WalError, WalResult};
use crate::records::{
    CheckPoint, CheckpointRecord, PreparedXact, RM_XLOG_ID, XLOG_CHECKPOINT_ONLINE,
    XLOG_CHECKPOINT_SHUTDOWN,
};
use crate::rmgr::RmgrRegistry;
use crate::types::{
    now_timestamp, Lsn, MultiXactId, MultiXactOffset, Oid, TransactionId, FIRST_BOOTSTRAP_OID,
    FIRST_NORMAL_XID,
};
use crate::wal::{Inserted, Inserter, RecordRequest, RetentionStats, SharedLogState, WalWriter};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Id counters stored in every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NextIds {
    /// Epoch of the next transaction id.
    pub next_xid_epoch: u32,
    /// Next transaction id.
    pub next_xid: TransactionId,
    /// Next object id.
    pub next_oid: Oid,
    /// Next multi-transaction id.
    pub next_multi: MultiXactId,
    /// Next multi-transaction member offset.
    pub next_multi_offset: MultiXactOffset,
}

impl Default for NextIds {
    fn default() -> Self {
        Self {
            next_xid_epoch: 0,
            next_xid: FIRST_NORMAL_XID,
            next_oid: FIRST_BOOTSTRAP_OID,
            next_multi: 1,
            next_multi_offset: 0,
        }
    }
}

impl NextIds {
    /// The counters recorded in `ckpt`.
    #[must_use]
    pub fn from_checkpoint(ckpt: &CheckPoint) -> Self {
        Self {
            next_xid_epoch: ckpt.next_xid_epoch,
            next_xid: ckpt.next_xid,
            next_oid: ckpt.next_oid,
            next_multi: ckpt.next_multi,
            next_multi_offset: ckpt.next_multi_offset,
        }
    }

    fn fill(&self, ckpt: &mut CheckPoint) {
        ckpt.next_xid_epoch = self.next_xid_epoch;
        ckpt.next_xid = self.next_xid;
        ckpt.next_oid = self.next_oid;
        ckpt.next_multi = self.next_multi;
        ckpt.next_multi_offset = self.next_multi_offset;
    }
}

/// What a checkpoint needs from the rest of the system.
pub trait CheckpointHooks: Send + Sync {
    /// Current id counters; `None` keeps the last known values.
    fn next_ids(&self) -> Option<NextIds> {
        None
    }

    /// Makes every change logged before the redo pointer durable: dirty
    /// data pages, commit status, subtransaction and multixact state.
    ///
    /// # Errors
    ///
    /// Any error aborts the checkpoint.
    fn flush_state(&self, _is_shutdown: bool) -> WalResult<()> {
        Ok(())
    }

    /// Prepared transactions still in flight.
    fn prepared_transactions(&self) -> Vec<PreparedXact> {
        Vec::new()
    }
}

/// Hooks for a system with no state outside the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl CheckpointHooks for DefaultHooks {}

/// Result of [`CheckpointManager::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CheckpointOutcome {
    /// Start of the checkpoint record (the previous one when skipped).
    pub lsn: Lsn,
    /// Redo pointer.
    pub redo: Lsn,
    /// Nothing had happened since the last checkpoint.
    pub skipped: bool,
    /// Segments recycled.
    pub recycled: usize,
    /// Segments removed.
    pub removed: usize,
    /// A future segment was created ahead of need.
    pub preallocated: bool,
}

/// Takes checkpoints and restart points.
pub struct CheckpointManager {
    shared: Arc<SharedLogState>,
    inserter: Inserter,
    writer: WalWriter,
    hooks: Arc<dyn CheckpointHooks>,
    rmgrs: RmgrRegistry,
    ids: Mutex<NextIds>,
}

impl CheckpointManager {
    /// Creates a checkpoint manager.
    #[must_use]
    pub fn new(
        shared: Arc<SharedLogState>,
        inserter: Inserter,
        writer: WalWriter,
        hooks: Arc<dyn CheckpointHooks>,
        rmgrs: RmgrRegistry,
    ) -> Self {
        Self {
            shared,
            inserter,
            writer,
            hooks,
            rmgrs,
            ids: Mutex::new(NextIds::default()),
        }
    }

    /// Last known id counters.
    #[must_use]
    pub fn next_ids(&self) -> NextIds {
        *self.ids.lock()
    }

    pub(crate) fn set_next_ids(&self, ids: NextIds) {
        *self.ids.lock() = ids;
    }

    /// Raises the tracked next object id to `oid`.
    pub(crate) fn note_next_oid(&self, oid: Oid) {
        let mut ids = self.ids.lock();
        if oid > ids.next_oid {
            ids.next_oid = oid;
        }
    }

    /// Takes a checkpoint.
    ///
    /// Unless `force` or `is_shutdown` is set, a checkpoint is skipped when
    /// nothing has been logged since the previous one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` during recovery or if log activity overlaps a
    /// shutdown checkpoint, `Stopped` after a critical-section failure, and
    /// any error from the hooks or the log. A failure to rewrite the control
    /// file panics.
    pub fn checkpoint(&self, is_shutdown: bool, force: bool) -> WalResult<CheckpointOutcome> {
        let shared = &*self.shared;
        shared.ensure_running()?;
        let _running = shared.checkpoint_lock.lock();
        shared.clear_checkpoint_request();
        if shared.in_recovery() {
            return Err(WalError::invalid_state(
                "cannot take a checkpoint during recovery",
            ));
        }

        let control = shared.control();
        let before = control.snapshot();
        let mut ins = shared.insert.lock();
        if !is_shutdown && !force {
            let position = ins.position(shared.geometry.page_size);
            let last_end = shared.info.lock().last_checkpoint_end;
            if position == last_end && before.checkpoint == before.checkpoint_copy.redo {
                debug!(checkpoint = %before.checkpoint, "no activity since last checkpoint, skipping");
                return Ok(CheckpointOutcome {
                    lsn: before.checkpoint,
                    redo: before.checkpoint_copy.redo,
                    skipped: true,
                    ..CheckpointOutcome::default()
                });
            }
        }
        let redo = ins.next_record_position(&shared.geometry);
        shared.publish_redo(&mut ins, redo);
        drop(ins);
        info!(redo = %redo, shutdown = is_shutdown, "checkpoint starting");

        self.hooks.flush_state(is_shutdown)?;
        let ids = self.hooks.next_ids().unwrap_or_else(|| self.next_ids());
        self.set_next_ids(ids);
        let prepared = self.hooks.prepared_transactions();

        let mut ckpt = CheckPoint {
            redo,
            this_timeline: shared.timeline(),
            time: now_timestamp(),
            ..CheckPoint::default()
        };
        ids.fill(&mut ckpt);
        let body = CheckpointRecord {
            checkpoint: ckpt,
            prepared: prepared.clone(),
        }
        .encode();
        let op = if is_shutdown {
            XLOG_CHECKPOINT_SHUTDOWN
        } else {
            XLOG_CHECKPOINT_ONLINE
        };
        let Inserted { lsn, end_lsn } = self
            .inserter
            .insert_record(&RecordRequest::new(RM_XLOG_ID, op).data(&body))?;
        self.writer.flush_through(end_lsn)?;

        if is_shutdown && redo != lsn {
            return Err(WalError::invalid_state(
                "concurrent log activity while the database is shutting down",
            ));
        }
        shared.info.lock().last_checkpoint_end = end_lsn;

        {
            let _cs = CriticalSection::enter();
            shared.escalate(control.update(shared.flush_result(), |c| {
                if is_shutdown {
                    c.state = DbState::Shutdowned;
                }
                c.prev_checkpoint = c.checkpoint;
                c.checkpoint = lsn;
                c.checkpoint_copy = ckpt;
                c.min_recovery_point = Lsn::INVALID;
            }))?;
        }

        let retention = self.remove_old_segments(before.checkpoint_copy.redo, &prepared, end_lsn)?;
        let preallocated = !is_shutdown && self.preallocate(end_lsn)?;

        info!(
            lsn = %lsn,
            redo = %redo,
            recycled = retention.recycled,
            removed = retention.removed,
            "checkpoint complete"
        );
        Ok(CheckpointOutcome {
            lsn,
            redo,
            skipped: false,
            recycled: retention.recycled,
            removed: retention.removed,
            preallocated,
        })
    }

    /// Moves the control file to the replayed checkpoint at `lsn`. Returns
    /// false if skipped: some resource manager is mid-way through a
    /// multi-record action, or the control file already points there.
    ///
    /// # Errors
    ///
    /// Returns errors from the hooks, the control file or retention.
    pub fn restart_point(&self, lsn: Lsn, end_lsn: Lsn, ckpt: &CheckPoint) -> WalResult<bool> {
        for (id, rmgr) in self.rmgrs.iter() {
            if !rmgr.safe_restartpoint() {
                debug!(rmgr = id, lsn = %lsn, "resource manager not at a safe point, skipping restart point");
                return Ok(false);
            }
        }
        let shared = &*self.shared;
        let _running = shared.checkpoint_lock.lock();
        let control = shared.control();
        let before = control.snapshot();
        if before.checkpoint == lsn {
            return Ok(false);
        }

        self.hooks.flush_state(false)?;
        control.update(end_lsn, |c| {
            c.prev_checkpoint = c.checkpoint;
            c.checkpoint = lsn;
            c.checkpoint_copy = *ckpt;
            c.state = DbState::InArchiveRecovery;
            if end_lsn > c.min_recovery_point {
                c.min_recovery_point = end_lsn;
            }
        })?;

        let seg = shared.geometry.segment_size;
        let prior = before.checkpoint_copy.redo;
        if prior.is_valid() {
            shared
                .segments
                .remove_old_segments(ckpt.this_timeline, prior.segno(seg), end_lsn.segno(seg))?;
        }
        info!(lsn = %lsn, redo = %ckpt.redo, "restart point complete");
        Ok(true)
    }

    fn remove_old_segments(
        &self,
        prior_redo: Lsn,
        prepared: &[PreparedXact],
        end: Lsn,
    ) -> WalResult<RetentionStats> {
        if !prior_redo.is_valid() {
            return Ok(RetentionStats::default());
        }
        let shared = &*self.shared;
        let seg = shared.geometry.segment_size;
        let current = end.segno(seg);
        let mut cutoff = prior_redo.segno(seg);
        for p in prepared.iter().filter(|p| p.prepare_lsn.is_valid()) {
            cutoff = cutoff.min(p.prepare_lsn.segno(seg));
        }
        let keep = u64::from(shared.config.keep_segments);
        if keep > 0 {
            cutoff = cutoff.min(current.saturating_sub(keep));
        }
        if cutoff == 0 {
            return Ok(RetentionStats::default());
        }
        shared
            .segments
            .remove_old_segments(shared.timeline(), cutoff, current)
    }

    /// Creates the next segment once three quarters of the current one
    /// are used.
    fn preallocate(&self, end: Lsn) -> WalResult<bool> {
        let seg = self.shared.geometry.segment_size;
        if end.segment_offset(seg) < seg / 4 * 3 {
            return Ok(false);
        }
        self.shared
            .segments
            .preallocate(self.shared.timeline(), end.segno(seg) + 1)
    }
}
