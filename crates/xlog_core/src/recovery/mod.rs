//! Startup: finding the last checkpoint and replaying the log after it.
//!
//! # Overview
//!
//! Startup reads the control file's latest checkpoint (or the one named by
//! a backup label), decides whether recovery is needed, and if so replays
//! every record from the checkpoint's redo pointer to the end of valid
//! log. Archive recovery additionally reads segments from an archive
//! directory, may stop at a point-in-time target, and always ends by
//! starting a new timeline. Standby mode is archive recovery that waits
//! for more log instead of ending, until promoted.
//!
//! Once replay is done the insert position is placed at the end of the
//! log and, if anything was replayed, a checkpoint is taken before new
//! records are accepted.

pub mod standby;
pub mod target;

pub use standby::{Latch, RecoverySignals, ReplicationStream, StandbySource};
pub use target::{check_stop, stop_reason, RecoveryStop};

use crate::backup::{parse_backup_label, BackupLabel};
use crate::checkpoint::{CheckpointManager, NextIds};
use crate::config::{RecoveryConfig, TargetTimeline};
use crate::control::{ControlFileData, DbState};
use crate::dir::{sync_directory, DataDir};
use crate::error::{WalError, WalResult};
use crate::manager::Collaborators;
use crate::records::{
    decode_backup_end, decode_next_oid, CheckPoint, CheckpointRecord, RM_XACT_ID, RM_XLOG_ID,
    XLOG_BACKUP_END, XLOG_CHECKPOINT_ONLINE, XLOG_CHECKPOINT_SHUTDOWN, XLOG_NEXTOID,
};
use crate::timeline::{find_newest_timeline, read_history, write_history, TimelineHistory};
use crate::types::{Lsn, TimeLineId};
use crate::wal::segment::open_read_only;
use crate::wal::{DecodedRecord, Inserter, PageSource, SegmentFileSource, SharedLogState, WalReader};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What startup found and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    /// Checkpoint record startup began from.
    pub checkpoint: Lsn,
    /// Its redo pointer.
    pub checkpoint_redo: Lsn,
    /// The checkpoint came from a backup label.
    pub used_backup_label: bool,
    /// The primary checkpoint was unreadable and the previous one was used.
    pub used_prev_checkpoint: bool,
    /// Records were replayed (or at least recovery was run).
    pub performed_recovery: bool,
    /// Recovery read from an archive or was asked for by recovery settings.
    pub archive_recovery: bool,
    /// First record replayed.
    pub redo_start: Option<Lsn>,
    /// Where new records will be inserted.
    pub end_of_log: Lsn,
    /// Records replayed in the main pass.
    pub records_replayed: u64,
    /// Timeline new log is written on.
    pub timeline: TimeLineId,
    /// Timeline created at the end of archive recovery.
    pub new_timeline: Option<TimeLineId>,
    /// Point-in-time target that stopped replay.
    pub stop: Option<RecoveryStop>,
    /// Where replay reached a consistent state.
    pub consistent_at: Option<Lsn>,
    /// Why the log scan ended.
    pub end_reason: Option<String>,
    /// Id counters after replay.
    pub next_ids: NextIds,
}

/// Everything startup touches.
pub(crate) struct Startup<'a> {
    pub(crate) dir: &'a DataDir,
    pub(crate) shared: &'a Arc<SharedLogState>,
    pub(crate) inserter: &'a Inserter,
    pub(crate) checkpointer: &'a CheckpointManager,
    pub(crate) collab: &'a Collaborators,
}

/// Where replay reads from and which timeline it follows.
struct Plan {
    recovery: Option<RecoveryConfig>,
    dirs: Vec<PathBuf>,
    history: TimelineHistory,
}

impl Startup<'_> {
    /// Runs startup to completion, leaving the log ready for inserts.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointNotFound`, `InvalidTimeline`, `InvalidState` or
    /// `Replay` when recovery cannot proceed, `Shutdown` if a standby is
    /// told to stop, and I/O errors.
    pub(crate) fn run(&self) -> WalResult<StartupReport> {
        let config = self.shared.config();
        let geometry = *self.shared.geometry();
        let recovery = match &config.recovery {
            Some(rc) => Some(rc.clone()),
            None => RecoveryConfig::load(&self.dir.recovery_conf_path())?,
        };
        self.shared.segments().remove_temp_files()?;

        let ctl = self.shared.control().snapshot();
        let ckpt_tli = ctl.checkpoint_copy.this_timeline;
        let mut dirs = vec![self.dir.xlog_dir()];
        if let Some(archive) = recovery.as_ref().and_then(|r| r.archive_dir.clone()) {
            dirs.push(archive);
        }
        let target_tli = match recovery.as_ref().map(|r| r.target_timeline) {
            None | Some(TargetTimeline::Current) => ckpt_tli,
            Some(TargetTimeline::Latest) => find_newest_timeline(&dirs, ckpt_tli),
            Some(TargetTimeline::Id(tli)) => tli,
        };
        let history = read_history(&dirs, target_tli, &geometry)?;
        if !history.contains(ckpt_tli) {
            return Err(WalError::invalid_timeline(format!(
                "recovery target timeline {target_tli} does not contain checkpoint timeline {ckpt_tli}"
            )));
        }
        if recovery.is_some() {
            info!(target_timeline = target_tli, "starting archive recovery");
        }

        let files = SegmentFileSource::new(
            dirs.clone(),
            Arc::clone(&self.collab.opener),
            geometry,
            history.clone(),
        );
        let plan = Plan {
            recovery,
            dirs,
            history,
        };
        match plan.recovery.as_ref().filter(|r| r.standby_mode) {
            Some(rc) => {
                info!("entering standby mode");
                let source = StandbySource::new(
                    files,
                    self.collab.replication.clone(),
                    Arc::clone(&self.collab.signals),
                    config.standby_wait_timeout,
                    target_tli,
                )
                .with_trigger_file(rc.trigger_file.clone());
                self.recover(WalReader::new(source, geometry), &plan)
            }
            None => self.recover(WalReader::new(files, geometry), &plan),
        }
    }

    fn recover<S: PageSource>(&self, reader: WalReader<S>, plan: &Plan) -> WalResult<StartupReport> {
        let shared = &**self.shared;
        let control = shared.control();
        let mut reader = reader
            .with_system_id(shared.system_identifier())
            .with_history(plan.history.clone());
        let ctl = control.snapshot();
        let archive = plan.recovery.is_some();
        let mut report = StartupReport {
            archive_recovery: archive,
            ..StartupReport::default()
        };

        let label = self.read_backup_label()?;
        let (record, body) = self.locate_checkpoint(&mut reader, &ctl, label.as_ref(), &mut report)?;
        let ckpt = body.checkpoint;
        let ckpt_lsn = record.lsn;
        if ckpt.redo > ckpt_lsn {
            return Err(WalError::invalid_state(format!(
                "invalid redo {} in checkpoint record at {ckpt_lsn}",
                ckpt.redo
            )));
        }
        let redo_before = ckpt.redo < ckpt_lsn;
        if redo_before && record.op() == XLOG_CHECKPOINT_SHUTDOWN {
            return Err(WalError::invalid_state(format!(
                "invalid redo {} in shutdown checkpoint record at {ckpt_lsn}",
                ckpt.redo
            )));
        }
        report.checkpoint = ckpt_lsn;
        report.checkpoint_redo = ckpt.redo;
        info!(
            checkpoint = %ckpt_lsn,
            redo = %ckpt.redo,
            tli = ckpt.this_timeline,
            shutdown = record.op() == XLOG_CHECKPOINT_SHUTDOWN,
            "found checkpoint record"
        );

        let need_recovery =
            redo_before || label.is_some() || ctl.state != DbState::Shutdowned || archive;
        let mut replay = Replay {
            startup: self,
            history: &plan.history,
            archive,
            ids: NextIds::from_checkpoint(&ckpt),
            tli: ckpt.this_timeline,
            min_recovery_point: Lsn::INVALID,
            backup_pending: false,
            consistent_at: None,
        };
        let mut prev_record = ckpt_lsn;
        let mut end_of_log = record.end_lsn;

        if need_recovery {
            report.performed_recovery = true;
            if !archive && ctl.state != DbState::Shutdowned {
                warn!(state = %ctl.state, "database system was not properly shut down; automatic recovery in progress");
            }
            let state = if archive {
                DbState::InArchiveRecovery
            } else {
                DbState::InCrashRecovery
            };
            let updated = control.update(record.end_lsn, |c| {
                c.state = state;
                if c.checkpoint != ckpt_lsn {
                    c.prev_checkpoint = c.checkpoint;
                    c.checkpoint = ckpt_lsn;
                }
                c.checkpoint_copy = ckpt;
                if let Some(label) = &label {
                    c.backup_start_point = label.start;
                    c.backup_end_required = true;
                }
                if archive && c.min_recovery_point < ckpt.redo {
                    c.min_recovery_point = ckpt.redo;
                }
            })?;
            if label.is_some() {
                fs::rename(self.dir.backup_label_path(), self.dir.backup_label_old_path())?;
                sync_directory(self.dir.path())?;
            }
            replay.min_recovery_point = updated.min_recovery_point;
            replay.backup_pending =
                updated.backup_end_required || updated.backup_start_point.is_valid();

            for (_, rmgr) in self.collab.rmgrs.iter() {
                rmgr.startup()?;
            }

            let first = if redo_before {
                let rec = reader.read_record(Some(ckpt.redo))?;
                if rec.is_none() {
                    return Err(WalError::invalid_state(format!(
                        "could not read redo record at {}",
                        ckpt.redo
                    )));
                }
                rec
            } else {
                reader.read_record(None)?
            };
            replay.note_progress(end_of_log);

            let target = plan.recovery.as_ref().map(|r| (r.target, r.target_inclusive));
            let mut next = first;
            if let Some(rec) = &next {
                report.redo_start = Some(rec.lsn);
                info!(lsn = %rec.lsn, "redo starts");
            }
            while let Some(rec) = next {
                if let Some(stop) = target.and_then(|(t, incl)| check_stop(t, incl, &rec)) {
                    if stop.after {
                        replay.apply(&rec)?;
                        report.records_replayed += 1;
                        prev_record = rec.lsn;
                        end_of_log = rec.end_lsn;
                    }
                    info!(stop = %stop, "recovery stopping");
                    report.stop = Some(stop);
                    break;
                }
                replay.apply(&rec)?;
                report.records_replayed += 1;
                prev_record = rec.lsn;
                end_of_log = rec.end_lsn;
                replay.note_progress(end_of_log);
                next = reader.read_record(None)?;
            }
            report.end_reason = reader.end_reason().map(str::to_string);
            info!(
                last = %prev_record,
                records = report.records_replayed,
                "redo done"
            );

            let after = control.snapshot();
            if after.backup_end_required || after.backup_start_point.is_valid() {
                return Err(WalError::invalid_state(
                    "log ends before end of online backup; all log written during the backup must be available",
                ));
            }
            if archive && end_of_log < after.min_recovery_point {
                return Err(WalError::invalid_state(format!(
                    "log ends at {end_of_log}, before consistent recovery point {}",
                    after.min_recovery_point
                )));
            }
            report.consistent_at = replay.consistent_at.or(Some(end_of_log));

            if let Some(start) = report.redo_start {
                self.replay_passes(plan, &replay.current_history()?, start, end_of_log)?;
            }
            for (_, rmgr) in self.collab.rmgrs.iter() {
                rmgr.cleanup()?;
            }
        } else {
            debug!(checkpoint = %ckpt_lsn, "clean shutdown, no recovery needed");
        }

        let ids = replay.ids;
        let final_tli = replay.tli;
        let mut tail_dirs = plan.dirs.clone();
        let mut tail_history = replay.current_history()?;
        if archive {
            let new_tli = find_newest_timeline(&plan.dirs, final_tli.max(plan.history.target())) + 1;
            self.copy_tail_segment(&tail_history, &plan.dirs, new_tli, end_of_log)?;
            write_history(
                shared.segments(),
                &plan.dirs,
                new_tli,
                final_tli,
                end_of_log,
                &stop_reason(report.stop.as_ref()),
            )?;
            let conf = self.dir.recovery_conf_path();
            if conf.exists() {
                fs::rename(&conf, self.dir.recovery_done_path())?;
                sync_directory(self.dir.path())?;
            }
            info!(tli = new_tli, "selected new timeline ID");
            shared.set_timeline(new_tli);
            report.new_timeline = Some(new_tli);
            tail_dirs = vec![self.dir.xlog_dir()];
            tail_history = read_history(&tail_dirs, new_tli, shared.geometry())?;
        } else {
            shared.set_timeline(final_tli);
        }

        let tail = self.read_tail_page(tail_dirs, tail_history, end_of_log)?;
        let redo = control.snapshot().checkpoint_copy.redo;
        self.inserter
            .reset_position(end_of_log, prev_record, redo, tail.as_deref())?;
        shared.set_in_recovery(false);
        self.checkpointer.set_next_ids(ids);

        if need_recovery {
            self.checkpointer.checkpoint(true, true)?;
        } else {
            shared.info.lock().last_checkpoint_end = end_of_log;
        }
        control.update(shared.flush_result(), |c| c.state = DbState::InProduction)?;

        report.end_of_log = end_of_log;
        report.timeline = shared.timeline();
        report.next_ids = ids;
        info!(
            end_of_log = %end_of_log,
            tli = report.timeline,
            "database system is ready"
        );
        Ok(report)
    }

    fn read_backup_label(&self) -> WalResult<Option<BackupLabel>> {
        let path = self.dir.backup_label_path();
        match fs::read_to_string(&path) {
            Ok(text) => parse_backup_label(&text)
                .map(Some)
                .map_err(|e| WalError::invalid_file(path, e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn locate_checkpoint<S: PageSource>(
        &self,
        reader: &mut WalReader<S>,
        ctl: &ControlFileData,
        label: Option<&BackupLabel>,
        report: &mut StartupReport,
    ) -> WalResult<(DecodedRecord, CheckpointRecord)> {
        if let Some(label) = label {
            info!(checkpoint = %label.checkpoint, start = %label.start, "starting from backup label");
            report.used_backup_label = true;
            return read_checkpoint(reader, label.checkpoint)?.ok_or_else(|| {
                WalError::checkpoint_not_found(format!(
                    "checkpoint record at {} named in backup label is missing or invalid",
                    label.checkpoint
                ))
            });
        }
        if let Some(found) = read_checkpoint(reader, ctl.checkpoint)? {
            return Ok(found);
        }
        warn!(lsn = %ctl.checkpoint, "invalid primary checkpoint record");
        if let Some(found) = read_checkpoint(reader, ctl.prev_checkpoint)? {
            warn!(lsn = %ctl.prev_checkpoint, "using previous checkpoint record");
            report.used_prev_checkpoint = true;
            return Ok(found);
        }
        Err(WalError::checkpoint_not_found(format!(
            "primary checkpoint at {} and previous checkpoint at {} are both invalid",
            ctl.checkpoint, ctl.prev_checkpoint
        )))
    }

    /// Shows every replayed record again to resource managers that asked
    /// for a second or third pass.
    fn replay_passes(
        &self,
        plan: &Plan,
        history: &TimelineHistory,
        start: Lsn,
        end: Lsn,
    ) -> WalResult<()> {
        let geometry = *self.shared.geometry();
        for pass in [2u8, 3] {
            let interested: Vec<_> = self
                .collab
                .rmgrs
                .iter()
                .filter(|(_, r)| r.wants_pass(pass))
                .map(|(_, r)| Arc::clone(r))
                .collect();
            if interested.is_empty() {
                continue;
            }
            let source = SegmentFileSource::new(
                plan.dirs.clone(),
                Arc::clone(&self.collab.opener),
                geometry,
                history.clone(),
            );
            let mut reader = WalReader::new(source, geometry)
                .with_system_id(self.shared.system_identifier())
                .with_history(history.clone());
            let mut next = reader.read_record(Some(start))?;
            let mut seen = 0u64;
            while let Some(rec) = next {
                if rec.lsn >= end {
                    break;
                }
                for rmgr in &interested {
                    rmgr.replay_pass(pass, &rec)?;
                }
                seen += 1;
                next = reader.read_record(None)?;
            }
            info!(pass, records = seen, "replay pass complete");
        }
        Ok(())
    }

    /// Starts the new timeline's first segment with the old timeline's log
    /// up to `end`. The rest of the file is zero.
    fn copy_tail_segment(
        &self,
        history: &TimelineHistory,
        dirs: &[PathBuf],
        new_tli: TimeLineId,
        end: Lsn,
    ) -> WalResult<()> {
        let geometry = *self.shared.geometry();
        let seg = geometry.segment_size;
        let offset = end.segment_offset(seg);
        if offset == 0 {
            return Ok(());
        }
        let segno = end.segno(seg);
        let source = SegmentFileSource::new(
            dirs.to_vec(),
            Arc::clone(&self.collab.opener),
            geometry,
            history.clone(),
        );
        let missing = || WalError::invalid_state(format!("log file containing end of log {end} not found"));
        let (_, path) = source.locate(segno).ok_or_else(missing)?;
        let backend = open_read_only(&*self.collab.opener, &path)?.ok_or_else(missing)?;
        let segments = self.shared.segments();
        let prefix = backend
            .read_at(0, offset as usize)
            .map_err(|e| WalError::segment_io("read from", path.display().to_string(), e))?;
        let mut handle = segments.open_for_write(new_tli, segno, false)?;
        handle.write_at(0, &prefix)?;
        handle.sync(self.shared.config().sync_method)?;
        handle.close()?;
        debug!(from = %path.display(), to = %segments.name_of(new_tli, segno), bytes = offset, "copied end of log to new timeline");
        Ok(())
    }

    fn read_tail_page(
        &self,
        dirs: Vec<PathBuf>,
        history: TimelineHistory,
        end: Lsn,
    ) -> WalResult<Option<Vec<u8>>> {
        let geometry = *self.shared.geometry();
        if end.page_offset(geometry.page_size) == 0 {
            return Ok(None);
        }
        let source = SegmentFileSource::new(
            dirs,
            Arc::clone(&self.collab.opener),
            geometry,
            history.clone(),
        );
        let mut reader = WalReader::new(source, geometry)
            .with_system_id(self.shared.system_identifier())
            .with_history(history);
        let page = reader.read_page_image(end.page_start(geometry.page_size))?;
        page.map(Some).ok_or_else(|| {
            WalError::invalid_state(format!("could not read log page containing end of log {end}"))
        })
    }
}

/// Reads the checkpoint record at `lsn`. `None` if it is missing or not a
/// checkpoint.
fn read_checkpoint<S: PageSource>(
    reader: &mut WalReader<S>,
    lsn: Lsn,
) -> WalResult<Option<(DecodedRecord, CheckpointRecord)>> {
    if !lsn.is_valid() {
        return Ok(None);
    }
    let Some(record) = reader.read_record(Some(lsn))? else {
        return Ok(None);
    };
    if record.rmid() != RM_XLOG_ID
        || !matches!(record.op(), XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE)
    {
        warn!(lsn = %lsn, "record is not a checkpoint");
        return Ok(None);
    }
    match CheckpointRecord::decode(&record.data) {
        Some(body) => Ok(Some((record, body))),
        None => {
            warn!(lsn = %lsn, "invalid length of checkpoint record");
            Ok(None)
        }
    }
}

/// State carried through the main redo pass.
struct Replay<'a, 'b> {
    startup: &'a Startup<'b>,
    history: &'a TimelineHistory,
    archive: bool,
    ids: NextIds,
    tli: TimeLineId,
    min_recovery_point: Lsn,
    backup_pending: bool,
    consistent_at: Option<Lsn>,
}

impl Replay<'_, '_> {
    fn apply(&mut self, rec: &DecodedRecord) -> WalResult<()> {
        let collab = self.startup.collab;
        for block in &rec.backup_blocks {
            collab
                .page_store
                .restore_page(block.tag, rec.lsn, &block.restore_page())?;
        }
        let rmid = rec.rmid();
        if rmid == RM_XLOG_ID {
            return self.redo_xlog(rec);
        }
        match collab.rmgrs.get(rmid) {
            Some(rmgr) => rmgr.redo(rec),
            None if rmid == RM_XACT_ID => Ok(()),
            None => Err(WalError::Replay {
                lsn: rec.lsn,
                rmgr: collab.rmgrs.name_of(rmid),
                message: "no resource manager registered".to_string(),
            }),
        }
    }

    fn redo_xlog(&mut self, rec: &DecodedRecord) -> WalResult<()> {
        match rec.op() {
            op @ (XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE) => {
                let body = CheckpointRecord::decode(&rec.data)
                    .ok_or_else(|| WalError::invalid_record(rec.lsn, "invalid checkpoint record body"))?;
                let ckpt = body.checkpoint;
                self.advance_ids(&ckpt, op == XLOG_CHECKPOINT_SHUTDOWN);
                if ckpt.this_timeline != self.tli {
                    if ckpt.this_timeline < self.tli || !self.history.contains(ckpt.this_timeline) {
                        return Err(WalError::invalid_timeline(format!(
                            "unexpected timeline ID {} (after {}) in checkpoint record at {}",
                            ckpt.this_timeline, self.tli, rec.lsn
                        )));
                    }
                    info!(from = self.tli, to = ckpt.this_timeline, "timeline switch during replay");
                    self.tli = ckpt.this_timeline;
                }
                if self.archive {
                    self.startup
                        .checkpointer
                        .restart_point(rec.lsn, rec.end_lsn, &ckpt)?;
                }
            }
            XLOG_NEXTOID => {
                if let Some(oid) = decode_next_oid(&rec.data) {
                    self.ids.next_oid = oid;
                }
            }
            XLOG_BACKUP_END => {
                let start = decode_backup_end(&rec.data)
                    .ok_or_else(|| WalError::invalid_record(rec.lsn, "invalid backup end record body"))?;
                let control = self.startup.shared.control();
                if control.snapshot().backup_start_point == start {
                    let end = rec.end_lsn;
                    control.update(end, |c| {
                        c.backup_start_point = Lsn::INVALID;
                        c.backup_end_required = false;
                        if c.min_recovery_point < end {
                            c.min_recovery_point = end;
                        }
                    })?;
                    info!(start = %start, end = %end, "end of online backup reached");
                    self.backup_pending = false;
                    self.min_recovery_point = self.min_recovery_point.max(end);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn advance_ids(&mut self, ckpt: &CheckPoint, is_shutdown: bool) {
        if is_shutdown {
            self.ids = NextIds::from_checkpoint(ckpt);
            return;
        }
        if (ckpt.next_xid_epoch, ckpt.next_xid) > (self.ids.next_xid_epoch, self.ids.next_xid) {
            self.ids.next_xid_epoch = ckpt.next_xid_epoch;
            self.ids.next_xid = ckpt.next_xid;
        }
    }

    fn note_progress(&mut self, end: Lsn) {
        if self.consistent_at.is_none() && !self.backup_pending && end >= self.min_recovery_point {
            info!(lsn = %end, "consistent recovery state reached");
            self.consistent_at = Some(end);
        }
    }

    /// History of the timeline replay ended on.
    fn current_history(&self) -> WalResult<TimelineHistory> {
        if self.tli == self.history.target() {
            return Ok(self.history.clone());
        }
        let entries: Vec<_> = self
            .history
            .ancestors()
            .iter()
            .filter(|e| e.tli < self.tli)
            .cloned()
            .collect();
        TimelineHistory::new(self.tli, entries)
    }
}
