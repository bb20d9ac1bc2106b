//! Online base backups.
//!
//! A backup is bracketed by [`BackupCoordinator::start_backup`] and
//! [`BackupCoordinator::stop_backup`]. Between the two, full-page images
//! are forced for every first touch of a page after the checkpoint the
//! backup starts from, so torn pages in the file copy are repaired by
//! replay. The label written at start tells recovery where to begin; the
//! `BACKUP_END` record logged at stop tells it when the copy has become
//! consistent.
//!
//! ## Label format
//!
//! ```text
//! START WAL LOCATION: 0/2000020 (file 000000010000000000000002)
//! CHECKPOINT LOCATION: 0/2000058
//! BACKUP METHOD: exclusive
//! START TIME: 1700000000000000
//! LABEL: nightly
//! ```

use crate::checkpoint::CheckpointManager;
use crate::dir::write_file_atomic;
use crate::error::{WalError, WalResult};
use crate::records::{encode_backup_end, RM_XLOG_ID, XLOG_BACKUP_END, XLOG_SWITCH};
use crate::types::{now_timestamp, Lsn, TimeLineId, Timestamp};
use crate::wal::{segment_file_name, Inserter, RecordRequest, SharedLogState};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// How the backup label reaches the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupMethod {
    /// The label is written into the data directory; one at a time.
    Exclusive,
    /// The label is returned to the caller, who ships it with the copy.
    Streamed,
}

impl BackupMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Streamed => "streamed",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "exclusive" => Some(Self::Exclusive),
            "streamed" => Some(Self::Streamed),
            _ => None,
        }
    }
}

/// Contents of a backup label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupLabel {
    /// Redo pointer of the backup's starting checkpoint.
    pub start: Lsn,
    /// The starting checkpoint record.
    pub checkpoint: Lsn,
    /// Segment holding `start`.
    pub start_segment: String,
    /// How the label is delivered.
    pub method: BackupMethod,
    /// When the backup started.
    pub start_time: Timestamp,
    /// Caller-supplied label.
    pub label: String,
}

impl BackupLabel {
    /// Renders the label file.
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "START WAL LOCATION: {} (file {})\nCHECKPOINT LOCATION: {}\nBACKUP METHOD: {}\nSTART TIME: {}\nLABEL: {}\n",
            self.start,
            self.start_segment,
            self.checkpoint,
            self.method.as_str(),
            self.start_time,
            self.label
        )
    }
}

/// Parses a backup label.
///
/// # Errors
///
/// Returns `Backup` if a required line is missing or malformed.
pub fn parse_backup_label(text: &str) -> WalResult<BackupLabel> {
    let mut start = None;
    let mut start_segment = String::new();
    let mut checkpoint = None;
    let mut method = BackupMethod::Exclusive;
    let mut start_time = 0;
    let mut label = String::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key {
            "START WAL LOCATION" => {
                let (lsn, file) = value.split_once(" (file ").unwrap_or((value, ""));
                start = lsn.parse::<Lsn>().ok();
                start_segment = file.trim_end_matches(')').to_string();
            }
            "CHECKPOINT LOCATION" => checkpoint = value.parse::<Lsn>().ok(),
            "BACKUP METHOD" => {
                method = BackupMethod::parse(value)
                    .ok_or_else(|| WalError::backup(format!("invalid backup method \"{value}\"")))?;
            }
            "START TIME" => start_time = value.parse().unwrap_or(0),
            "LABEL" => label = value.to_string(),
            _ => {}
        }
    }
    match (start, checkpoint) {
        (Some(start), Some(checkpoint)) => Ok(BackupLabel {
            start,
            checkpoint,
            start_segment,
            method,
            start_time,
            label,
        }),
        _ => Err(WalError::backup("invalid data in backup label")),
    }
}

/// Result of starting a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupStart {
    /// The label. For an exclusive backup it is also on disk.
    pub label: BackupLabel,
    /// Timeline the backup started on.
    pub timeline: TimeLineId,
}

/// Result of stopping a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupStop {
    /// End of the `BACKUP_END` record; the copy is consistent once replay
    /// reaches it.
    pub stop: Lsn,
    /// Segment holding the stop position.
    pub stop_segment: String,
    /// Backup history file written to the log directory.
    pub history_file: PathBuf,
}

/// Coordinates online backups.
pub struct BackupCoordinator {
    shared: Arc<SharedLogState>,
    inserter: Inserter,
    checkpointer: Arc<CheckpointManager>,
    label_path: PathBuf,
    exclusive: Mutex<()>,
}

impl BackupCoordinator {
    /// Creates a coordinator writing exclusive labels to `label_path`.
    #[must_use]
    pub fn new(
        shared: Arc<SharedLogState>,
        inserter: Inserter,
        checkpointer: Arc<CheckpointManager>,
        label_path: PathBuf,
    ) -> Self {
        Self {
            shared,
            inserter,
            checkpointer,
            label_path,
            exclusive: Mutex::new(()),
        }
    }

    /// Starts a backup: forces full-page writes, finishes the current
    /// segment and takes a checkpoint the copy will be recovered from.
    ///
    /// # Errors
    ///
    /// Returns `Backup` if an exclusive backup is already running,
    /// `InvalidState` during recovery, and log or checkpoint errors.
    pub fn start_backup(&self, label: &str, method: BackupMethod) -> WalResult<BackupStart> {
        if self.shared.in_recovery() {
            return Err(WalError::invalid_state("recovery is in progress"));
        }
        let _exclusive = self.exclusive.lock();
        if method == BackupMethod::Exclusive && self.label_path.exists() {
            return Err(WalError::backup(
                "a backup is already in progress; remove backup_label if no backup is running",
            ));
        }

        self.adjust_sessions(1)?;
        let started = self.begin(label, method);
        if let Err(err) = &started {
            if let Err(undo) = self.adjust_sessions(-1) {
                warn!(error = %err, undo_error = %undo, "could not undo backup session count");
            }
        }
        let started = started?;
        info!(
            start = %started.label.start,
            checkpoint = %started.label.checkpoint,
            method = started.label.method.as_str(),
            "backup started"
        );
        Ok(started)
    }

    fn begin(&self, label: &str, method: BackupMethod) -> WalResult<BackupStart> {
        self.inserter
            .insert(&RecordRequest::new(RM_XLOG_ID, XLOG_SWITCH))?;
        let ckpt = self.checkpointer.checkpoint(false, true)?;
        let geometry = self.shared.geometry;
        let timeline = self.shared.timeline();
        let label = BackupLabel {
            start: ckpt.redo,
            checkpoint: ckpt.lsn,
            start_segment: segment_file_name(
                timeline,
                ckpt.redo.segno(geometry.segment_size),
                &geometry,
            ),
            method,
            start_time: now_timestamp(),
            label: label.to_string(),
        };
        if method == BackupMethod::Exclusive {
            write_file_atomic(&self.label_path, label.to_text().as_bytes())?;
        }
        Ok(BackupStart { label, timeline })
    }

    /// Stops a backup. An exclusive backup's label is read from and removed
    /// from the data directory; a streamed backup passes its label back.
    ///
    /// # Errors
    ///
    /// Returns `Backup` if no backup is running or the label is invalid.
    pub fn stop_backup(&self, method: BackupMethod, label_text: Option<&str>) -> WalResult<BackupStop> {
        if self.shared.in_recovery() {
            return Err(WalError::invalid_state("recovery is in progress"));
        }
        let _exclusive = self.exclusive.lock();
        let label = match method {
            BackupMethod::Exclusive => {
                let text = match fs::read_to_string(&self.label_path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(WalError::backup("an exclusive backup is not in progress"));
                    }
                    Err(e) => return Err(e.into()),
                };
                parse_backup_label(&text)?
            }
            BackupMethod::Streamed => {
                let text = label_text
                    .ok_or_else(|| WalError::backup("a streamed backup needs its label to stop"))?;
                parse_backup_label(text)?
            }
        };
        self.adjust_sessions(-1)?;
        if method == BackupMethod::Exclusive {
            if let Err(err) = fs::remove_file(&self.label_path) {
                self.adjust_sessions(1)?;
                return Err(err.into());
            }
        }

        let body = encode_backup_end(label.start);
        let ended = self
            .inserter
            .insert_record(&RecordRequest::new(RM_XLOG_ID, XLOG_BACKUP_END).data(&body))?;
        self.inserter
            .insert(&RecordRequest::new(RM_XLOG_ID, XLOG_SWITCH))?;

        let geometry = self.shared.geometry;
        let timeline = self.shared.timeline();
        let seg = geometry.segment_size;
        let stop = ended.end_lsn;
        let stop_segment = segment_file_name(timeline, stop.segno(seg), &geometry);
        let start_segment = segment_file_name(timeline, label.start.segno(seg), &geometry);
        let history_name = format!(
            "{start_segment}.{:08X}.backup",
            label.start.segment_offset(seg)
        );
        let history_file = self.shared.segments.path().join(&history_name);
        let text = format!(
            "{}STOP WAL LOCATION: {} (file {})\nSTOP TIME: {}\n",
            label.to_text(),
            stop,
            stop_segment,
            now_timestamp()
        );
        write_file_atomic(&history_file, text.as_bytes())?;
        if self.shared.segments.archive_enabled() {
            self.shared.segments.mark_ready(&history_name)?;
        }
        info!(start = %label.start, stop = %stop, "backup stopped");
        Ok(BackupStop {
            stop,
            stop_segment,
            history_file,
        })
    }

    fn adjust_sessions(&self, delta: i32) -> WalResult<()> {
        let mut ins = self.shared.insert.lock();
        if delta < 0 {
            if ins.backup_sessions == 0 {
                return Err(WalError::backup("a backup is not in progress"));
            }
            ins.backup_sessions -= 1;
        } else {
            ins.backup_sessions += 1;
        }
        self.shared.publish_force(&ins);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_text_parses_back() {
        let label = BackupLabel {
            start: Lsn::new(0x0200_0020),
            checkpoint: Lsn::new(0x0200_0058),
            start_segment: "000000010000000000000002".to_string(),
            method: BackupMethod::Streamed,
            start_time: 1_700_000_000_000_000,
            label: "nightly run".to_string(),
        };
        let text = label.to_text();
        assert!(text.starts_with("START WAL LOCATION: 0/2000020 (file 000000010000000000000002)\n"));
        assert_eq!(parse_backup_label(&text).unwrap(), label);
    }

    #[test]
    fn label_without_checkpoint_is_rejected() {
        let err = parse_backup_label("START WAL LOCATION: 0/20 (file x)\n").unwrap_err();
        assert!(matches!(err, WalError::Backup { .. }));
        let err = parse_backup_label(
            "START WAL LOCATION: 0/20 (file x)\nCHECKPOINT LOCATION: 0/40\nBACKUP METHOD: tape\n",
        )
        .unwrap_err();
        assert!(matches!(err, WalError::Backup { .. }));
    }
}
