//! Timeline history files.
//!
//! A timeline other than 1 has a history file `%08X.history` listing its
//! ancestors, oldest first, one per line:
//!
//! ```text
//! parent_tli <TAB> last segment of parent <TAB> switch LSN <TAB> reason
//! ```
//!
//! The switch LSN is where the child forked off; older files carry only the
//! segment name, in which case the fork is taken to be the end of that
//! segment.

use crate::config::Geometry;
use crate::dir::write_file_atomic;
use crate::error::{WalError, WalResult};
use crate::types::{Lsn, TimeLineId};
use crate::wal::segment::{parse_segment_file_name, SegmentDir};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the history file for `tli`.
#[must_use]
pub fn history_file_name(tli: TimeLineId) -> String {
    format!("{tli:08X}.history")
}

/// One ancestor in a history file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Ancestor timeline.
    pub tli: TimeLineId,
    /// First position that does not belong to the ancestor.
    pub switch_point: Lsn,
    /// Why the child was created.
    pub reason: String,
}

/// Parses history file text.
///
/// # Errors
///
/// Returns `InvalidTimeline` for malformed lines or ancestors that are not
/// in increasing order.
pub fn parse_history(text: &str, geometry: &Geometry) -> WalResult<Vec<HistoryEntry>> {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = |what: &str| {
            WalError::invalid_timeline(format!("syntax error in history file line {}: {what}", lineno + 1))
        };
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(bad("expected a timeline ID and a segment name"));
        }
        let tli: TimeLineId = fields[0].parse().map_err(|_| bad("invalid timeline ID"))?;
        let (_, segno) = parse_segment_file_name(fields[1], geometry)
            .ok_or_else(|| bad("invalid segment name"))?;

        let mut reason_at = 2;
        let switch_point = match fields.get(2).map(|f| f.parse::<Lsn>()) {
            Some(Ok(lsn)) => {
                reason_at = 3;
                lsn
            }
            _ => Lsn::new((segno + 1) * geometry.segment_size),
        };
        let reason = fields.get(reason_at..).map(|r| r.join("\t")).unwrap_or_default();

        if let Some(last) = entries.last() {
            if tli <= last.tli {
                return Err(WalError::invalid_timeline(format!(
                    "timeline IDs must be in increasing sequence, found {tli} after {}",
                    last.tli
                )));
            }
        }
        entries.push(HistoryEntry {
            tli,
            switch_point,
            reason,
        });
    }
    Ok(entries)
}

/// The timelines a target timeline descends from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistory {
    target: TimeLineId,
    ancestors: Vec<HistoryEntry>,
}

impl TimelineHistory {
    /// History of a timeline with no ancestors.
    #[must_use]
    pub fn root(target: TimeLineId) -> Self {
        Self {
            target,
            ancestors: Vec::new(),
        }
    }

    /// Builds a history from parsed ancestors.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimeline` if an ancestor is not older than `target`.
    pub fn new(target: TimeLineId, ancestors: Vec<HistoryEntry>) -> WalResult<Self> {
        if let Some(bad) = ancestors.iter().find(|e| e.tli >= target) {
            return Err(WalError::invalid_timeline(format!(
                "invalid data in history file for timeline {target}: ancestor {} is not older",
                bad.tli
            )));
        }
        Ok(Self { target, ancestors })
    }

    /// The timeline being followed.
    #[must_use]
    pub fn target(&self) -> TimeLineId {
        self.target
    }

    /// Ancestors, oldest first.
    #[must_use]
    pub fn ancestors(&self) -> &[HistoryEntry] {
        &self.ancestors
    }

    /// Every timeline in the chain, newest first.
    #[must_use]
    pub fn expected_tlis(&self) -> Vec<TimeLineId> {
        std::iter::once(self.target)
            .chain(self.ancestors.iter().rev().map(|e| e.tli))
            .collect()
    }

    /// Returns true if `tli` is the target or one of its ancestors.
    #[must_use]
    pub fn contains(&self, tli: TimeLineId) -> bool {
        tli == self.target || self.ancestors.iter().any(|e| e.tli == tli)
    }

    /// Where `tli` stops being part of this history: the switch point for
    /// an ancestor, `None` for the target or an unrelated timeline.
    #[must_use]
    pub fn end_of(&self, tli: TimeLineId) -> Option<Lsn> {
        self.ancestors
            .iter()
            .find(|e| e.tli == tli)
            .map(|e| e.switch_point)
    }

    /// Returns true if a page at `page_addr` stamped with `tli` belongs to
    /// this history.
    #[must_use]
    pub fn accepts_page(&self, tli: TimeLineId, page_addr: Lsn) -> bool {
        if tli == self.target {
            return true;
        }
        self.end_of(tli).is_some_and(|end| page_addr < end)
    }
}

fn find_history(dirs: &[PathBuf], tli: TimeLineId) -> Option<PathBuf> {
    let name = history_file_name(tli);
    dirs.iter().map(|d| d.join(&name)).find(|p| p.exists())
}

/// Returns true if a history file for `tli` exists in any of `dirs`.
#[must_use]
pub fn exists_history(dirs: &[PathBuf], tli: TimeLineId) -> bool {
    find_history(dirs, tli).is_some()
}

/// Reads the history of `tli` from the first of `dirs` holding its file.
/// Timeline 1, or any timeline without a file, has no ancestors.
///
/// # Errors
///
/// Returns `Io` or `InvalidTimeline`.
pub fn read_history(dirs: &[PathBuf], tli: TimeLineId, geometry: &Geometry) -> WalResult<TimelineHistory> {
    if tli == 1 {
        return Ok(TimelineHistory::root(tli));
    }
    let Some(path) = find_history(dirs, tli) else {
        return Ok(TimelineHistory::root(tli));
    };
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TimelineHistory::root(tli)),
        Err(e) => return Err(e.into()),
    };
    let ancestors = parse_history(&text, geometry)?;
    debug!(tli, ancestors = ancestors.len(), "read timeline history");
    TimelineHistory::new(tli, ancestors)
}

/// Finds the newest timeline that descends from `start` by probing for
/// history files with successive ids.
#[must_use]
pub fn find_newest_timeline(dirs: &[PathBuf], start: TimeLineId) -> TimeLineId {
    let mut newest = start;
    let mut probe = start + 1;
    while exists_history(dirs, probe) {
        newest = probe;
        probe += 1;
    }
    newest
}

/// Writes the history file of `new_tli`, branched off `parent` at
/// `switch_point`. The parent's own ancestors are copied in front.
///
/// # Errors
///
/// Returns `InvalidTimeline` if the file already exists, or I/O errors.
pub fn write_history(
    segments: &SegmentDir,
    search: &[PathBuf],
    new_tli: TimeLineId,
    parent: TimeLineId,
    switch_point: Lsn,
    reason: &str,
) -> WalResult<PathBuf> {
    let geometry = *segments.geometry();
    let path = segments.path().join(history_file_name(new_tli));
    if path.exists() {
        return Err(WalError::invalid_timeline(format!(
            "history file for timeline {new_tli} already exists"
        )));
    }

    let mut text = String::new();
    if parent != 1 {
        if let Some(src) = find_history(search, parent) {
            let existing = fs::read_to_string(&src)?;
            text.push_str(&existing);
            if !existing.is_empty() && !existing.ends_with('\n') {
                text.push('\n');
            }
        }
    }
    // A fork at a segment boundary belongs to the segment before it.
    let last_segno = switch_point.as_u64().saturating_sub(1) / geometry.segment_size;
    text.push_str(&format!(
        "{parent}\t{}\t{switch_point}\t{reason}\n",
        segments.name_of(parent, last_segno)
    ));

    write_file_atomic(&path, text.as_bytes())?;
    if segments.archive_enabled() {
        segments.mark_ready(&history_file_name(new_tli))?;
    }
    info!(tli = new_tli, parent, switch = %switch_point, "wrote timeline history file");
    Ok(path)
}

/// Reads and parses a history file at an explicit path.
///
/// # Errors
///
/// Returns `Io` or `InvalidTimeline`.
pub fn read_history_file(path: &Path, geometry: &Geometry) -> WalResult<Vec<HistoryEntry>> {
    parse_history(&fs::read_to_string(path)?, geometry)
}
