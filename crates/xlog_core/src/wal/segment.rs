//! Segment files: naming, lifecycle and the `pg_xlog` directory.
//!
//! A segment is created zero-filled under a temporary name, installed under
//! its final name with a hard link (never replacing a file a peer already
//! installed), opened for writing, closed, and finally recycled into a
//! future segment or deleted once any required archive copy is confirmed.

use crate::config::{Config, Geometry, SyncMethod};
use crate::error::{WalError, WalResult};
use crate::types::TimeLineId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use xlog_storage::{SegmentOpener, StorageBackend, StorageResult};

const TEMP_PREFIX: &str = "xlogtemp.";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns the file name of segment `segno` on timeline `tli`.
#[must_use]
pub fn segment_file_name(tli: TimeLineId, segno: u64, geometry: &Geometry) -> String {
    let per_log = geometry.segments_per_log();
    format!("{tli:08X}{:08X}{:08X}", segno / per_log, segno % per_log)
}

/// Parses a segment file name into its timeline and segment number.
#[must_use]
pub fn parse_segment_file_name(name: &str, geometry: &Geometry) -> Option<(TimeLineId, u64)> {
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    if seg >= geometry.segments_per_log() {
        return None;
    }
    Some((tli, log * geometry.segments_per_log() + seg))
}

/// Lifecycle state of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Nothing on disk yet.
    Unopened,
    /// Zero-filled under a temporary name.
    CreatedTemp,
    /// Present under its final name.
    Installed,
    /// Open for writing.
    OpenForWrite,
    /// Written and closed.
    Closed,
    /// Renamed to a future segment.
    Recycled,
    /// Removed.
    Deleted,
}

impl SegmentState {
    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub fn can_advance_to(self, next: SegmentState) -> bool {
        use SegmentState::{Closed, CreatedTemp, Deleted, Installed, OpenForWrite, Recycled, Unopened};
        matches!(
            (self, next),
            (Unopened, CreatedTemp | Installed)
                | (CreatedTemp, Installed | Deleted)
                | (Installed, OpenForWrite | Recycled | Deleted)
                | (OpenForWrite, Closed)
                | (Closed, OpenForWrite | Recycled | Deleted)
        )
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transition outside the lifecycle.
    pub fn advance(self, next: SegmentState) -> WalResult<SegmentState> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(WalError::invalid_state(format!(
                "segment cannot move from {self:?} to {next:?}"
            )))
        }
    }
}

/// An open segment file.
///
/// The underlying file is closed when the handle is dropped.
pub struct SegmentHandle {
    tli: TimeLineId,
    segno: u64,
    name: String,
    backend: Box<dyn StorageBackend>,
    state: SegmentState,
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SegmentHandle {
    /// Timeline of the file.
    #[must_use]
    pub fn tli(&self) -> TimeLineId {
        self.tli
    }

    /// Segment number.
    #[must_use]
    pub fn segno(&self) -> u64 {
        self.segno
    }

    /// File name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Writes `data` at `offset` within the segment.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` on failure.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> WalResult<()> {
        if self.state != SegmentState::OpenForWrite {
            return Err(WalError::invalid_state(format!(
                "log file {} is not open for writing",
                self.name
            )));
        }
        self.backend
            .write_at(offset, data)
            .map_err(|e| WalError::segment_io("write to", self.name.clone(), e))
    }

    /// Makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` on failure.
    pub fn sync(&mut self, method: SyncMethod) -> WalResult<()> {
        let result = match method {
            SyncMethod::Disabled => return Ok(()),
            SyncMethod::Fsync => self.backend.flush().and_then(|()| self.backend.sync()),
            SyncMethod::Fdatasync => self.backend.flush().and_then(|()| self.backend.sync_data()),
        };
        result.map_err(|e| WalError::segment_io("fsync", self.name.clone(), e))
    }

    /// Closes the file.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` if buffered data cannot be handed to the OS.
    pub fn close(mut self) -> WalResult<()> {
        self.state = self.state.advance(SegmentState::Closed)?;
        self.backend
            .flush()
            .map_err(|e| WalError::segment_io("close", self.name.clone(), e))?;
        debug!(segment = %self.name, "closed log file");
        Ok(())
    }
}

/// Counts of what a retention pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    /// Segments renamed to future segment numbers.
    pub recycled: usize,
    /// Segments removed.
    pub removed: usize,
}

/// The directory holding segment files and archive status markers.
pub struct SegmentDir {
    dir: PathBuf,
    status_dir: PathBuf,
    opener: Arc<dyn SegmentOpener>,
    geometry: Geometry,
    archive_mode: bool,
    max_advance: u64,
}

impl SegmentDir {
    /// Creates a view of `dir` (normally `pg_xlog`).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, opener: Arc<dyn SegmentOpener>, config: &Config) -> Self {
        let dir = dir.into();
        let status_dir = dir.join("archive_status");
        Self {
            dir,
            status_dir,
            opener,
            geometry: config.geometry(),
            archive_mode: config.archive_mode,
            max_advance: 2 * u64::from(config.checkpoint_segments) + 1,
        }
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Geometry used for names and sizes.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Returns true if completed files are handed to an archiver.
    #[must_use]
    pub fn archive_enabled(&self) -> bool {
        self.archive_mode
    }

    /// The opener used for segment files.
    #[must_use]
    pub fn opener(&self) -> &Arc<dyn SegmentOpener> {
        &self.opener
    }

    /// File name of a segment.
    #[must_use]
    pub fn name_of(&self, tli: TimeLineId, segno: u64) -> String {
        segment_file_name(tli, segno, &self.geometry)
    }

    /// Path of a segment.
    #[must_use]
    pub fn path_of(&self, tli: TimeLineId, segno: u64) -> PathBuf {
        self.dir.join(self.name_of(tli, segno))
    }

    /// Returns true if the segment exists under its final name.
    #[must_use]
    pub fn exists(&self, tli: TimeLineId, segno: u64) -> bool {
        self.path_of(tli, segno).exists()
    }

    /// Opens a segment for writing, creating it first if needed.
    ///
    /// With `use_existing` an already installed file is reused as is.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` or `Io` on failure.
    pub fn open_for_write(
        &self,
        tli: TimeLineId,
        segno: u64,
        use_existing: bool,
    ) -> WalResult<SegmentHandle> {
        let state = self.ensure_segment(tli, segno, use_existing)?;
        let name = self.name_of(tli, segno);
        let backend = self
            .opener
            .open(&self.path_of(tli, segno))
            .map_err(|e| WalError::segment_io("open", name.clone(), e))?;
        Ok(SegmentHandle {
            tli,
            segno,
            name,
            backend,
            state: state.advance(SegmentState::OpenForWrite)?,
        })
    }

    /// Opens a segment for reading. Returns `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` if the file exists but cannot be opened.
    pub fn open_for_read(
        &self,
        tli: TimeLineId,
        segno: u64,
    ) -> WalResult<Option<Box<dyn StorageBackend>>> {
        open_read_only(&*self.opener, &self.path_of(tli, segno))
    }

    /// Creates a segment ahead of need. Returns true if a file was created.
    ///
    /// # Errors
    ///
    /// Returns `SegmentIo` or `Io` on failure.
    pub fn preallocate(&self, tli: TimeLineId, segno: u64) -> WalResult<bool> {
        if self.exists(tli, segno) {
            return Ok(false);
        }
        self.ensure_segment(tli, segno, true)?;
        info!(segment = %self.name_of(tli, segno), "preallocated log file");
        Ok(true)
    }

    fn ensure_segment(&self, tli: TimeLineId, segno: u64, use_existing: bool) -> WalResult<SegmentState> {
        let state = SegmentState::Unopened;
        if use_existing && self.exists(tli, segno) {
            return state.advance(SegmentState::Installed);
        }

        let tmp = self.create_zero_filled()?;
        let state = state.advance(SegmentState::CreatedTemp)?;

        // A file installed by a peer in the meantime is left alone; ours
        // becomes a future segment instead.
        match self.install(&tmp, tli, segno, true)? {
            Some(installed) if installed == segno => {
                debug!(segment = %self.name_of(tli, segno), "installed new log file");
            }
            Some(installed) => {
                debug!(
                    segment = %self.name_of(tli, installed),
                    "log file already present, installed new file as future segment"
                );
            }
            None => {
                debug!(segment = %self.name_of(tli, segno), "no free slot, discarded new log file");
            }
        }
        state.advance(SegmentState::Installed)
    }

    fn create_zero_filled(&self) -> WalResult<PathBuf> {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!("{TEMP_PREFIX}{}.{seq}", std::process::id()));
        remove_if_exists(&tmp)?;

        let name = tmp.display().to_string();
        let mut backend = self
            .opener
            .create(&tmp)
            .map_err(|e| WalError::segment_io("create", name.clone(), e))?;
        let result = zero_fill(&mut *backend, &self.geometry);
        drop(backend);
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(WalError::segment_io("zero-fill", name, e));
        }
        Ok(tmp)
    }

    /// Installs `tmp` as segment `segno`, or with `find_free` as the first
    /// free segment number up to the advance limit. An existing file is
    /// never replaced. Returns the segment number used, or `None` if `tmp`
    /// was discarded.
    pub(crate) fn install(
        &self,
        tmp: &Path,
        tli: TimeLineId,
        segno: u64,
        find_free: bool,
    ) -> WalResult<Option<u64>> {
        let limit = segno + self.max_advance;
        let mut target = segno;
        while self.exists(tli, target) {
            if !find_free || target >= limit {
                fs::remove_file(tmp)?;
                return Ok(None);
            }
            target += 1;
        }
        let path = self.path_of(tli, target);
        match fs::hard_link(tmp, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                fs::remove_file(tmp)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(tmp)?;
        Ok(Some(target))
    }

    /// Removes leftover temporary files from an earlier run.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be read.
    pub fn remove_temp_files(&self) -> WalResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }

    /// Recycles or removes every segment older than `cutoff`, on any
    /// timeline, whose archive copy is confirmed. Recycled files become
    /// future segments of `tli` after `current`.
    ///
    /// # Errors
    ///
    /// Returns `Io` on failure.
    pub fn remove_old_segments(
        &self,
        tli: TimeLineId,
        cutoff: u64,
        current: u64,
    ) -> WalResult<RetentionStats> {
        let mut stats = RetentionStats::default();
        let mut entries: Vec<(String, u64)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some((_, segno)) = parse_segment_file_name(&name, &self.geometry) {
                if segno < cutoff {
                    entries.push((name, segno));
                }
            }
        }
        entries.sort();

        for (name, _) in entries {
            if !self.archive_done(&name)? {
                continue;
            }
            let path = self.dir.join(&name);
            let state = SegmentState::Closed;
            let recycled = self.install(&path, tli, current + 1, true);
            match recycled {
                Ok(Some(segno)) => {
                    state.advance(SegmentState::Recycled)?;
                    debug!(segment = %name, into = %self.name_of(tli, segno), "recycled log file");
                    stats.recycled += 1;
                }
                Ok(None) => {
                    state.advance(SegmentState::Deleted)?;
                    debug!(segment = %name, "removed log file");
                    stats.removed += 1;
                }
                Err(e) => {
                    warn!(segment = %name, error = %e, "could not recycle log file");
                    remove_if_exists(&path)?;
                    stats.removed += 1;
                }
            }
            self.clear_status(&name)?;
        }
        if stats.recycled + stats.removed > 0 {
            info!(
                recycled = stats.recycled,
                removed = stats.removed,
                cutoff = %self.name_of(tli, cutoff),
                "removed old log files"
            );
        }
        Ok(stats)
    }

    fn status_path(&self, name: &str, suffix: &str) -> PathBuf {
        self.status_dir.join(format!("{name}.{suffix}"))
    }

    /// Marks a completed file as ready for the archiver.
    ///
    /// # Errors
    ///
    /// Returns `Io` on failure.
    pub fn mark_ready(&self, name: &str) -> WalResult<()> {
        fs::create_dir_all(&self.status_dir)?;
        fs::File::create(self.status_path(name, "ready"))?;
        debug!(file = %name, "marked ready for archiving");
        Ok(())
    }

    /// Records that the archiver has copied a file.
    ///
    /// # Errors
    ///
    /// Returns `Io` on failure.
    pub fn mark_done(&self, name: &str) -> WalResult<()> {
        fs::create_dir_all(&self.status_dir)?;
        remove_if_exists(&self.status_path(name, "ready"))?;
        fs::File::create(self.status_path(name, "done"))?;
        Ok(())
    }

    /// Returns true if `name` may be removed: archiving is off or the
    /// archiver has confirmed its copy. A file with no status marker at
    /// all is marked ready so it is not lost.
    ///
    /// # Errors
    ///
    /// Returns `Io` on failure.
    pub fn archive_done(&self, name: &str) -> WalResult<bool> {
        if !self.archive_mode || self.status_path(name, "done").exists() {
            return Ok(true);
        }
        if !self.status_path(name, "ready").exists() {
            self.mark_ready(name)?;
        }
        Ok(false)
    }

    fn clear_status(&self, name: &str) -> WalResult<()> {
        remove_if_exists(&self.status_path(name, "done"))?;
        remove_if_exists(&self.status_path(name, "ready"))
    }
}

fn zero_fill(backend: &mut dyn StorageBackend, geometry: &Geometry) -> StorageResult<()> {
    let zeros = vec![0u8; geometry.page_size as usize];
    let mut written = 0;
    while written < geometry.segment_size {
        backend.append(&zeros)?;
        written += geometry.page_size;
    }
    backend.flush()?;
    backend.sync()
}

/// Opens an existing file read-only through `opener`; `None` if missing.
pub(crate) fn open_read_only(
    opener: &dyn SegmentOpener,
    path: &Path,
) -> WalResult<Option<Box<dyn StorageBackend>>> {
    if !path.exists() {
        return Ok(None);
    }
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    opener
        .open(path)
        .map(Some)
        .map_err(|e| WalError::segment_io("open", name, e))
}

pub(crate) fn remove_if_exists(path: &Path) -> WalResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
