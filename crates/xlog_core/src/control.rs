//! Control file store.
//!
//! The control file (`global/pg_control`) is the root of all durable
//! metadata: where the latest checkpoint is, the state the cluster was left
//! in, and the compatibility tokens of the build that created it. It is a
//! fixed-size file protected by a CRC and read at every start.
//!
//! ## File Format
//!
//! ```text
//! | fields (little endian) | crc32 (4) | zero padding to 8192 bytes |
//! ```

use crate::codec::{get_fixed_str, put_fixed_str, ByteReader};
use crate::config::Config;
use crate::dir::write_file_atomic;
use crate::error::{WalError, WalResult};
use crate::records::{CheckPoint, CHECKPOINT_SIZE};
use crate::types::{now_timestamp, Lsn, Timestamp, MAXALIGN};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Size of the control file on disk.
pub const CONTROL_FILE_SIZE: usize = 8192;

/// Version of the control file layout.
pub const CONTROL_VERSION: u32 = 843;

/// Version of the catalog contents the control file describes.
pub const CATALOG_VERSION: u32 = 2024_0601;

/// Width of each locale name field.
pub const LOCALE_NAME_LEN: usize = 64;

/// Maximum identifier length the build was compiled with.
pub const NAME_DATA_LEN: u32 = 64;

/// Maximum index keys the build was compiled with.
pub const INDEX_MAX_KEYS: u32 = 32;

/// Known value used to detect an incompatible floating point format.
pub const FLOAT_FORMAT: f64 = 1_234_567.0;

const ENCODED_LEN: usize = 8 + 4 + 4 + 4 + 8 + 4 + 4 + 8 + 8 + CHECKPOINT_SIZE + 8 + 8 + 1
    + 4 + 8 + 4 * 6 + 1 + LOCALE_NAME_LEN * 2;

/// State the cluster was left in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DbState {
    /// Bootstrapping or starting up.
    Startup,
    /// Cleanly shut down.
    Shutdowned,
    /// Shut down while in recovery.
    ShutdownedInRecovery,
    /// Shutdown in progress.
    Shutdowning,
    /// Replaying after a crash.
    InCrashRecovery,
    /// Replaying archived or streamed log.
    InArchiveRecovery,
    /// Normal operation.
    InProduction,
}

impl DbState {
    fn to_u32(self) -> u32 {
        match self {
            Self::Startup => 0,
            Self::Shutdowned => 1,
            Self::ShutdownedInRecovery => 2,
            Self::Shutdowning => 3,
            Self::InCrashRecovery => 4,
            Self::InArchiveRecovery => 5,
            Self::InProduction => 6,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Startup,
            1 => Self::Shutdowned,
            2 => Self::ShutdownedInRecovery,
            3 => Self::Shutdowning,
            4 => Self::InCrashRecovery,
            5 => Self::InArchiveRecovery,
            6 => Self::InProduction,
            _ => return None,
        })
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Startup => "starting up",
            Self::Shutdowned => "shut down",
            Self::ShutdownedInRecovery => "shut down in recovery",
            Self::Shutdowning => "shutting down",
            Self::InCrashRecovery => "in crash recovery",
            Self::InArchiveRecovery => "in archive recovery",
            Self::InProduction => "in production",
        };
        f.write_str(text)
    }
}

/// Build properties that must match between the control file and the
/// running binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compatibility {
    /// Record alignment.
    pub max_align: u32,
    /// [`FLOAT_FORMAT`] as stored by the creating build.
    pub float_format: f64,
    /// Data page size.
    pub data_page_size: u32,
    /// Relation segment size in blocks.
    pub relseg_size: u32,
    /// WAL page size.
    pub wal_page_size: u32,
    /// Segment file size.
    pub segment_size: u32,
    /// Maximum identifier length.
    pub name_data_len: u32,
    /// Maximum index keys.
    pub index_max_keys: u32,
    /// Whether timestamps are stored as integers.
    pub integer_datetimes: bool,
    /// Collation locale.
    pub lc_collate: String,
    /// Character classification locale.
    pub lc_ctype: String,
}

impl Compatibility {
    /// Returns the tokens of this build under `config`.
    #[must_use]
    pub fn for_config(config: &Config) -> Self {
        Self {
            max_align: MAXALIGN as u32,
            float_format: FLOAT_FORMAT,
            data_page_size: config.data_page_size,
            relseg_size: config.relseg_size,
            wal_page_size: config.wal_page_size,
            segment_size: config.segment_size,
            name_data_len: NAME_DATA_LEN,
            index_max_keys: INDEX_MAX_KEYS,
            integer_datetimes: true,
            lc_collate: config.locale.clone(),
            lc_ctype: config.locale.clone(),
        }
    }

    /// Compares stored tokens against the running build.
    ///
    /// # Errors
    ///
    /// Returns `WalError::Incompatible` naming the first mismatch.
    pub fn check(&self, expected: &Self) -> WalResult<()> {
        fn mismatch(what: &str, stored: impl fmt::Display, built: impl fmt::Display) -> WalError {
            WalError::incompatible(format!(
                "the database cluster was initialized with {what} {stored}, but this build uses {built}"
            ))
        }

        if self.max_align != expected.max_align {
            return Err(mismatch("MAXALIGN", self.max_align, expected.max_align));
        }
        if self.float_format != expected.float_format {
            return Err(WalError::incompatible(
                "the database cluster appears to use a different floating-point number format",
            ));
        }
        if self.data_page_size != expected.data_page_size {
            return Err(mismatch("BLCKSZ", self.data_page_size, expected.data_page_size));
        }
        if self.relseg_size != expected.relseg_size {
            return Err(mismatch("RELSEG_SIZE", self.relseg_size, expected.relseg_size));
        }
        if self.wal_page_size != expected.wal_page_size {
            return Err(mismatch("XLOG_BLCKSZ", self.wal_page_size, expected.wal_page_size));
        }
        if self.segment_size != expected.segment_size {
            return Err(mismatch("XLOG_SEG_SIZE", self.segment_size, expected.segment_size));
        }
        if self.name_data_len != expected.name_data_len {
            return Err(mismatch("NAMEDATALEN", self.name_data_len, expected.name_data_len));
        }
        if self.index_max_keys != expected.index_max_keys {
            return Err(mismatch("INDEX_MAX_KEYS", self.index_max_keys, expected.index_max_keys));
        }
        if self.integer_datetimes != expected.integer_datetimes {
            return Err(mismatch(
                "integer datetimes",
                self.integer_datetimes,
                expected.integer_datetimes,
            ));
        }
        if self.lc_collate != expected.lc_collate {
            return Err(mismatch("LC_COLLATE", &self.lc_collate, &expected.lc_collate));
        }
        if self.lc_ctype != expected.lc_ctype {
            return Err(mismatch("LC_CTYPE", &self.lc_ctype, &expected.lc_ctype));
        }
        Ok(())
    }
}

/// Contents of the control file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlFileData {
    /// Unique identifier of this cluster; stamped into every segment.
    pub system_identifier: u64,
    /// Layout version.
    pub control_version: u32,
    /// Catalog version.
    pub catalog_version: u32,
    /// State the cluster was left in.
    pub state: DbState,
    /// Time of the last update.
    pub time: Timestamp,
    /// Log id of the newest segment the writer has opened.
    pub log_id: u32,
    /// Segment within `log_id` of the newest segment the writer has opened.
    pub log_seg: u32,
    /// Location of the latest checkpoint record.
    pub checkpoint: Lsn,
    /// Location of the checkpoint before it.
    pub prev_checkpoint: Lsn,
    /// Copy of the latest checkpoint.
    pub checkpoint_copy: CheckPoint,
    /// Replay must reach this point before the cluster is consistent.
    pub min_recovery_point: Lsn,
    /// Start of the online backup being restored, until its end is replayed.
    pub backup_start_point: Lsn,
    /// Whether recovery must replay a backup end record before it may stop.
    pub backup_end_required: bool,
    /// Build compatibility tokens.
    pub compat: Compatibility,
}

impl ControlFileData {
    /// Creates control data for a fresh cluster.
    #[must_use]
    pub fn new(system_identifier: u64, compat: Compatibility) -> Self {
        Self {
            system_identifier,
            control_version: CONTROL_VERSION,
            catalog_version: CATALOG_VERSION,
            state: DbState::Startup,
            time: now_timestamp(),
            log_id: 0,
            log_seg: 0,
            checkpoint: Lsn::INVALID,
            prev_checkpoint: Lsn::INVALID,
            checkpoint_copy: CheckPoint::default(),
            min_recovery_point: Lsn::INVALID,
            backup_start_point: Lsn::INVALID,
            backup_end_required: false,
            compat,
        }
    }

    /// Encodes the full fixed-size file image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTROL_FILE_SIZE);
        out.extend_from_slice(&self.system_identifier.to_le_bytes());
        out.extend_from_slice(&self.control_version.to_le_bytes());
        out.extend_from_slice(&self.catalog_version.to_le_bytes());
        out.extend_from_slice(&self.state.to_u32().to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.log_id.to_le_bytes());
        out.extend_from_slice(&self.log_seg.to_le_bytes());
        out.extend_from_slice(&self.checkpoint.as_u64().to_le_bytes());
        out.extend_from_slice(&self.prev_checkpoint.as_u64().to_le_bytes());
        self.checkpoint_copy.encode_into(&mut out);
        out.extend_from_slice(&self.min_recovery_point.as_u64().to_le_bytes());
        out.extend_from_slice(&self.backup_start_point.as_u64().to_le_bytes());
        out.push(u8::from(self.backup_end_required));

        let c = &self.compat;
        out.extend_from_slice(&c.max_align.to_le_bytes());
        out.extend_from_slice(&c.float_format.to_le_bytes());
        out.extend_from_slice(&c.data_page_size.to_le_bytes());
        out.extend_from_slice(&c.relseg_size.to_le_bytes());
        out.extend_from_slice(&c.wal_page_size.to_le_bytes());
        out.extend_from_slice(&c.segment_size.to_le_bytes());
        out.extend_from_slice(&c.name_data_len.to_le_bytes());
        out.extend_from_slice(&c.index_max_keys.to_le_bytes());
        out.push(u8::from(c.integer_datetimes));
        put_fixed_str(&mut out, &c.lc_collate, LOCALE_NAME_LEN);
        put_fixed_str(&mut out, &c.lc_ctype, LOCALE_NAME_LEN);
        debug_assert_eq!(out.len(), ENCODED_LEN);

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out.resize(CONTROL_FILE_SIZE, 0);
        out
    }

    /// Decodes a file image, checking its size, layout version and CRC.
    ///
    /// Compatibility tokens are decoded but not compared; see
    /// [`Compatibility::check`].
    ///
    /// # Errors
    ///
    /// Returns `Incompatible` for a different layout version and
    /// `ControlFileCorrupt` for size or checksum failures.
    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() != CONTROL_FILE_SIZE {
            return Err(WalError::control_corrupt(format!(
                "control file is {} bytes, expected {CONTROL_FILE_SIZE}",
                bytes.len()
            )));
        }

        let corrupt = || WalError::control_corrupt("truncated control data");
        let mut r = ByteReader::new(bytes);
        let system_identifier = r.u64().ok_or_else(corrupt)?;
        let control_version = r.u32().ok_or_else(corrupt)?;
        if control_version != CONTROL_VERSION {
            return Err(WalError::incompatible(format!(
                "the database cluster was initialized with control version {control_version}, but this build uses {CONTROL_VERSION}"
            )));
        }

        let stored_crc = u32::from_le_bytes(
            bytes[ENCODED_LEN..ENCODED_LEN + 4]
                .try_into()
                .map_err(|_| corrupt())?,
        );
        let actual_crc = crc32fast::hash(&bytes[..ENCODED_LEN]);
        if stored_crc != actual_crc {
            return Err(WalError::control_corrupt(format!(
                "incorrect checksum in control file: expected {stored_crc:08x}, got {actual_crc:08x}"
            )));
        }

        let catalog_version = r.u32().ok_or_else(corrupt)?;
        let state = DbState::from_u32(r.u32().ok_or_else(corrupt)?)
            .ok_or_else(|| WalError::control_corrupt("invalid cluster state"))?;
        let time = r.i64().ok_or_else(corrupt)?;
        let log_id = r.u32().ok_or_else(corrupt)?;
        let log_seg = r.u32().ok_or_else(corrupt)?;
        let checkpoint = Lsn::new(r.u64().ok_or_else(corrupt)?);
        let prev_checkpoint = Lsn::new(r.u64().ok_or_else(corrupt)?);
        let checkpoint_copy = CheckPoint::decode_from(&mut r).ok_or_else(corrupt)?;
        let min_recovery_point = Lsn::new(r.u64().ok_or_else(corrupt)?);
        let backup_start_point = Lsn::new(r.u64().ok_or_else(corrupt)?);
        let backup_end_required = r.u8().ok_or_else(corrupt)? != 0;

        let compat = Compatibility {
            max_align: r.u32().ok_or_else(corrupt)?,
            float_format: r.f64().ok_or_else(corrupt)?,
            data_page_size: r.u32().ok_or_else(corrupt)?,
            relseg_size: r.u32().ok_or_else(corrupt)?,
            wal_page_size: r.u32().ok_or_else(corrupt)?,
            segment_size: r.u32().ok_or_else(corrupt)?,
            name_data_len: r.u32().ok_or_else(corrupt)?,
            index_max_keys: r.u32().ok_or_else(corrupt)?,
            integer_datetimes: r.u8().ok_or_else(corrupt)? != 0,
            lc_collate: get_fixed_str(r.bytes(LOCALE_NAME_LEN).ok_or_else(corrupt)?),
            lc_ctype: get_fixed_str(r.bytes(LOCALE_NAME_LEN).ok_or_else(corrupt)?),
        };

        Ok(Self {
            system_identifier,
            control_version,
            catalog_version,
            state,
            time,
            log_id,
            log_seg,
            checkpoint,
            prev_checkpoint,
            checkpoint_copy,
            min_recovery_point,
            backup_start_point,
            backup_end_required,
            compat,
        })
    }
}

/// Detects changes to the checkpoint pointers of a control file and checks
/// that a new checkpoint is already covered by durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWatcher {
    checkpoint: Lsn,
    prev_checkpoint: Lsn,
}

impl ControlWatcher {
    /// Starts watching from `data`.
    #[must_use]
    pub fn new(data: &ControlFileData) -> Self {
        Self {
            checkpoint: data.checkpoint,
            prev_checkpoint: data.prev_checkpoint,
        }
    }

    /// Records `data`; returns true if its checkpoint pointers moved.
    ///
    /// # Errors
    ///
    /// Returns `ControlAheadOfLog` if the pointers moved to a checkpoint
    /// that does not start below `flushed`.
    pub fn observe(&mut self, data: &ControlFileData, flushed: Lsn) -> WalResult<bool> {
        if data.checkpoint == self.checkpoint && data.prev_checkpoint == self.prev_checkpoint {
            return Ok(false);
        }
        if data.checkpoint.is_valid() && data.checkpoint >= flushed {
            error!(checkpoint = %data.checkpoint, flushed = %flushed, "control file ahead of log");
            return Err(WalError::ControlAheadOfLog {
                checkpoint: data.checkpoint,
                flushed,
            });
        }
        self.checkpoint = data.checkpoint;
        self.prev_checkpoint = data.prev_checkpoint;
        Ok(true)
    }

    /// Re-reads the control file at `path` and observes it, catching
    /// changes made by anything other than this process's store.
    ///
    /// # Errors
    ///
    /// Returns read or decode errors, or `ControlAheadOfLog`.
    pub fn check_file(&mut self, path: &Path, flushed: Lsn) -> WalResult<bool> {
        let data = ControlFileStore::read(path)?;
        self.observe(&data, flushed)
    }
}

/// Owns the control file: the in-memory copy and its durable image.
#[derive(Debug)]
pub struct ControlFileStore {
    path: PathBuf,
    data: Mutex<ControlFileData>,
    watcher: Mutex<ControlWatcher>,
}

impl ControlFileStore {
    /// Writes a new control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create(path: &Path, data: ControlFileData) -> WalResult<Self> {
        write_file_atomic(path, &data.encode())?;
        debug!(path = %path.display(), "created control file");
        Ok(Self {
            path: path.to_path_buf(),
            watcher: Mutex::new(ControlWatcher::new(&data)),
            data: Mutex::new(data),
        })
    }

    /// Loads and validates the control file against the running build.
    ///
    /// # Errors
    ///
    /// Returns `ControlFileCorrupt` or `Incompatible` on validation failure.
    pub fn load(path: &Path, expected: &Compatibility) -> WalResult<Self> {
        let data = Self::read(path)?;
        if data.catalog_version != CATALOG_VERSION {
            return Err(WalError::incompatible(format!(
                "the database cluster was initialized with catalog version {}, but this build uses {CATALOG_VERSION}",
                data.catalog_version
            )));
        }
        data.compat.check(expected)?;
        Ok(Self {
            path: path.to_path_buf(),
            watcher: Mutex::new(ControlWatcher::new(&data)),
            data: Mutex::new(data),
        })
    }

    /// Reads and decodes a control file without comparing build tokens.
    ///
    /// # Errors
    ///
    /// Returns I/O or decode errors.
    pub fn read(path: &Path) -> WalResult<ControlFileData> {
        let bytes = std::fs::read(path)?;
        ControlFileData::decode(&bytes)
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> ControlFileData {
        self.data.lock().clone()
    }

    /// Applies `f` to the contents and rewrites the file.
    ///
    /// `flushed` is the durable log position; a checkpoint pointer moving
    /// to or beyond it is refused.
    ///
    /// # Errors
    ///
    /// Returns `ControlAheadOfLog` or write errors. The in-memory copy is
    /// left unchanged on error.
    pub fn update<F>(&self, flushed: Lsn, f: F) -> WalResult<ControlFileData>
    where
        F: FnOnce(&mut ControlFileData),
    {
        let mut data = self.data.lock();
        let mut next = data.clone();
        f(&mut next);
        next.time = now_timestamp();

        let mut watcher = self.watcher.lock();
        let mut candidate = *watcher;
        candidate.observe(&next, flushed)?;

        write_file_atomic(&self.path, &next.encode())?;
        *watcher = candidate;
        *data = next.clone();
        Ok(next)
    }

    /// Returns a watcher seeded with the current checkpoint pointers.
    #[must_use]
    pub fn watch(&self) -> ControlWatcher {
        ControlWatcher::new(&self.data.lock())
    }
}
