//! Error types for the WAL manager.

use crate::types::Lsn;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// How far an error is allowed to propagate.
///
/// `Error` is surfaced to the caller. `Fatal` ends the current process or
/// backend. `Panic` means a caller broke a structural invariant; it must
/// never be tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Recoverable, or the expected end of the log during replay.
    Error,
    /// Unrecoverable for the current process.
    Fatal,
    /// Programming error or corrupted shared state.
    Panic,
}

/// Errors that can occur in WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] xlog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O failure on one segment file.
    #[error("could not {op} log file {segment}: {source}")]
    SegmentIo {
        /// What was being attempted ("write", "fsync", ...).
        op: &'static str,
        /// Segment file name.
        segment: String,
        /// Underlying failure.
        #[source]
        source: xlog_storage::StorageError,
    },

    /// A record failed structural validation.
    #[error("invalid record at {lsn}: {message}")]
    InvalidRecord {
        /// Where the record starts.
        lsn: Lsn,
        /// What was wrong.
        message: String,
    },

    /// A page header failed validation.
    #[error("invalid page header at {lsn} in log file {segment}: {message}")]
    InvalidPageHeader {
        /// Start of the page.
        lsn: Lsn,
        /// Segment file name.
        segment: String,
        /// What was wrong.
        message: String,
    },

    /// Record CRC does not match its contents.
    #[error("incorrect resource manager data checksum in record at {lsn}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Where the record starts.
        lsn: Lsn,
        /// CRC stored in the record.
        expected: u32,
        /// CRC computed from the contents.
        actual: u32,
    },

    /// The data directory was written by an incompatible build.
    #[error("database files are incompatible with this build: {message}; you need to reinitialize the data directory")]
    Incompatible {
        /// Which token mismatched.
        message: String,
    },

    /// The control file could not be decoded.
    #[error("control file is corrupt: {message}")]
    ControlFileCorrupt {
        /// What was wrong.
        message: String,
    },

    /// A caller violated a structural rule of the record format.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },

    /// A flush did not reach the requested position.
    #[error("xlog flush request {requested} is not satisfied --- flushed only to {flushed}")]
    FlushShortfall {
        /// Requested durability point.
        requested: Lsn,
        /// Position actually flushed.
        flushed: Lsn,
    },

    /// No usable checkpoint record could be found.
    #[error("could not locate a valid checkpoint record: {message}")]
    CheckpointNotFound {
        /// Details including the LSNs tried.
        message: String,
    },

    /// The control file claims more progress than the log has on disk.
    #[error("control file checkpoint {checkpoint} is ahead of flushed log position {flushed}")]
    ControlAheadOfLog {
        /// Checkpoint recorded in the control file.
        checkpoint: Lsn,
        /// Durable log position.
        flushed: Lsn,
    },

    /// Shutdown was requested while waiting.
    #[error("terminating due to shutdown request")]
    Shutdown,

    /// Timeline history is inconsistent or unusable.
    #[error("timeline error: {message}")]
    InvalidTimeline {
        /// What was wrong.
        message: String,
    },

    /// Online backup bookkeeping failed.
    #[error("backup error: {message}")]
    Backup {
        /// What was wrong.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the operation is not allowed.
        message: String,
    },

    /// A resource manager failed to replay a record.
    #[error("redo of {rmgr} record at {lsn} failed: {message}")]
    Replay {
        /// Where the record starts.
        lsn: Lsn,
        /// Resource manager name.
        rmgr: String,
        /// What went wrong.
        message: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// A file in the data directory could not be parsed.
    #[error("invalid data in file \"{}\": {message}", path.display())]
    InvalidFile {
        /// Offending file.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// Data directory is locked by another process.
    #[error("data directory locked: another process has exclusive access")]
    DatabaseLocked,

    /// An earlier failure inside a critical section left shared log state
    /// unusable; the directory must be reopened.
    #[error("log manager stopped after a failure in a critical section")]
    Stopped,
}

impl WalError {
    /// Creates an invalid record error.
    pub fn invalid_record(lsn: Lsn, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            lsn,
            message: message.into(),
        }
    }

    /// Creates an invalid page header error.
    pub fn invalid_page_header(
        lsn: Lsn,
        segment: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidPageHeader {
            lsn,
            segment: segment.into(),
            message: message.into(),
        }
    }

    /// Creates a segment I/O error.
    pub fn segment_io(
        op: &'static str,
        segment: impl Into<String>,
        source: xlog_storage::StorageError,
    ) -> Self {
        Self::SegmentIo {
            op,
            segment: segment.into(),
            source,
        }
    }

    /// Creates an incompatibility error.
    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::Incompatible {
            message: message.into(),
        }
    }

    /// Creates a control file corruption error.
    pub fn control_corrupt(message: impl Into<String>) -> Self {
        Self::ControlFileCorrupt {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a checkpoint-not-found error.
    pub fn checkpoint_not_found(message: impl Into<String>) -> Self {
        Self::CheckpointNotFound {
            message: message.into(),
        }
    }

    /// Creates a timeline error.
    pub fn invalid_timeline(message: impl Into<String>) -> Self {
        Self::InvalidTimeline {
            message: message.into(),
        }
    }

    /// Creates a backup error.
    pub fn backup(message: impl Into<String>) -> Self {
        Self::Backup {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid file error.
    pub fn invalid_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns how far this error may propagate.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidRecord { .. }
            | Self::InvalidPageHeader { .. }
            | Self::ChecksumMismatch { .. }
            | Self::FlushShortfall { .. }
            | Self::Backup { .. }
            | Self::InvalidState { .. }
            | Self::Config { .. } => Severity::Error,
            Self::Storage(_)
            | Self::Io(_)
            | Self::SegmentIo { .. }
            | Self::Incompatible { .. }
            | Self::ControlFileCorrupt { .. }
            | Self::CheckpointNotFound { .. }
            | Self::Shutdown
            | Self::InvalidTimeline { .. }
            | Self::Replay { .. }
            | Self::InvalidFile { .. }
            | Self::DatabaseLocked => Severity::Fatal,
            Self::InvalidRequest { .. } | Self::ControlAheadOfLog { .. } | Self::Stopped => {
                Severity::Panic
            }
        }
    }

    /// Returns true for validation failures that mark the end of valid log
    /// rather than a failure of the process.
    #[must_use]
    pub fn is_end_of_log(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecord { .. } | Self::InvalidPageHeader { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_follow_taxonomy() {
        assert_eq!(
            WalError::invalid_record(Lsn::new(8), "bad").severity(),
            Severity::Error
        );
        assert_eq!(
            WalError::incompatible("page size").severity(),
            Severity::Fatal
        );
        assert_eq!(
            WalError::invalid_request("too many backup blocks").severity(),
            Severity::Panic
        );
        let shortfall = WalError::FlushShortfall {
            requested: Lsn::new(100),
            flushed: Lsn::new(50),
        };
        assert_eq!(shortfall.severity(), Severity::Error);
        assert_eq!(WalError::Stopped.severity(), Severity::Panic);
    }

    #[test]
    fn messages_carry_positions() {
        let err = WalError::invalid_page_header(
            Lsn::from_parts(0, 0x2000),
            "000000010000000000000001",
            "invalid magic number",
        );
        let text = err.to_string();
        assert!(text.contains("0/2000"));
        assert!(text.contains("000000010000000000000001"));
    }

    #[test]
    fn incompatible_mentions_reinitialize() {
        let err = WalError::incompatible("page size mismatch");
        assert!(err.to_string().contains("reinitialize the data directory"));
    }

    #[test]
    fn end_of_log_classification() {
        assert!(WalError::invalid_record(Lsn::new(8), "zero length").is_end_of_log());
        assert!(!WalError::Shutdown.is_end_of_log());
    }
}
