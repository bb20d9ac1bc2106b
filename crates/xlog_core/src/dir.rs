//! Data directory management.
//!
//! This module handles the file system layout used by the WAL manager:
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK                    # Advisory lock for single-owner access
//! ├─ global/pg_control       # Control file
//! ├─ pg_xlog/                # Segment files and timeline history files
//! │  └─ archive_status/      # .ready / .done archiver handshake markers
//! ├─ backup_label            # Present while an exclusive backup runs
//! └─ recovery.conf           # Present to request archive recovery
//! ```
//!
//! The LOCK file ensures only one process manages the log at a time.

use crate::error::{WalError, WalResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const GLOBAL_DIR: &str = "global";
const CONTROL_FILE: &str = "pg_control";
const XLOG_DIR: &str = "pg_xlog";
const ARCHIVE_STATUS_DIR: &str = "archive_status";
const BACKUP_LABEL_FILE: &str = "backup_label";
const BACKUP_LABEL_OLD: &str = "backup_label.old";
const RECOVERY_CONF: &str = "recovery.conf";
const RECOVERY_DONE: &str = "recovery.done";

/// Manages the data directory structure and file locking.
///
/// # Thread Safety
///
/// A locking `DataDir` holds an exclusive lock on the directory. Only one
/// such instance can exist per directory at a time. Read-only inspection
/// (the operator CLI) opens the directory without taking the lock.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: Option<File>,
}

impl DataDir {
    /// Opens a data directory and takes its exclusive lock.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the data directory
    /// * `create_if_missing` - If true, creates the directory if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> WalResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(WalError::invalid_state(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(WalError::invalid_state(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(WalError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: Some(lock_file),
        })
    }

    /// Opens a data directory for inspection without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not an existing directory.
    pub fn open_unlocked(path: &Path) -> WalResult<Self> {
        if !path.is_dir() {
            return Err(WalError::invalid_state(format!(
                "data directory does not exist: {}",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: None,
        })
    }

    /// Creates the subdirectories of a fresh data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn create_layout(&self) -> WalResult<()> {
        fs::create_dir_all(self.global_dir())?;
        fs::create_dir_all(self.archive_status_dir())?;
        sync_directory(&self.path)?;
        Ok(())
    }

    /// Returns the path to the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the directory holding the control file.
    #[must_use]
    pub fn global_dir(&self) -> PathBuf {
        self.path.join(GLOBAL_DIR)
    }

    /// Returns the path to the control file.
    #[must_use]
    pub fn control_path(&self) -> PathBuf {
        self.global_dir().join(CONTROL_FILE)
    }

    /// Returns the segment directory.
    #[must_use]
    pub fn xlog_dir(&self) -> PathBuf {
        self.path.join(XLOG_DIR)
    }

    /// Returns the archive status marker directory.
    #[must_use]
    pub fn archive_status_dir(&self) -> PathBuf {
        self.xlog_dir().join(ARCHIVE_STATUS_DIR)
    }

    /// Returns the path of the exclusive backup label.
    #[must_use]
    pub fn backup_label_path(&self) -> PathBuf {
        self.path.join(BACKUP_LABEL_FILE)
    }

    /// Returns where a consumed backup label is moved to.
    #[must_use]
    pub fn backup_label_old_path(&self) -> PathBuf {
        self.path.join(BACKUP_LABEL_OLD)
    }

    /// Returns the path of the recovery request file.
    #[must_use]
    pub fn recovery_conf_path(&self) -> PathBuf {
        self.path.join(RECOVERY_CONF)
    }

    /// Returns where the recovery request file is moved once recovery ends.
    #[must_use]
    pub fn recovery_done_path(&self) -> PathBuf {
        self.path.join(RECOVERY_DONE)
    }

    /// Returns true if no control file exists yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.control_path().exists()
    }
}

/// Writes `data` to `path` atomically.
///
/// Uses write-then-rename for crash safety:
/// 1. Write to a temporary file next to the target
/// 2. Sync the temporary file to disk
/// 3. Rename it over the target
/// 4. Fsync the directory so the rename is durable
///
/// # Errors
///
/// Returns an error if any step fails.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> WalResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| WalError::invalid_file(path, "path has no parent directory"))?;
    let mut temp_name = path
        .file_name()
        .ok_or_else(|| WalError::invalid_file(path, "path has no file name"))?
        .to_os_string();
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    sync_directory(parent)?;
    Ok(())
}

/// Syncs a directory so that entries created, renamed or removed in it are
/// durable.
///
/// On Windows, directory fsync is not supported in the same way as Unix;
/// NTFS journaling covers metadata durability, so the call is skipped.
///
/// # Errors
///
/// Returns an error if the directory cannot be opened or synced.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> WalResult<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

/// Syncs a directory (no-op on this platform).
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> WalResult<()> {
    Ok(())
}
