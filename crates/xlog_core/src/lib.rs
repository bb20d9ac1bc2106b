//! # xlog core
//!
//! Write-ahead log manager for a relational storage engine.
//!
//! This crate provides:
//! - Record insertion into a shared ring of log pages, with full-page
//!   images for pages first touched after a checkpoint
//! - Writing and flushing of the ring to fixed-size segment files
//! - Checkpoints, restart points and segment retention
//! - Crash recovery, archive recovery to a point in time, timelines and
//!   standby replay
//! - The control file and online base backups
//!
//! ## Example
//!
//! ```rust,ignore
//! use xlog_core::{Collaborators, Config, RecordRequest, WalManager};
//!
//! WalManager::bootstrap(path, &Config::default())?;
//! let wal = WalManager::open(path, Config::default(), Collaborators::new())?;
//! let end = wal.insert(&RecordRequest::new(16, 0x10).xid(742).data(b"tuple"))?;
//! wal.flush_through(end)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod checkpoint;
mod codec;
pub mod config;
pub mod control;
pub mod critical;
pub mod dir;
pub mod error;
mod manager;
pub mod records;
pub mod recovery;
pub mod rmgr;
pub mod timeline;
pub mod types;
pub mod wal;

pub use backup::{parse_backup_label, BackupLabel, BackupMethod, BackupStart, BackupStop};
pub use checkpoint::{CheckpointHooks, CheckpointManager, CheckpointOutcome, DefaultHooks, NextIds};
pub use config::{Config, Geometry, RecoveryConfig, RecoveryTarget, SyncMethod, TargetTimeline};
pub use control::{ControlFileData, ControlFileStore, DbState};
pub use error::{Severity, WalError, WalResult};
pub use manager::{Collaborators, LogPositions, WalManager};
pub use recovery::{RecoverySignals, RecoveryStop, ReplicationStream, StartupReport};
pub use rmgr::{ChangeTracker, NullPageStore, PageStore, ResourceManager, RmgrRegistry, TrackedRecord};
pub use types::{Lsn, PageTag, RelFileNode, TimeLineId, TransactionId};
pub use wal::{DecodedRecord, Inserted, RecordRequest, TouchedPage, WalReader};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
