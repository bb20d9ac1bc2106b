//! # xlog testkit
//!
//! Test utilities for xlog.
//!
//! This crate provides:
//! - Throwaway data directories with a small log geometry
//! - Recording doubles for resource managers, page stores, checkpoint
//!   hooks, change trackers and replication streams
//! - A segment opener that fails syncs or tears writes on demand
//! - Property-based generators for record payloads and page images
//!
//! ## Usage
//!
//! ```rust,ignore
//! use xlog_testkit::prelude::*;
//!
//! let cluster = TestCluster::new();
//! let wal = cluster.open();
//! let end = wal.insert(&RecordRequest::new(TEST_RMGR_ID, TEST_OP_WRITE).data(b"row"))?;
//! wal.flush_through(end)?;
//! cluster.crash(wal);
//!
//! let (collab, rmgr) = recording_collab();
//! let wal = cluster.open_with(collab);
//! assert_eq!(rmgr.payloads(), vec![b"row".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod doubles;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::doubles::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use xlog_core::{
        BackupMethod, Collaborators, Config, DbState, Lsn, PageTag, RecordRequest,
        RecoveryConfig, RecoveryTarget, RmgrRegistry, TargetTimeline, TouchedPage, WalError,
        WalManager,
    };
}

pub use crash::*;
pub use doubles::*;
pub use fixtures::*;
pub use generators::*;
