//! # xlog storage
//!
//! Positional byte-store backends for xlog segment files.
//!
//! This crate provides the lowest-level storage abstraction used by the WAL
//! manager. Storage backends are **opaque byte stores** - they do not
//! interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, write at offset, append, sync)
//! - No knowledge of WAL pages, records or segment naming
//! - Must be `Send + Sync` for concurrent access
//! - The WAL manager owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! Segment files are opened through a [`SegmentOpener`], which lets tests
//! substitute a backend that fails or tears writes on demand.
//!
//! ## Example
//!
//! ```rust
//! use xlog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(&[0u8; 16]).unwrap();
//! backend.write_at(4, b"wal!").unwrap();
//! let data = backend.read_at(4, 4).unwrap();
//! assert_eq!(&data, b"wal!");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod opener;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use opener::{FileOpener, SegmentOpener};
