//! The write-ahead log proper: record format, pages, segments, and the
//! insert, write and read paths.
//!
//! ## Layout
//!
//! The log is a sequence of fixed-size pages grouped into segment files.
//! Every page starts with a short header; the first page of a segment has
//! a long header carrying the system identifier and sizes. Records are
//! 8-byte aligned and may continue across pages, in which case the next
//! page starts with a continuation header.
//!
//! ```text
//! | page header | record | record | rec.. | page header | cont | ..ord | record |
//! ```
//!
//! ## Invariants
//!
//! - Positions only move forward: insert ≥ write ≥ flush.
//! - A record's `prev` field points at the record before it.
//! - A record is never acknowledged as durable before it is flushed.
//! - A page carries the timeline it was written on; timelines never
//!   decrease within a segment.

mod buffer;
mod insert;
pub mod page;
mod reader;
pub mod record;
pub mod segment;
mod shared;
mod writer;

pub use insert::{Inserted, Inserter};
pub use page::{LongHeader, PageHeader};
pub use reader::{PageSource, SegmentFileSource, WalReader};
pub use record::{
    compute_record_crc, BackupBlock, DecodedRecord, Hole, RecordHeader, RecordRequest,
    TouchedPage,
};
pub use segment::{
    parse_segment_file_name, segment_file_name, RetentionStats, SegmentDir, SegmentHandle,
    SegmentState,
};
pub use shared::SharedLogState;
pub use writer::WalWriter;
