//! Core type definitions shared by every component.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Alignment applied to every record start and end.
pub const MAXALIGN: u64 = 8;

/// Rounds `len` up to the record alignment.
#[must_use]
pub const fn maxalign(len: u64) -> u64 {
    (len + MAXALIGN - 1) & !(MAXALIGN - 1)
}

/// A log sequence number: the byte position of a point in the log.
///
/// LSNs are totally ordered and only ever increase. The high 32 bits are
/// the logical log file id and the low 32 bits the offset within it, which
/// is how they are printed (`X/X`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid LSN. No record ever starts here.
    pub const INVALID: Lsn = Lsn(0);

    /// Creates an LSN from a raw byte position.
    #[must_use]
    pub const fn new(pos: u64) -> Self {
        Self(pos)
    }

    /// Creates an LSN from its (log id, offset) parts.
    #[must_use]
    pub const fn from_parts(log_id: u32, rec_off: u32) -> Self {
        Self(((log_id as u64) << 32) | rec_off as u64)
    }

    /// Returns the raw byte position.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true unless this is [`Lsn::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// High 32 bits.
    #[must_use]
    pub const fn log_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits.
    #[must_use]
    pub const fn rec_off(self) -> u32 {
        self.0 as u32
    }

    /// Returns the segment number containing this position.
    #[must_use]
    pub const fn segno(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    /// Returns the byte offset within the containing segment.
    #[must_use]
    pub const fn segment_offset(self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }

    /// Returns the byte offset within the containing page.
    #[must_use]
    pub const fn page_offset(self, page_size: u64) -> u64 {
        self.0 % page_size
    }

    /// Returns the start of the page containing this position.
    #[must_use]
    pub const fn page_start(self, page_size: u64) -> Lsn {
        Lsn(self.0 - self.0 % page_size)
    }

    /// Returns this position advanced by `bytes`.
    #[must_use]
    pub const fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }

    /// Returns this position rounded up to the record alignment.
    #[must_use]
    pub const fn align(self) -> Lsn {
        Lsn(maxalign(self.0))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.log_id(), self.rec_off())
    }
}

/// Error returned when parsing an `X/X` LSN fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN \"{}\"", self.0)
    }
}

impl std::error::Error for ParseLsnError {}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseLsnError(s.to_string());
        let (hi, lo) = s.trim().split_once('/').ok_or_else(err)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| err())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| err())?;
        Ok(Lsn::from_parts(hi, lo))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of one continuous history of the log.
pub type TimeLineId = u32;

/// Transaction identifier.
pub type TransactionId = u32;

/// Object identifier.
pub type Oid = u32;

/// Multi-transaction identifier.
pub type MultiXactId = u32;

/// Offset into multi-transaction member storage.
pub type MultiXactOffset = u32;

/// Resource manager identifier stored in every record header.
pub type RmgrId = u8;

/// Block number within a relation.
pub type BlockNumber = u32;

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// The invalid transaction id.
pub const INVALID_XID: TransactionId = 0;

/// First transaction id handed out to normal transactions.
pub const FIRST_NORMAL_XID: TransactionId = 3;

/// First object id handed out after bootstrap.
pub const FIRST_BOOTSTRAP_OID: Oid = 10000;

/// Physical identity of a relation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RelFileNode {
    /// Tablespace.
    pub spc_node: Oid,
    /// Database.
    pub db_node: Oid,
    /// Relation.
    pub rel_node: Oid,
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// Identity of one data page: relation file plus block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PageTag {
    /// Relation file.
    pub rel: RelFileNode,
    /// Block within the relation.
    pub block: BlockNumber,
}

impl PageTag {
    /// Creates a page tag.
    #[must_use]
    pub const fn new(rel: RelFileNode, block: BlockNumber) -> Self {
        Self { rel, block }
    }
}

impl fmt::Display for PageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blk {}", self.rel, self.block)
    }
}

/// Result of one attempt of a retrying operation.
///
/// Loops that may need to start over (record insertion when the redo
/// pointer moves, standby reads when a source fails) return this from each
/// attempt instead of jumping back.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// Conditions changed under the attempt; run it again.
    Retry,
    /// The attempt completed.
    Done(T),
    /// The attempt failed and must not be retried.
    Fatal(E),
}

/// Returns the current time in microseconds since the Unix epoch.
#[must_use]
pub fn now_timestamp() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_display_and_parse() {
        let lsn = Lsn::from_parts(0x1A, 0x0200_0028);
        assert_eq!(lsn.to_string(), "1A/2000028");
        assert_eq!("1A/2000028".parse::<Lsn>().unwrap(), lsn);
        assert!("nonsense".parse::<Lsn>().is_err());
    }

    #[test]
    fn lsn_ordering_follows_position() {
        let a = Lsn::from_parts(0, 0xFFFF_FFF8);
        let b = Lsn::from_parts(1, 0);
        assert!(a < b);
        assert_eq!(a.add(8), b);
    }

    #[test]
    fn segment_and_page_math() {
        let seg = 16 * 1024 * 1024;
        let lsn = Lsn::new(3 * seg + 8192 + 40);
        assert_eq!(lsn.segno(seg), 3);
        assert_eq!(lsn.segment_offset(seg), 8192 + 40);
        assert_eq!(lsn.page_offset(8192), 40);
        assert_eq!(lsn.page_start(8192), Lsn::new(3 * seg + 8192));
    }

    #[test]
    fn alignment() {
        assert_eq!(maxalign(0), 0);
        assert_eq!(maxalign(1), 8);
        assert_eq!(maxalign(8), 8);
        assert_eq!(Lsn::new(33).align(), Lsn::new(40));
    }
}
