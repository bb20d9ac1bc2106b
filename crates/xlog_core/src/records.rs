//! Payloads of the records the WAL manager writes itself.
//!
//! Two resource managers are built in. `XLOG` records (checkpoints, segment
//! switches, backup ends) are replayed by the recovery engine. `XACT`
//! commit and abort records carry the timestamps that point-in-time
//! recovery targets are compared against.

use crate::codec::ByteReader;
use crate::types::{
    Lsn, MultiXactId, MultiXactOffset, Oid, TimeLineId, Timestamp, TransactionId,
};
use serde::Serialize;

/// Resource manager id of the log itself.
pub const RM_XLOG_ID: u8 = 0;
/// Resource manager id of transaction commit/abort records.
pub const RM_XACT_ID: u8 = 1;
/// Highest valid resource manager id.
pub const RM_MAX_ID: u8 = 31;

/// Shutdown checkpoint.
pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
/// Online checkpoint.
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
/// No-op record.
pub const XLOG_NOOP: u8 = 0x20;
/// Next object id advance.
pub const XLOG_NEXTOID: u8 = 0x30;
/// Segment switch: the rest of the segment is unused.
pub const XLOG_SWITCH: u8 = 0x40;
/// End of an online backup.
pub const XLOG_BACKUP_END: u8 = 0x50;

/// Transaction commit.
pub const XACT_COMMIT: u8 = 0x00;
/// Transaction abort.
pub const XACT_ABORT: u8 = 0x20;

/// Encoded size of a [`CheckPoint`].
pub const CHECKPOINT_SIZE: usize = 40;

const PREPARED_ENTRY_SIZE: usize = 12;

/// State captured by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CheckPoint {
    /// Where replay must start to reach this checkpoint's state.
    pub redo: Lsn,
    /// Timeline the checkpoint was written on.
    pub this_timeline: TimeLineId,
    /// Epoch of the next transaction id.
    pub next_xid_epoch: u32,
    /// Next transaction id.
    pub next_xid: TransactionId,
    /// Next object id.
    pub next_oid: Oid,
    /// Next multi-transaction id.
    pub next_multi: MultiXactId,
    /// Next multi-transaction member offset.
    pub next_multi_offset: MultiXactOffset,
    /// Time the checkpoint was taken.
    pub time: Timestamp,
}

impl CheckPoint {
    /// Appends the fixed encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.redo.as_u64().to_le_bytes());
        out.extend_from_slice(&self.this_timeline.to_le_bytes());
        out.extend_from_slice(&self.next_xid_epoch.to_le_bytes());
        out.extend_from_slice(&self.next_xid.to_le_bytes());
        out.extend_from_slice(&self.next_oid.to_le_bytes());
        out.extend_from_slice(&self.next_multi.to_le_bytes());
        out.extend_from_slice(&self.next_multi_offset.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
    }

    pub(crate) fn decode_from(r: &mut ByteReader<'_>) -> Option<Self> {
        Some(Self {
            redo: Lsn::new(r.u64()?),
            this_timeline: r.u32()?,
            next_xid_epoch: r.u32()?,
            next_xid: r.u32()?,
            next_oid: r.u32()?,
            next_multi: r.u32()?,
            next_multi_offset: r.u32()?,
            time: r.i64()?,
        })
    }
}

/// A prepared transaction still in flight at checkpoint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreparedXact {
    /// Transaction id.
    pub xid: TransactionId,
    /// Where its prepare record starts. Segments from here on are retained.
    pub prepare_lsn: Lsn,
}

/// Body of a checkpoint record: the checkpoint plus the prepared
/// transactions that were in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CheckpointRecord {
    /// Checkpoint state.
    pub checkpoint: CheckPoint,
    /// In-flight prepared transactions.
    pub prepared: Vec<PreparedXact>,
}

impl CheckpointRecord {
    /// Encodes the record body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            CHECKPOINT_SIZE + 4 + self.prepared.len() * PREPARED_ENTRY_SIZE,
        );
        self.checkpoint.encode_into(&mut out);
        out.extend_from_slice(&(self.prepared.len() as u32).to_le_bytes());
        for p in &self.prepared {
            out.extend_from_slice(&p.xid.to_le_bytes());
            out.extend_from_slice(&p.prepare_lsn.as_u64().to_le_bytes());
        }
        out
    }

    /// Decodes a record body; `None` if the length does not match its
    /// contents exactly.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(data);
        let checkpoint = CheckPoint::decode_from(&mut r)?;
        let count = r.u32()? as usize;
        if r.remaining() != count.checked_mul(PREPARED_ENTRY_SIZE)? {
            return None;
        }
        let mut prepared = Vec::with_capacity(count);
        for _ in 0..count {
            prepared.push(PreparedXact {
                xid: r.u32()?,
                prepare_lsn: Lsn::new(r.u64()?),
            });
        }
        Some(Self {
            checkpoint,
            prepared,
        })
    }
}

/// Body of a commit or abort record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactRecord {
    /// Commit or abort time.
    pub time: Timestamp,
}

impl XactRecord {
    /// Encodes the record body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.time.to_le_bytes().to_vec()
    }

    /// Decodes a record body. Bytes after the timestamp belong to the caller.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        ByteReader::new(data).i64().map(|time| Self { time })
    }
}

/// Encodes a `BACKUP_END` body: the start LSN of the backup that ended.
#[must_use]
pub fn encode_backup_end(start: Lsn) -> Vec<u8> {
    start.as_u64().to_le_bytes().to_vec()
}

/// Decodes a `BACKUP_END` body.
#[must_use]
pub fn decode_backup_end(data: &[u8]) -> Option<Lsn> {
    ByteReader::new(data).u64().map(Lsn::new)
}

/// Encodes a `NEXTOID` body.
#[must_use]
pub fn encode_next_oid(oid: Oid) -> Vec<u8> {
    oid.to_le_bytes().to_vec()
}

/// Decodes a `NEXTOID` body.
#[must_use]
pub fn decode_next_oid(data: &[u8]) -> Option<Oid> {
    ByteReader::new(data).u32()
}

/// Names an `XLOG` op code.
#[must_use]
pub fn xlog_op_name(op: u8) -> &'static str {
    match op {
        XLOG_CHECKPOINT_SHUTDOWN => "checkpoint shutdown",
        XLOG_CHECKPOINT_ONLINE => "checkpoint online",
        XLOG_NOOP => "noop",
        XLOG_NEXTOID => "nextOid",
        XLOG_SWITCH => "xlog switch",
        XLOG_BACKUP_END => "backup end",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint() -> CheckPoint {
        CheckPoint {
            redo: Lsn::from_parts(0, 0x0100_0020),
            this_timeline: 2,
            next_xid_epoch: 1,
            next_xid: 1000,
            next_oid: 16384,
            next_multi: 7,
            next_multi_offset: 21,
            time: 1_700_000_000_000_000,
        }
    }

    #[test]
    fn checkpoint_record_round_trip() {
        let record = CheckpointRecord {
            checkpoint: sample_checkpoint(),
            prepared: vec![PreparedXact {
                xid: 900,
                prepare_lsn: Lsn::new(0x0080_0000),
            }],
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), CHECKPOINT_SIZE + 4 + 12);
        assert_eq!(CheckpointRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn checkpoint_record_rejects_wrong_length() {
        let mut bytes = CheckpointRecord {
            checkpoint: sample_checkpoint(),
            prepared: Vec::new(),
        }
        .encode();
        bytes.push(0);
        assert!(CheckpointRecord::decode(&bytes).is_none());
        assert!(CheckpointRecord::decode(&bytes[..20]).is_none());
    }

    #[test]
    fn xact_record_ignores_trailing_bytes() {
        let mut body = XactRecord { time: 42 }.encode();
        body.extend_from_slice(b"caller data");
        assert_eq!(XactRecord::decode(&body).unwrap().time, 42);
    }

    #[test]
    fn small_payloads() {
        assert_eq!(decode_backup_end(&encode_backup_end(Lsn::new(99))), Some(Lsn::new(99)));
        assert_eq!(decode_next_oid(&encode_next_oid(20000)), Some(20000));
        assert_eq!(xlog_op_name(XLOG_SWITCH), "xlog switch");
    }
}
