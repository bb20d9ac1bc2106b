//! Point-in-time recovery targets.

use crate::config::RecoveryTarget;
use crate::records::{XactRecord, RM_XACT_ID, XACT_ABORT, XACT_COMMIT};
use crate::types::{Lsn, Timestamp, TransactionId};
use crate::wal::DecodedRecord;
use serde::Serialize;
use std::fmt;

/// Where and why replay stopped before the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStop {
    /// Transaction whose commit or abort triggered the stop.
    pub xid: TransactionId,
    /// Its commit or abort time.
    pub time: Timestamp,
    /// Commit rather than abort.
    pub is_commit: bool,
    /// The triggering record was replayed.
    pub after: bool,
    /// Start of the triggering record.
    pub lsn: Lsn,
}

impl fmt::Display for RecoveryStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transaction {}, time {}",
            if self.after { "after" } else { "before" },
            self.xid,
            self.time
        )
    }
}

/// Text recorded in a history file for a recovery that ended at `stop`.
#[must_use]
pub fn stop_reason(stop: Option<&RecoveryStop>) -> String {
    stop.map_or_else(|| "no recovery target specified".to_string(), ToString::to_string)
}

/// Decides whether replay stops at `record`. Only commit and abort records
/// can trigger a stop.
#[must_use]
pub fn check_stop(
    target: RecoveryTarget,
    inclusive: bool,
    record: &DecodedRecord,
) -> Option<RecoveryStop> {
    if record.rmid() != RM_XACT_ID {
        return None;
    }
    let is_commit = match record.op() {
        XACT_COMMIT => true,
        XACT_ABORT => false,
        _ => return None,
    };
    let time = XactRecord::decode(&record.data)?.time;

    let (stop, after) = match target {
        RecoveryTarget::None => return None,
        RecoveryTarget::Xid(xid) => (record.xid() == xid, inclusive),
        // A time target never replays the record that reaches it; with
        // `inclusive` a record exactly at the target time is replayed.
        RecoveryTarget::Time(limit) if inclusive => (time > limit, false),
        RecoveryTarget::Time(limit) => (time >= limit, false),
    };
    stop.then_some(RecoveryStop {
        xid: record.xid(),
        time,
        is_commit,
        after,
        lsn: record.lsn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::RecordHeader;

    fn xact(op: u8, xid: TransactionId, time: Timestamp) -> DecodedRecord {
        DecodedRecord {
            lsn: Lsn::new(0x2000),
            end_lsn: Lsn::new(0x2030),
            header: RecordHeader {
                xid,
                rmid: RM_XACT_ID,
                info: op,
                ..RecordHeader::default()
            },
            data: XactRecord { time }.encode(),
            backup_blocks: Vec::new(),
        }
    }

    #[test]
    fn xid_target_respects_inclusive() {
        let rec = xact(XACT_COMMIT, 42, 100);
        let stop = check_stop(RecoveryTarget::Xid(42), true, &rec).unwrap();
        assert!(stop.after);
        assert!(stop.is_commit);
        let stop = check_stop(RecoveryTarget::Xid(42), false, &rec).unwrap();
        assert!(!stop.after);
        assert!(check_stop(RecoveryTarget::Xid(41), true, &rec).is_none());
    }

    #[test]
    fn time_target_stops_before_record() {
        let at = xact(XACT_ABORT, 7, 1000);
        assert!(check_stop(RecoveryTarget::Time(1000), true, &at).is_none());
        let stop = check_stop(RecoveryTarget::Time(1000), false, &at).unwrap();
        assert!(!stop.after);
        assert!(!stop.is_commit);
        let past = xact(XACT_COMMIT, 8, 1001);
        assert!(check_stop(RecoveryTarget::Time(1000), true, &past).is_some());
    }

    #[test]
    fn only_transaction_ends_count() {
        let mut rec = xact(XACT_COMMIT, 42, 100);
        rec.header.rmid = 5;
        assert!(check_stop(RecoveryTarget::Xid(42), true, &rec).is_none());
        assert!(check_stop(RecoveryTarget::None, true, &xact(XACT_COMMIT, 1, 1)).is_none());
    }

    #[test]
    fn reason_text() {
        let stop = check_stop(RecoveryTarget::Xid(9), true, &xact(XACT_COMMIT, 9, 55)).unwrap();
        assert_eq!(stop_reason(Some(&stop)), "after transaction 9, time 55");
        assert_eq!(stop_reason(None), "no recovery target specified");
    }
}
