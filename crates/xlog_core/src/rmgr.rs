//! Resource managers and the other collaborators the log calls out to.
//!
//! A resource manager owns one kind of record: it replays them during
//! recovery and can veto restart points while it holds state that early
//! truncation would lose. Pages restored from full-page images go to a
//! [`PageStore`]; every inserted record can be mirrored to a
//! [`ChangeTracker`].

use crate::error::{WalError, WalResult};
use crate::records::{
    xlog_op_name, XactRecord, RM_MAX_ID, RM_XACT_ID, RM_XLOG_ID, XACT_ABORT, XACT_COMMIT,
};
use crate::types::{Lsn, PageTag, RmgrId, TransactionId};
use crate::wal::DecodedRecord;
use std::fmt;
use std::sync::Arc;

/// Replay callbacks for one kind of record.
pub trait ResourceManager: Send + Sync {
    /// Name used in logs and dumps.
    fn name(&self) -> &str;

    /// Applies a record. Full-page images have already been restored.
    ///
    /// # Errors
    ///
    /// Any error ends recovery.
    fn redo(&self, record: &DecodedRecord) -> WalResult<()>;

    /// One-line description of a record for dumps.
    fn describe(&self, record: &DecodedRecord) -> String {
        format!("op {:#04x}, {} bytes", record.op(), record.data.len())
    }

    /// Called before the first record is replayed.
    ///
    /// # Errors
    ///
    /// Any error ends recovery.
    fn startup(&self) -> WalResult<()> {
        Ok(())
    }

    /// Called after the last record is replayed.
    ///
    /// # Errors
    ///
    /// Any error ends recovery.
    fn cleanup(&self) -> WalResult<()> {
        Ok(())
    }

    /// Returns false while a restart point would be unsafe.
    fn safe_restartpoint(&self) -> bool {
        true
    }

    /// Returns true to be shown every record again in replay pass `pass`
    /// (2 or 3) after the main redo pass.
    fn wants_pass(&self, _pass: u8) -> bool {
        false
    }

    /// Handles one record in a later replay pass.
    ///
    /// # Errors
    ///
    /// Any error ends recovery.
    fn replay_pass(&self, _pass: u8, _record: &DecodedRecord) -> WalResult<()> {
        Ok(())
    }
}

/// Receives full-page images restored during redo.
pub trait PageStore: Send + Sync {
    /// Replaces the page `tag` with `image`, logged by the record at `lsn`.
    ///
    /// # Errors
    ///
    /// Any error ends recovery.
    fn restore_page(&self, tag: PageTag, lsn: Lsn, image: &[u8]) -> WalResult<()>;
}

/// Page store that discards images.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPageStore;

impl PageStore for NullPageStore {
    fn restore_page(&self, _tag: PageTag, _lsn: Lsn, _image: &[u8]) -> WalResult<()> {
        Ok(())
    }
}

/// A record as handed to a [`ChangeTracker`].
#[derive(Debug, Clone, Copy)]
pub struct TrackedRecord<'a> {
    /// Start of the record.
    pub lsn: Lsn,
    /// End of the record.
    pub end_lsn: Lsn,
    /// Resource manager.
    pub rmid: RmgrId,
    /// Op code and backup block flags.
    pub info: u8,
    /// Owning transaction.
    pub xid: TransactionId,
    /// Full record image, header included.
    pub bytes: &'a [u8],
}

/// Secondary change log fed with every inserted record.
///
/// Called after the inserter has released every log lock.
pub trait ChangeTracker: Send + Sync {
    /// Appends a record.
    fn append(&self, record: &TrackedRecord<'_>);
}

/// Registered resource managers, indexed by id.
#[derive(Clone)]
pub struct RmgrRegistry {
    slots: Vec<Option<Arc<dyn ResourceManager>>>,
}

impl Default for RmgrRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RmgrRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|(id, rmgr)| (id, rmgr.name().to_string())))
            .finish()
    }
}

impl RmgrRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![None; usize::from(RM_MAX_ID) + 1],
        }
    }

    /// Registers `rmgr` under `id`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `id` is reserved, out of range or taken.
    pub fn register(&mut self, id: RmgrId, rmgr: Arc<dyn ResourceManager>) -> WalResult<()> {
        if id == RM_XLOG_ID || id > RM_MAX_ID {
            return Err(WalError::config(format!(
                "resource manager ID {id} cannot be registered"
            )));
        }
        let slot = &mut self.slots[usize::from(id)];
        if slot.is_some() {
            return Err(WalError::config(format!(
                "resource manager ID {id} is already registered"
            )));
        }
        *slot = Some(rmgr);
        Ok(())
    }

    /// Looks up the handler for `id`.
    #[must_use]
    pub fn get(&self, id: RmgrId) -> Option<&Arc<dyn ResourceManager>> {
        self.slots.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Registered handlers in id order.
    pub fn iter(&self) -> impl Iterator<Item = (RmgrId, &Arc<dyn ResourceManager>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|r| (id as RmgrId, r)))
    }

    /// Name of `id` for display.
    #[must_use]
    pub fn name_of(&self, id: RmgrId) -> String {
        match (id, self.get(id)) {
            (_, Some(rmgr)) => rmgr.name().to_string(),
            (RM_XLOG_ID, None) => "XLOG".to_string(),
            (RM_XACT_ID, None) => "Transaction".to_string(),
            (_, None) => format!("rmgr {id}"),
        }
    }

    /// Describes a record using its handler, or the built-in description.
    #[must_use]
    pub fn describe(&self, record: &DecodedRecord) -> String {
        if let Some(rmgr) = self.get(record.rmid()) {
            return rmgr.describe(record);
        }
        match record.rmid() {
            RM_XLOG_ID => xlog_op_name(record.op()).to_string(),
            RM_XACT_ID => describe_xact(record),
            _ => format!("op {:#04x}", record.op()),
        }
    }
}

fn describe_xact(record: &DecodedRecord) -> String {
    let kind = match record.op() {
        XACT_COMMIT => "commit",
        XACT_ABORT => "abort",
        _ => "UNKNOWN",
    };
    match XactRecord::decode(&record.data) {
        Some(x) => format!("{kind}: xid {} time {}", record.xid(), x.time),
        None => kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ResourceManager for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn redo(&self, _record: &DecodedRecord) -> WalResult<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = RmgrRegistry::new();
        registry.register(5, Arc::new(Named("Heap"))).unwrap();
        assert_eq!(registry.get(5).unwrap().name(), "Heap");
        assert!(registry.get(6).is_none());
        assert_eq!(registry.name_of(5), "Heap");
        assert_eq!(registry.name_of(0), "XLOG");
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn reserved_and_duplicate_ids_are_rejected() {
        let mut registry = RmgrRegistry::new();
        assert!(registry.register(RM_XLOG_ID, Arc::new(Named("x"))).is_err());
        assert!(registry.register(RM_MAX_ID + 1, Arc::new(Named("x"))).is_err());
        registry.register(RM_XACT_ID, Arc::new(Named("Xact"))).unwrap();
        assert!(registry.register(RM_XACT_ID, Arc::new(Named("again"))).is_err());
    }
}
