//! The page ring buffer.
//!
//! A fixed number of log pages held in memory. Page `n` of the log (the
//! page starting at `n * page_size`) lives in slot `n % slots`. Each slot
//! records the end LSN of the page it currently holds; a slot may only be
//! reinitialised for a later page once that end LSN has been written out.

use crate::types::Lsn;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-capacity ring of log pages.
pub(crate) struct PageRing {
    pages: Vec<Mutex<Box<[u8]>>>,
    slot_end: Vec<AtomicU64>,
    page_size: u64,
}

impl PageRing {
    pub(crate) fn new(slots: usize, page_size: u64) -> Self {
        let pages = (0..slots)
            .map(|_| Mutex::new(vec![0u8; page_size as usize].into_boxed_slice()))
            .collect();
        let slot_end = (0..slots).map(|_| AtomicU64::new(0)).collect();
        Self {
            pages,
            slot_end,
            page_size,
        }
    }

    /// Number of slots.
    pub(crate) fn slots(&self) -> usize {
        self.pages.len()
    }

    /// Total bytes the ring can hold.
    pub(crate) fn capacity(&self) -> u64 {
        self.pages.len() as u64 * self.page_size
    }

    /// Slot holding log page `page_no`.
    pub(crate) fn slot_of(&self, page_no: u64) -> usize {
        (page_no % self.pages.len() as u64) as usize
    }

    /// Locks the page in `slot`.
    pub(crate) fn page(&self, slot: usize) -> MutexGuard<'_, Box<[u8]>> {
        self.pages[slot].lock()
    }

    /// End LSN of the page currently held in `slot`.
    pub(crate) fn slot_end(&self, slot: usize) -> Lsn {
        Lsn::new(self.slot_end[slot].load(Ordering::Acquire))
    }

    pub(crate) fn set_slot_end(&self, slot: usize, end: Lsn) {
        self.slot_end[slot].store(end.as_u64(), Ordering::Release);
    }

    /// Returns true if the ring currently holds log page `page_no`.
    pub(crate) fn holds(&self, page_no: u64) -> bool {
        self.slot_end(self.slot_of(page_no)).as_u64() == (page_no + 1) * self.page_size
    }

    /// Copies log page `page_no` into `out`, or returns false if the slot
    /// has moved on to another page.
    pub(crate) fn copy_page(&self, page_no: u64, out: &mut Vec<u8>) -> bool {
        let slot = self.slot_of(page_no);
        let page = self.page(slot);
        if !self.holds(page_no) {
            return false;
        }
        out.extend_from_slice(&page);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap() {
        let ring = PageRing::new(4, 8192);
        assert_eq!(ring.slots(), 4);
        assert_eq!(ring.capacity(), 4 * 8192);
        assert_eq!(ring.slot_of(0), 0);
        assert_eq!(ring.slot_of(5), 1);
    }

    #[test]
    fn copy_checks_page_identity() {
        let ring = PageRing::new(2, 16);
        let slot = ring.slot_of(3);
        ring.page(slot)[0] = 7;
        ring.set_slot_end(slot, Lsn::new(4 * 16));

        let mut out = Vec::new();
        assert!(ring.copy_page(3, &mut out));
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 7);

        // Page 1 maps to the same slot but is no longer held.
        assert!(!ring.copy_page(1, &mut out));
        assert_eq!(out.len(), 16);
    }
}
