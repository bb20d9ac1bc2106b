//! Durability-critical sections.
//!
//! Code that has started mutating shared log state (copying a record into
//! the ring, rewriting the control file after a checkpoint) cannot back out
//! half way. Such code runs inside a [`CriticalSection`]; any error raised
//! while one is active is escalated to a panic instead of being returned,
//! so that no corrupt state is ever persisted by continuing. Locks do not
//! poison, so the log's shared state also records the failure and every
//! later operation on that log fails with `Stopped`.

use crate::error::WalResult;
use std::cell::Cell;
use std::marker::PhantomData;
use tracing::error;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII guard marking the current thread as inside a critical section.
///
/// Sections nest. The guard is neither `Send` nor `Sync` because the
/// nesting depth is tracked per thread.
#[derive(Debug)]
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    /// Enters a critical section.
    pub fn enter() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Returns true if the current thread is inside a critical section.
#[must_use]
pub fn in_critical_section() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// Surfaces `result`, or panics if it is an error raised inside a critical
/// section.
///
/// # Panics
///
/// Panics when `result` is `Err` and the calling thread is inside a
/// critical section.
pub fn escalate<T>(result: WalResult<T>) -> WalResult<T> {
    match result {
        Err(err) if in_critical_section() => {
            error!(error = %err, severity = ?err.severity(), "error in critical section");
            panic!("PANIC: {err}");
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WalError;
    use crate::types::Lsn;

    fn shortfall() -> WalResult<()> {
        Err(WalError::FlushShortfall {
            requested: Lsn::new(16),
            flushed: Lsn::new(8),
        })
    }

    #[test]
    fn outside_section_errors_surface() {
        assert!(!in_critical_section());
        assert!(escalate(shortfall()).is_err());
    }

    #[test]
    fn nesting_is_tracked() {
        let outer = CriticalSection::enter();
        {
            let _inner = CriticalSection::enter();
            assert!(in_critical_section());
        }
        assert!(in_critical_section());
        drop(outer);
        assert!(!in_critical_section());
    }

    #[test]
    #[should_panic(expected = "PANIC")]
    fn inside_section_errors_panic() {
        let _section = CriticalSection::enter();
        let _ = escalate(shortfall());
    }

    #[test]
    fn ok_passes_through_section() {
        let _section = CriticalSection::enter();
        assert_eq!(escalate(Ok(5)).unwrap(), 5);
    }
}
