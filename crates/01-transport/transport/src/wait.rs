//! Park/wake shim for whatever context delivers doorbell interrupts.
//!
//! A [`DoorbellLatch`] collects raised doorbell vectors in one atomic word.
//! The delivery context parks on that word (futex-backed through the
//! `atomic-wait` crate on native targets) and takes the whole pending set at
//! once, so doorbells rung while it was busy coalesce into one wakeup.

use std::sync::atomic::{AtomicU32, Ordering};

/// Highest vector a latch can carry. Bit 31 is reserved for shutdown.
pub const MAX_VECTOR: u32 = 30;
const CLOSED: u32 = 1 << 31;

/// Result of waiting on a latch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Bitmask of vectors raised since the last take.
    Raised(u32),
    /// The latch was closed; the waiter should exit.
    Closed,
}

/// Accumulates doorbell vectors until a waiter takes them.
#[derive(Debug, Default)]
pub struct DoorbellLatch {
    pending: AtomicU32,
}

impl DoorbellLatch {
    /// Creates an empty latch.
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Marks `vector` pending and wakes the waiter. A vector above
    /// [`MAX_VECTOR`] is refused and `false` returned.
    pub fn raise(&self, vector: u32) -> bool {
        if vector > MAX_VECTOR {
            return false;
        }
        self.pending.fetch_or(1 << vector, Ordering::Release);
        imp::wake_all(&self.pending);
        true
    }

    /// Closes the latch; current and future waiters return [`Wakeup::Closed`].
    pub fn close(&self) {
        self.pending.fetch_or(CLOSED, Ordering::Release);
        imp::wake_all(&self.pending);
    }

    /// Takes the pending set without blocking.
    pub fn take(&self) -> Option<Wakeup> {
        let current = self.pending.load(Ordering::Acquire);
        if current & CLOSED != 0 {
            return Some(Wakeup::Closed);
        }
        if current == 0 {
            return None;
        }
        let bits = self.pending.fetch_and(CLOSED, Ordering::AcqRel) & !CLOSED;
        Some(Wakeup::Raised(bits))
    }

    /// Blocks until at least one vector is pending or the latch is closed.
    pub fn wait(&self) -> Wakeup {
        loop {
            if let Some(wakeup) = self.take() {
                return wakeup;
            }
            imp::wait_u32(&self.pending, 0);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        atomic_wait::wait(atomic, expected);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

#[cfg(target_arch = "wasm32")]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(_atomic: &AtomicU32, _expected: u32) {
        std::hint::spin_loop();
    }

    #[inline]
    pub(crate) fn wake_all(_atomic: &AtomicU32) {}
}
