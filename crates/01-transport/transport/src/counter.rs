//! Counters that live in memory both domains write.
//!
//! A [`CrossDomainCounter`] only offers a load paired with an acquire fence
//! and a store paired with a release fence. There is no way to read a cached
//! value through this type, so every decision the ring makes is based on what
//! is actually in shared memory at that moment.

use crate::error::LinkError;
use crate::window::SharedWindow;
use crate::{TransportError, TransportResult};
use std::sync::atomic::{fence, Ordering};

/// Value a read returns when the link underneath has gone away.
pub const BUS_ERROR: u64 = u64::MAX;

/// A monotonically increasing `u64` mirrored at a fixed offset in shared memory.
#[derive(Clone)]
pub struct CrossDomainCounter {
    window: SharedWindow,
    offset: usize,
}

impl std::fmt::Debug for CrossDomainCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossDomainCounter")
            .field("offset", &self.offset)
            .finish()
    }
}

impl CrossDomainCounter {
    /// Binds a counter to `offset` inside `window`.
    pub fn new(window: SharedWindow, offset: usize) -> TransportResult<Self> {
        if offset % 8 != 0 {
            return Err(TransportError::Misaligned {
                offset,
                alignment: 8,
            });
        }
        let needed = offset + 8;
        if needed > window.len() {
            return Err(TransportError::WindowTooSmall {
                needed,
                available: window.len(),
            });
        }
        Ok(Self { window, offset })
    }

    /// Offset of the mirror inside the window.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reads the authoritative value, then fences so later reads of ring data
    /// cannot be satisfied before it.
    pub fn load_acquire(&self) -> Result<u64, LinkError> {
        let value = self.window.load_u64(self.offset);
        fence(Ordering::Acquire);
        if value == BUS_ERROR {
            return Err(LinkError::BusError {
                offset: self.offset,
            });
        }
        Ok(value)
    }

    /// Fences so every earlier write to ring data is visible first, then publishes.
    pub fn store_release(&self, value: u64) {
        fence(Ordering::Release);
        self.window.store_u64(self.offset, value);
    }
}
