//! Error handling helpers for the transport crate.
//!
//! Three surfaces live here. [`TransportError`] covers allocation and layout
//! validation, [`LinkError`] is the fatal "the other side is gone" signal, and
//! [`RingError`] is what ring operations hand back to the signaling and
//! dispatch layers, which decide between retrying and escalating.

use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by low-level transport helpers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Requested ring capacity is below the minimum or not a power of two.
    #[error("ring capacity {requested} must be a power of two of at least {minimum} bytes")]
    InvalidCapacity { requested: usize, minimum: usize },
    /// Allocation of bus memory failed for the given size/alignment pair.
    #[error("failed to allocate bus memory of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },
    /// A layout does not fit inside the window it is supposed to describe.
    #[error("layout needs {needed} bytes but the window only has {available}")]
    WindowTooSmall { needed: usize, available: usize },
    /// Counter mirrors must be naturally aligned for 64-bit access.
    #[error("offset {offset:#x} is not {alignment}-byte aligned")]
    Misaligned { offset: usize, alignment: usize },
}

/// Fatal link conditions. Once raised, the shared region can no longer be trusted.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A counter mirror read back as all ones, which is what a severed link returns.
    #[error("bus error reading counter mirror at {offset:#x}")]
    BusError { offset: usize },
}

/// Outcome of a ring operation that could not complete.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free space for the frame right now.
    #[error("ring full: frame needs {needed} bytes, {free} free")]
    Full { needed: usize, free: usize },
    /// The frame can never fit, even into an empty ring.
    #[error("frame of {needed} bytes exceeds ring capacity {capacity}")]
    TooLarge { needed: usize, capacity: usize },
    /// Nothing to pop.
    #[error("ring empty")]
    Empty,
    /// The producer published the frame but its completion sentinel never showed up.
    #[error("frame header at offset {offset:#x} not visible")]
    NotVisible { offset: usize },
    /// A completed header claims more bytes than the producer published.
    #[error("corrupt frame at offset {offset:#x}: {frame_size} bytes claimed, {used} published")]
    Corrupt {
        offset: usize,
        frame_size: usize,
        used: usize,
    },
    /// The link went down underneath the ring.
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl RingError {
    /// Transient errors are worth retrying; everything else is permanent or fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RingError::Full { .. } | RingError::Empty | RingError::NotVisible { .. }
        )
    }

    /// Returns the underlying link failure, if any.
    pub fn link_error(&self) -> Option<LinkError> {
        match self {
            RingError::Link(err) => Some(*err),
            _ => None,
        }
    }
}
