//! Placement of the two rings inside a shared region.
//!
//! The region is split in half. Each half starts with a 64-byte control block
//! whose last sixteen bytes hold the ring's read and write counter mirrors,
//! followed by a power-of-two data area:
//!
//! ```text
//! [ctl 64][downstream data][ctl 64][upstream data]
//! ```
//!
//! Downstream carries owner to peer traffic, upstream the reverse.

use transport::{RingLayout, TransportError, MIN_CAPACITY};

use crate::error::FabricResult;

pub const CONTROL_BLOCK: usize = 64;

/// Which end of the link a domain holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    /// Allocated and exposed the shared region.
    Owner,
    /// Mapped the region the owner exposed.
    Peer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkLayout {
    pub downstream: RingLayout,
    pub upstream: RingLayout,
}

impl LinkLayout {
    /// Largest symmetric layout that fits a region of `size` bytes.
    pub fn for_region(size: usize) -> FabricResult<Self> {
        let half = size / 2;
        if half < CONTROL_BLOCK + MIN_CAPACITY {
            return Err(TransportError::WindowTooSmall {
                needed: 2 * (CONTROL_BLOCK + MIN_CAPACITY),
                available: size,
            }
            .into());
        }
        let room = half - CONTROL_BLOCK;
        let capacity = 1usize << (usize::BITS - 1 - room.leading_zeros());

        let downstream = RingLayout::new(CONTROL_BLOCK, capacity)?;
        let upstream = RingLayout::new(downstream.end() + CONTROL_BLOCK, capacity)?;
        Ok(Self {
            downstream,
            upstream,
        })
    }

    /// `(tx, rx)` ring layouts as seen from `role`.
    pub fn split(&self, role: LinkRole) -> (RingLayout, RingLayout) {
        match role {
            LinkRole::Owner => (self.downstream, self.upstream),
            LinkRole::Peer => (self.upstream, self.downstream),
        }
    }

    pub fn end(&self) -> usize {
        self.upstream.end()
    }
}
