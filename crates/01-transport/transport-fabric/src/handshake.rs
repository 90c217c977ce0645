//! Two-phase link establishment over the bootstrap window.
//!
//! The owning domain writes a region descriptor into the small bootstrap window
//! both sides can already reach, then raises a check sentinel. The peer maps
//! the region, clears the check flag and answers with an acknowledgement
//! sentinel, which the owner consumes. When the owner also exposes an extended
//! region, the same exchange repeats on the extended fields.
//!
//! ```text
//! 0x00 CHECK      u32   REGION_CHECKED when the primary descriptor is valid
//! 0x04 ACK        u32   REGION_ACK once the peer has mapped it
//! 0x08 BASE       u64   bus address of the primary region
//! 0x10 SIZE       u64
//! 0x18 EXT_CHECK  u32
//! 0x1C EXT_ACK    u32
//! 0x20 EXT_BASE   u64
//! 0x28 EXT_SIZE   u64
//! 0x30 FLAGS      u32   bit 0: an extended region follows
//! ```

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use transport::{BusMemory, MemoryWindow, RetryPolicy, SharedWindow};

use crate::error::{FabricError, FabricResult};

pub mod boot {
    pub const CHECK: usize = 0x00;
    pub const ACK: usize = 0x04;
    pub const BASE: usize = 0x08;
    pub const SIZE: usize = 0x10;
    pub const EXT_CHECK: usize = 0x18;
    pub const EXT_ACK: usize = 0x1C;
    pub const EXT_BASE: usize = 0x20;
    pub const EXT_SIZE: usize = 0x28;
    pub const FLAGS: usize = 0x30;
    /// Bytes a bootstrap window must provide.
    pub const LEN: usize = 0x40;

    pub const FLAG_EXTENDED: u32 = 1;
}

pub const REGION_CHECKED: u32 = 0x4348_4B31; // "CHK1"
pub const REGION_ACK: u32 = 0x4143_4B31; // "ACK1"
pub const EXT_REGION_CHECKED: u32 = 0x4348_4B32; // "CHK2"
pub const EXT_REGION_ACK: u32 = 0x4143_4B32; // "ACK2"

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Primary region exchange.
    Primary,
    /// Extended region exchange.
    Extended,
}

impl HandshakePhase {
    fn fields(self) -> PhaseFields {
        match self {
            HandshakePhase::Primary => PhaseFields {
                check: boot::CHECK,
                ack: boot::ACK,
                base: boot::BASE,
                size: boot::SIZE,
                checked: REGION_CHECKED,
                acked: REGION_ACK,
            },
            HandshakePhase::Extended => PhaseFields {
                check: boot::EXT_CHECK,
                ack: boot::EXT_ACK,
                base: boot::EXT_BASE,
                size: boot::EXT_SIZE,
                checked: EXT_REGION_CHECKED,
                acked: EXT_REGION_ACK,
            },
        }
    }
}

struct PhaseFields {
    check: usize,
    ack: usize,
    base: usize,
    size: usize,
    checked: u32,
    acked: u32,
}

/// A region the owning domain allocated and is about to expose.
#[derive(Clone)]
pub struct ExposedRegion {
    pub bus_base: u64,
    pub local_base: u64,
    pub window: SharedWindow,
}

impl ExposedRegion {
    pub fn from_bus_memory(memory: Arc<BusMemory>) -> Self {
        Self {
            bus_base: memory.bus_address(),
            local_base: memory.local_address(),
            window: memory,
        }
    }

    fn size(&self) -> u64 {
        self.window.len() as u64
    }
}

/// What a [`RegionMapper`] hands back for a bus range.
pub struct MappedWindow {
    pub local_base: u64,
    pub window: SharedWindow,
}

/// "Map a physical range into local address space" on the peer side.
pub trait RegionMapper: Send + Sync {
    fn map(&self, bus_base: u64, size: u64) -> FabricResult<MappedWindow>;
}

/// Local view of a region shared with a remote domain.
#[derive(Clone)]
pub struct SharedRegion {
    pub local_base: u64,
    pub local_end: u64,
    /// Bus address the owner advertised.
    pub remote_base_hint: u64,
    pub size: u64,
    window: SharedWindow,
}

impl SharedRegion {
    fn new(local_base: u64, remote_base_hint: u64, window: SharedWindow) -> Self {
        let size = window.len() as u64;
        Self {
            local_base,
            local_end: local_base + size,
            remote_base_hint,
            size,
            window,
        }
    }

    pub fn window(&self) -> &SharedWindow {
        &self.window
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("local_base", &format_args!("{:#x}", self.local_base))
            .field("local_end", &format_args!("{:#x}", self.local_end))
            .field("remote_base_hint", &format_args!("{:#x}", self.remote_base_hint))
            .field("size", &self.size)
            .finish()
    }
}

/// Regions agreed on once both phases complete.
#[derive(Clone, Debug)]
pub struct Established {
    pub primary: SharedRegion,
    pub extended: Option<SharedRegion>,
}

/// Drives either side of the exchange over one bootstrap window.
pub struct Handshake<'a> {
    boot: &'a dyn MemoryWindow,
    poll: RetryPolicy,
}

impl<'a> Handshake<'a> {
    pub fn new(boot: &'a dyn MemoryWindow, poll: RetryPolicy) -> FabricResult<Self> {
        if boot.len() < boot::LEN {
            return Err(transport::TransportError::WindowTooSmall {
                needed: boot::LEN,
                available: boot.len(),
            }
            .into());
        }
        Ok(Self { boot, poll })
    }

    /// Owner side: exposes `primary` (and `extended`, if any) and waits for the
    /// peer to acknowledge each.
    pub fn expose(
        &self,
        primary: &ExposedRegion,
        extended: Option<&ExposedRegion>,
    ) -> FabricResult<Established> {
        let flags = if extended.is_some() {
            boot::FLAG_EXTENDED
        } else {
            0
        };
        self.boot.store_u32(boot::FLAGS, flags);
        self.offer(HandshakePhase::Primary, primary)?;
        tracing::info!(base = %format_args!("{:#x}", primary.bus_base), size = primary.size(), "primary region acknowledged");

        let extended = match extended {
            Some(region) => {
                self.offer(HandshakePhase::Extended, region)?;
                tracing::info!(base = %format_args!("{:#x}", region.bus_base), size = region.size(), "extended region acknowledged");
                Some(SharedRegion::new(
                    region.local_base,
                    region.bus_base,
                    region.window.clone(),
                ))
            }
            None => None,
        };

        Ok(Established {
            primary: SharedRegion::new(primary.local_base, primary.bus_base, primary.window.clone()),
            extended,
        })
    }

    /// Peer side: waits for each descriptor, maps it and acknowledges.
    pub fn accept(&self, mapper: &dyn RegionMapper) -> FabricResult<Established> {
        let primary = self.take(HandshakePhase::Primary, mapper)?;
        let extended = if self.boot.load_u32(boot::FLAGS) & boot::FLAG_EXTENDED != 0 {
            Some(self.take(HandshakePhase::Extended, mapper)?)
        } else {
            None
        };
        Ok(Established { primary, extended })
    }

    fn offer(&self, phase: HandshakePhase, region: &ExposedRegion) -> FabricResult<()> {
        let fields = phase.fields();
        self.boot.store_u32(fields.ack, 0);
        self.boot.store_u64(fields.base, region.bus_base);
        self.boot.store_u64(fields.size, region.size());
        fence(Ordering::Release);
        self.boot.store_u32(fields.check, fields.checked);
        tracing::debug!(?phase, "region descriptor published");

        let acked = self
            .poll
            .run(|_| (self.boot.load_u32(fields.ack) == fields.acked).then_some(()));
        match acked {
            Some(()) => {
                self.boot.store_u32(fields.ack, 0);
                Ok(())
            }
            None => {
                self.boot.store_u32(fields.check, 0);
                tracing::warn!(?phase, "peer never acknowledged region");
                Err(FabricError::HandshakeTimeout { phase })
            }
        }
    }

    fn take(&self, phase: HandshakePhase, mapper: &dyn RegionMapper) -> FabricResult<SharedRegion> {
        let fields = phase.fields();
        self.poll
            .run(|_| (self.boot.load_u32(fields.check) == fields.checked).then_some(()))
            .ok_or(FabricError::HandshakeTimeout { phase })?;
        fence(Ordering::Acquire);

        let base = self.boot.load_u64(fields.base);
        let size = self.boot.load_u64(fields.size);
        let mapped = mapper.map(base, size)?;
        if (mapped.window.len() as u64) < size {
            return Err(FabricError::MapFailed {
                base,
                size,
                reason: "mapping shorter than advertised size",
            });
        }

        self.boot.store_u32(fields.check, 0);
        fence(Ordering::Release);
        self.boot.store_u32(fields.ack, fields.acked);
        tracing::debug!(?phase, base = %format_args!("{base:#x}"), size, "region mapped");
        Ok(SharedRegion::new(mapped.local_base, base, mapped.window))
    }
}
