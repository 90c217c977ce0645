//! Port numbering.
//!
//! Ports below [`USER_PORT_BASE`] are reserved for the fabric itself; user
//! conversations are allocated from the range above it.

use crate::error::{FabricError, FabricResult};

/// Doorbell-only notifications with no ring payload.
pub const NOTIFY_PORT: u32 = 1;
/// Liveness heartbeats, consumed by the link.
pub const HEARTBEAT_PORT: u32 = 2;
pub const DIAG_PORT: u32 = 3;
pub const USER_PORT_BASE: u32 = 16;
/// One past the highest valid port.
pub const PORT_LIMIT: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortClass {
    System,
    User,
}

impl PortClass {
    pub fn of(port: u32) -> Option<Self> {
        match port {
            0 => None,
            p if p < USER_PORT_BASE => Some(PortClass::System),
            p if p < PORT_LIMIT => Some(PortClass::User),
            _ => None,
        }
    }
}

pub fn validate(port: u32) -> FabricResult<PortClass> {
    PortClass::of(port).ok_or(FabricError::InvalidPort { port })
}
