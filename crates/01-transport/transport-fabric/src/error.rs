use thiserror::Error;

use transport::{LinkError, RingError, TransportError};

use crate::handshake::HandshakePhase;

pub type FabricResult<T> = Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    #[error("link failure: {0}")]
    Link(#[from] LinkError),

    #[error("link to domain {remote} is down")]
    LinkDown { remote: u32 },

    #[error("no link to domain {remote}")]
    UnknownRemote { remote: u32 },

    #[error("no free mailbox slot on domain {remote}")]
    NoSlot { remote: u32 },

    #[error("mailbox has {slots} slots but interrupts reach only {vectors} vectors")]
    TooManySlots { slots: u32, vectors: u32 },

    #[error("domain {remote} rings doorbells as {originator:#04x}, already taken by domain {existing}")]
    OriginatorClash {
        remote: u32,
        existing: u32,
        originator: u8,
    },

    #[error("handshake {phase:?} timed out")]
    HandshakeTimeout { phase: HandshakePhase },

    #[error("region at bus address {base:#x} ({size} bytes) cannot be mapped: {reason}")]
    MapFailed {
        base: u64,
        size: u64,
        reason: &'static str,
    },

    #[error("domain {id} cannot open a handle to itself")]
    SelfAddressed { id: u32 },

    #[error("port {port} outside the valid range")]
    InvalidPort { port: u32 },

    #[error("no free port toward {remote}")]
    PortsExhausted { remote: u32 },

    #[error("handle ({remote}, {port}) is closed")]
    HandleClosed { remote: u32, port: u32 },

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("cannot parse transport configuration: {0}")]
    Config(String),
}

impl FabricError {
    pub fn config(msg: impl Into<String>) -> Self {
        FabricError::Config(msg.into())
    }

    /// Whether the error means the link itself is gone.
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            FabricError::LinkDown { .. }
                | FabricError::Link(_)
                | FabricError::Ring(RingError::Link(_))
        )
    }
}
