//! Link layer of the cross-domain transport.
//!
//! Builds on the ring primitives in `transport`:
//!
//! * [`Doorbell`] / [`MailboxReader`] – mailbox-slot signaling with a
//!   per-remote [`RequestBudget`].
//! * [`Handshake`] – two-phase region exchange over the bootstrap window.
//! * [`Link`] – a pair of rings in a shared region plus a doorbell.
//! * [`HandleTable`] / [`Dispatcher`] – `(remote, port)` multiplexing.
//! * [`Endpoint`] – one domain's links and handles.
//! * [`PollRuntime`] – polling for domains without doorbell delivery.

mod config;
mod dispatch;
mod endpoint;
mod error;
mod handle;
pub mod handshake;
pub mod layout;
mod link;
pub mod mailbox;
pub mod port;
mod runtime;
mod stats;

pub use config::{
    DoorbellSection, HandshakeSection, RetrySection, RingSection, StallSetting, TransportConfig,
};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use endpoint::Endpoint;
pub use error::{FabricError, FabricResult};
pub use handle::{
    Delivery, FrameNotifier, HandleKey, HandleState, HandleTable, TransferHandle, DEFAULT_QUEUE_DEPTH,
};
pub use handshake::{
    Established, ExposedRegion, Handshake, HandshakePhase, MappedWindow, RegionMapper,
    SharedRegion,
};
pub use layout::{LinkLayout, LinkRole};
pub use link::{DrainReport, Link, LinkSetup, LinkState, SendOutcome};
pub use mailbox::{
    Doorbell, InterruptController, InterruptHandler, InterruptLine, MailboxInfo, MailboxMessage,
    MailboxReader, MailboxRegisters, RequestBudget, SignalOutcome, originator_of,
};
pub use port::{PortClass, DIAG_PORT, HEARTBEAT_PORT, NOTIFY_PORT, PORT_LIMIT, USER_PORT_BASE};
pub use runtime::{PollRuntime, PollThread, Poller};
pub use stats::{LinkStats, LinkStatsSnapshot, SIZE_BUCKETS};
