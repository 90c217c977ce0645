//! Core primitives of the cross-domain shared-memory transport.
//!
//! * [`MemoryWindow`] – "read/write memory at offset X", the only view of the
//!   physical link this crate needs.
//! * [`BusMemory`] – aligned memory the owning domain allocates and exposes.
//! * [`CrossDomainCounter`] – counter mirrors with explicit barriers.
//! * [`FrameHeader`] / [`Frame`] – the 32-byte aligned wire framing.
//! * [`RingBuffer`] – single-producer/single-consumer frame ring.
//! * [`RetryPolicy`] – bounded waits used by every polling loop.
//! * [`DoorbellLatch`] – park/wake shim for interrupt delivery contexts.

mod counter;
mod error;
pub mod frame;
mod region;
mod retry;
mod ring;
pub mod wait;
mod window;

pub use counter::{CrossDomainCounter, BUS_ERROR};
pub use error::{LinkError, RingError, TransportError, TransportResult};
pub use frame::{align_up, frame_size, Frame, FrameHeader, FRAME_ALIGN, FRAME_COMPLETE, HEADER_SIZE};
pub use region::{BusMemory, RegionInit};
pub use retry::RetryPolicy;
pub use ring::{
    RingBuffer, RingConfig, RingLayout, StallPolicy, MIN_CAPACITY, READ_COUNT_BACK,
    WRITE_COUNT_BACK,
};
pub use wait::{DoorbellLatch, Wakeup};
pub use window::{MemoryWindow, SharedWindow};
