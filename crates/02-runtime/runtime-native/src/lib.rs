#![deny(missing_docs)]
//! Native loopback harness: two domains in one process, sharing simulated bus
//! memory, with mailbox register files, interrupt delivery threads and fault
//! injection standing in for the hardware.

mod bus;
mod fault;
mod irq;
mod loopback;
mod mailbox;

pub use bus::BusMap;
pub use fault::{FaultPlan, FaultyMapper, FaultyWindow};
pub use irq::{IrqController, IrqLine, SilentLine};
pub use loopback::{quick_config, Domain, LoopbackOptions, LoopbackPair};
pub use mailbox::LoopbackMailbox;
