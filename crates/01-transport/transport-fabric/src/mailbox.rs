//! Doorbell signaling through hardware mailbox slots.
//!
//! Each remote domain exposes a small register file of request slots. To
//! notify it, a sender claims a slot through the request register, fills the
//! slot's data words, writes the slot's info word last (that write is what the
//! hardware treats as "slot ready") and rings the doorbell vector for the slot.
//! The remote reads the slot and writes its index to the release register,
//! which bumps the acknowledgement count the sender's [`RequestBudget`] watches.
//!
//! Register file layout (all registers 32-bit little-endian):
//!
//! ```text
//! 0x00 REQUEST    read: claims a free slot, returns its index or NO_SLOT
//! 0x04 RELEASE    write: slot index the consumer is finished with
//! 0x08 ACK_COUNT  read: slots released so far (wrapping)
//! 0x0C SLOT_COUNT read: slots implemented
//! 0x40 + n*0x40   slot n: DATA[0..8] at +0x00, INFO at +0x20
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use transport::RetryPolicy;

use crate::config::DoorbellSection;
use crate::error::{FabricError, FabricResult};

pub mod regs {
    pub const REQUEST: usize = 0x00;
    pub const RELEASE: usize = 0x04;
    pub const ACK_COUNT: usize = 0x08;
    pub const SLOT_COUNT: usize = 0x0C;
    pub const SLOT_BASE: usize = 0x40;
    pub const SLOT_STRIDE: usize = 0x40;
    pub const SLOT_DATA_WORDS: usize = 8;
    pub const SLOT_INFO: usize = 0x20;
    /// REQUEST value when every slot is busy.
    pub const NO_SLOT: u32 = u32::MAX;

    pub const fn data(slot: u32, word: usize) -> usize {
        SLOT_BASE + slot as usize * SLOT_STRIDE + word * 4
    }

    pub const fn info(slot: u32) -> usize {
        SLOT_BASE + slot as usize * SLOT_STRIDE + SLOT_INFO
    }

    /// Bytes spanned by a register file with `slots` slots.
    pub const fn file_len(slots: usize) -> usize {
        SLOT_BASE + slots * SLOT_STRIDE
    }
}

/// Category carried in the info word of doorbells that announce ring traffic.
pub const CATEGORY_RING: u8 = 1;

/// A mailbox register file. Reads may have side effects (REQUEST claims a slot).
pub trait MailboxRegisters: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// "Ring doorbell N" toward the remote domain.
pub trait InterruptLine: Send + Sync {
    fn trigger(&self, vector: u32);
}

/// Callback run in interrupt-delivery context with the vector that fired.
pub type InterruptHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// "Register interrupt callback" on the local domain.
pub trait InterruptController: Send + Sync {
    /// Vectors this controller can deliver, numbered from zero.
    fn vector_count(&self) -> u32;
    fn register(&self, vector: u32, handler: InterruptHandler);
    fn unregister(&self, vector: u32);
}

/// The 8-bit originator a doorbell from `domain` carries in its info word.
/// Domains that share it cannot be told apart by the receiver.
pub fn originator_of(domain: u32) -> u8 {
    (domain & 0xFF) as u8
}

/// Decoded info register: who sent the doorbell, what it is about, how many
/// data bytes it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxInfo {
    pub originator: u8,
    pub category: u8,
    pub size: u16,
}

impl MailboxInfo {
    pub fn pack(self) -> u32 {
        ((self.originator as u32) << 24) | ((self.category as u32) << 16) | self.size as u32
    }

    pub fn unpack(bits: u32) -> Self {
        Self {
            originator: ((bits >> 24) & 0xFF) as u8,
            category: ((bits >> 16) & 0xFF) as u8,
            size: (bits & 0xFFFF) as u16,
        }
    }
}

/// Issued-vs-acknowledged admission control for one remote domain.
#[derive(Debug)]
pub struct RequestBudget {
    issued: u32,
    limit: u32,
}

impl RequestBudget {
    pub fn new(limit: u32) -> Self {
        Self { issued: 0, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Requests still in flight given the hardware's acknowledgement count.
    pub fn outstanding(&self, acknowledged: u32) -> u32 {
        self.issued.wrapping_sub(acknowledged)
    }

    /// Whether one more request may be issued.
    pub fn admits(&self, acknowledged: u32) -> bool {
        self.outstanding(acknowledged) < self.limit
    }

    fn record_issue(&mut self) {
        self.issued = self.issued.wrapping_add(1);
    }
}

/// Result of a signal attempt that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The doorbell for `slot` was rung.
    Signalled { slot: u32, latency: Duration },
    /// Too many requests outstanding; nothing was touched.
    Backpressure { outstanding: u32 },
}

/// Sender side of one remote domain's mailbox.
///
/// Shared by every link toward that domain; the budget and slot pool are
/// per remote domain, so signals are serialised here.
pub struct Doorbell {
    remote_id: u32,
    originator: u8,
    regs: Arc<dyn MailboxRegisters>,
    line: Arc<dyn InterruptLine>,
    budget: Mutex<RequestBudget>,
    slot_poll: RetryPolicy,
    attempts: RetryPolicy,
}

impl Doorbell {
    pub fn new(
        local_id: u32,
        remote_id: u32,
        regs: Arc<dyn MailboxRegisters>,
        line: Arc<dyn InterruptLine>,
        config: &DoorbellSection,
    ) -> Self {
        Self {
            remote_id,
            originator: originator_of(local_id),
            regs,
            line,
            budget: Mutex::new(RequestBudget::new(config.budget_limit)),
            slot_poll: config.slot_poll.policy(),
            attempts: config.attempts.policy(),
        }
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Requests issued and not yet acknowledged by the remote.
    pub fn outstanding(&self) -> u32 {
        let acked = self.regs.read32(regs::ACK_COUNT);
        self.budget.lock().outstanding(acked)
    }

    /// Notifies the remote domain, carrying up to eight data words.
    ///
    /// Backpressure is an outcome, not an error: the caller either waits or
    /// relies on the remote's polling pass. `NoSlot` means every acquisition
    /// attempt timed out; ring contents are never touched here.
    pub fn signal(&self, words: &[u32], category: u8) -> FabricResult<SignalOutcome> {
        if words.len() > regs::SLOT_DATA_WORDS {
            return Err(FabricError::InvalidConfig(
                "doorbell carries at most eight data words",
            ));
        }

        let started = Instant::now();
        let mut budget = self.budget.lock();
        let acked = self.regs.read32(regs::ACK_COUNT);
        if !budget.admits(acked) {
            let outstanding = budget.outstanding(acked);
            tracing::trace!(remote = self.remote_id, outstanding, "doorbell backpressure");
            return Ok(SignalOutcome::Backpressure { outstanding });
        }

        let slot = self
            .attempts
            .run(|attempt| {
                if attempt > 0 {
                    tracing::debug!(remote = self.remote_id, attempt, "retrying mailbox slot acquisition");
                }
                self.slot_poll.run(|_| {
                    let slot = self.regs.read32(regs::REQUEST);
                    (slot != regs::NO_SLOT).then_some(slot)
                })
            })
            .ok_or(FabricError::NoSlot {
                remote: self.remote_id,
            })?;

        for (index, word) in words.iter().enumerate() {
            self.regs.write32(regs::data(slot, index), *word);
        }
        let info = MailboxInfo {
            originator: self.originator,
            category,
            size: (words.len() * 4) as u16,
        };
        self.regs.write32(regs::info(slot), info.pack());
        self.line.trigger(slot);
        budget.record_issue();

        let latency = started.elapsed();
        tracing::trace!(remote = self.remote_id, slot, ?latency, "doorbell rung");
        Ok(SignalOutcome::Signalled { slot, latency })
    }
}

/// A doorbell message read out of a local mailbox slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMessage {
    pub slot: u32,
    pub info: MailboxInfo,
    pub words: SmallVec<[u32; regs::SLOT_DATA_WORDS]>,
}

/// Receiver side: the local domain's own mailbox register file.
#[derive(Clone)]
pub struct MailboxReader {
    regs: Arc<dyn MailboxRegisters>,
}

impl MailboxReader {
    pub fn new(regs: Arc<dyn MailboxRegisters>) -> Self {
        Self { regs }
    }

    pub fn slot_count(&self) -> u32 {
        self.regs.read32(regs::SLOT_COUNT)
    }

    /// Reads `slot` and hands it back to the hardware, acknowledging the request.
    pub fn take(&self, slot: u32) -> MailboxMessage {
        let info = MailboxInfo::unpack(self.regs.read32(regs::info(slot)));
        let count = (info.size as usize / 4).min(regs::SLOT_DATA_WORDS);
        let words = (0..count)
            .map(|index| self.regs.read32(regs::data(slot, index)))
            .collect();
        self.regs.write32(regs::RELEASE, slot);
        MailboxMessage { slot, info, words }
    }
}
