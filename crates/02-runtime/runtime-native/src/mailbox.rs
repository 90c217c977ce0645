use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use transport_fabric::mailbox::regs;
use transport_fabric::MailboxRegisters;

/// In-memory mailbox register file with the side effects of the hardware one:
/// reading `REQUEST` claims a slot, writing `RELEASE` frees it and bumps the
/// acknowledgement count.
#[derive(Debug)]
pub struct LoopbackMailbox {
    slots: u32,
    state: Mutex<MailboxState>,
    severed: AtomicBool,
}

#[derive(Debug)]
struct MailboxState {
    busy: Vec<bool>,
    acked: u32,
    words: Vec<u32>,
}

impl LoopbackMailbox {
    /// Register file with `slots` request slots.
    pub fn new(slots: u32) -> Self {
        let words = (regs::file_len(slots as usize) - regs::SLOT_BASE) / 4;
        Self {
            slots,
            state: Mutex::new(MailboxState {
                busy: vec![false; slots as usize],
                acked: 0,
                words: vec![0; words],
            }),
            severed: AtomicBool::new(false),
        }
    }

    /// Slots claimed and not yet released.
    pub fn busy_slots(&self) -> u32 {
        self.state.lock().busy.iter().filter(|busy| **busy).count() as u32
    }

    /// Total releases seen.
    pub fn acknowledged(&self) -> u32 {
        self.state.lock().acked
    }

    /// Makes the register file behave like an unreachable bus: reads return
    /// all ones and writes are dropped.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
    }

    fn slot_word(&self, offset: usize) -> Option<usize> {
        let end = regs::file_len(self.slots as usize);
        (regs::SLOT_BASE..end)
            .contains(&offset)
            .then(|| (offset - regs::SLOT_BASE) / 4)
    }
}

impl MailboxRegisters for LoopbackMailbox {
    fn read32(&self, offset: usize) -> u32 {
        if self.severed.load(Ordering::Acquire) {
            return u32::MAX;
        }
        let mut state = self.state.lock();
        match offset {
            regs::REQUEST => match state.busy.iter().position(|busy| !busy) {
                Some(slot) => {
                    state.busy[slot] = true;
                    slot as u32
                }
                None => regs::NO_SLOT,
            },
            regs::ACK_COUNT => state.acked,
            regs::SLOT_COUNT => self.slots,
            other => self
                .slot_word(other)
                .map(|index| state.words[index])
                .unwrap_or(0),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if self.severed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if offset == regs::RELEASE {
            match state.busy.get_mut(value as usize) {
                Some(busy) if *busy => {
                    *busy = false;
                    state.acked = state.acked.wrapping_add(1);
                }
                _ => tracing::warn!(slot = value, "release of a slot that was not claimed"),
            }
        } else if let Some(index) = self.slot_word(offset) {
            state.words[index] = value;
        }
    }
}
