//! Frame layout shared bit-for-bit by both domains.
//!
//! ```text
//! +--------+--------+--------+--------+--------+------------------+
//! | target | slot   | port   | check  | length | pad → 32 bytes   |
//! | u32 LE | u32 LE | u32 LE | u32 LE | u32 LE |                  |
//! +--------+--------+--------+--------+--------+------------------+
//! | payload (length bytes) ... | pad → next 32-byte boundary      |
//! +----------------------------+----------------------------------+
//! ```
//!
//! `check` is written last. A consumer may only trust `length` once `check`
//! reads [`FRAME_COMPLETE`].

/// Size of an encoded header, padding included.
pub const HEADER_SIZE: usize = 32;
/// Every frame starts on, and occupies a multiple of, this many bytes.
pub const FRAME_ALIGN: usize = 32;
/// Value of `check_sentinel` once the producer has finished writing a frame.
pub const FRAME_COMPLETE: u32 = 0x4649_4E44; // "FIND"

pub(crate) const TARGET_OFFSET: usize = 0;
pub(crate) const SLOT_OFFSET: usize = 4;
pub(crate) const PORT_OFFSET: usize = 8;
/// Byte offset of `check_sentinel` within the header.
pub const CHECK_OFFSET: usize = 12;
pub(crate) const LENGTH_OFFSET: usize = 16;

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Bytes a frame carrying `payload_len` bytes occupies in the ring, before
/// any wrap skip is added.
pub fn frame_size(payload_len: usize) -> usize {
    align_up(payload_len + HEADER_SIZE, FRAME_ALIGN)
}

/// Addressing and completion metadata preceding every payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// Identity the frame is addressed to.
    pub target_id: u32,
    /// Free-form slot number carried for the consumer.
    pub slot: u32,
    /// Port on the target.
    pub port: u32,
    /// [`FRAME_COMPLETE`] once the frame is fully written.
    pub check_sentinel: u32,
    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Header for a frame about to be pushed. The ring fills in `check_sentinel`
    /// and `length`.
    pub const fn new(target_id: u32, slot: u32, port: u32) -> Self {
        Self {
            target_id,
            slot,
            port,
            check_sentinel: 0,
            length: 0,
        }
    }

    /// Whether the completion sentinel is set.
    pub fn is_complete(&self) -> bool {
        self.check_sentinel == FRAME_COMPLETE
    }

    /// Encodes the header, padding included.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[TARGET_OFFSET..TARGET_OFFSET + 4].copy_from_slice(&self.target_id.to_le_bytes());
        out[SLOT_OFFSET..SLOT_OFFSET + 4].copy_from_slice(&self.slot.to_le_bytes());
        out[PORT_OFFSET..PORT_OFFSET + 4].copy_from_slice(&self.port.to_le_bytes());
        out[CHECK_OFFSET..CHECK_OFFSET + 4].copy_from_slice(&self.check_sentinel.to_le_bytes());
        out[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Decodes a header from its wire form.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Self {
            target_id: word(TARGET_OFFSET),
            slot: word(SLOT_OFFSET),
            port: word(PORT_OFFSET),
            check_sentinel: word(CHECK_OFFSET),
            length: word(LENGTH_OFFSET),
        }
    }
}

/// A frame popped from a ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Header as read from the ring.
    pub header: FrameHeader,
    /// Payload, truncated to the caller's `max_len`.
    pub payload: Vec<u8>,
    /// Bytes the frame occupied in the ring, wrap skip included.
    pub frame_size: usize,
}

impl Frame {
    /// True when `max_len` cut the payload short.
    pub fn is_truncated(&self) -> bool {
        self.payload.len() < self.header.length as usize
    }
}
