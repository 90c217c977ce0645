//! Single-producer/single-consumer frame ring over shared memory.
//!
//! Layout inside the window:
//!
//! ```text
//!        data_offset - 16   data_offset - 8
//!               |                 |
//! ... +---------+-----------------+-----------------------------------+
//!     | ...     | read_count u64  | write_count u64 | data (capacity) |
//! ... +---------+-----------------+-----------------+-----------------+
//!                                                   ^ data_offset
//! ```
//!
//! Both counters only ever grow; the byte position is `count & (capacity - 1)`.
//! Frames are 32-byte aligned ([`crate::frame`]). When fewer than
//! [`HEADER_SIZE`] bytes remain before the physical end, the producer skips
//! them and writes the header at offset 0; the skipped bytes are charged to
//! the frame so both sides advance their counters by the same amount.
//!
//! The producer writes header fields and payload, then the completion
//! sentinel, then publishes `write_count`. The consumer treats the sentinel as
//! the only proof that the frame is whole, because on a real link the counter
//! update can overtake the payload.

use crate::counter::CrossDomainCounter;
use crate::error::{LinkError, RingError};
use crate::frame::{frame_size, Frame, FrameHeader, CHECK_OFFSET, FRAME_COMPLETE, HEADER_SIZE};
use crate::retry::RetryPolicy;
use crate::window::{read_wrapping, write_wrapping, SharedWindow};
use crate::{TransportError, TransportResult};
use parking_lot::Mutex;
use std::sync::atomic::{fence, Ordering};

/// Smallest ring accepted; must hold at least two minimum-size frames.
pub const MIN_CAPACITY: usize = 64;
/// `read_count` lives this many bytes before the data base.
pub const READ_COUNT_BACK: usize = 16;
/// `write_count` lives this many bytes before the data base.
pub const WRITE_COUNT_BACK: usize = 8;

/// Where a ring lives inside its window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    data_offset: usize,
    capacity: usize,
}

impl RingLayout {
    /// Describes a ring whose data starts at `data_offset` and spans `capacity` bytes.
    pub fn new(data_offset: usize, capacity: usize) -> TransportResult<Self> {
        if capacity < MIN_CAPACITY || !capacity.is_power_of_two() {
            return Err(TransportError::InvalidCapacity {
                requested: capacity,
                minimum: MIN_CAPACITY,
            });
        }
        if data_offset < READ_COUNT_BACK {
            return Err(TransportError::WindowTooSmall {
                needed: READ_COUNT_BACK,
                available: data_offset,
            });
        }
        if data_offset % 8 != 0 {
            return Err(TransportError::Misaligned {
                offset: data_offset,
                alignment: 8,
            });
        }
        Ok(Self {
            data_offset,
            capacity,
        })
    }

    /// First byte of the data area.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Size of the data area.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `capacity - 1`, applied to counters to get byte positions.
    pub fn capacity_mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    /// Offset of the `read_count` mirror.
    pub fn read_count_offset(&self) -> usize {
        self.data_offset - READ_COUNT_BACK
    }

    /// Offset of the `write_count` mirror.
    pub fn write_count_offset(&self) -> usize {
        self.data_offset - WRITE_COUNT_BACK
    }

    /// One past the last data byte.
    pub fn end(&self) -> usize {
        self.data_offset + self.capacity
    }
}

/// What the consumer does when a published frame's sentinel never appears.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StallPolicy {
    /// Jump `read_count` to the producer's published count. Everything pending,
    /// including a frame that was merely slow, is discarded.
    #[default]
    Resync,
    /// Leave `read_count` where it is so the next pop retries the same frame.
    Retain,
}

/// Consumer-side tuning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingConfig {
    /// How long to wait for a published header's sentinel.
    pub visibility: RetryPolicy,
    /// What to do once `visibility` is exhausted.
    pub stall: StallPolicy,
}

/// Last values this side observed or published, plus stall bookkeeping.
#[derive(Debug, Default)]
struct Shadow {
    write_count: u64,
    read_count: u64,
    stalls: u64,
    discarded_bytes: u64,
}

/// Where the next frame's header sits.
struct Placement {
    header_at: usize,
    skip: usize,
}

/// Frame ring over a [`SharedWindow`].
///
/// All methods take `&self`: the ring serialises its own producer and
/// consumer paths behind one lock, which is what lets the doorbell handler
/// drain while a local sender pushes.
pub struct RingBuffer {
    window: SharedWindow,
    layout: RingLayout,
    write: CrossDomainCounter,
    read: CrossDomainCounter,
    config: RingConfig,
    shadow: Mutex<Shadow>,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("shadow", &*self.shadow.lock())
            .finish()
    }
}

impl RingBuffer {
    /// Creates a ring and zeroes both counter mirrors.
    pub fn init(window: SharedWindow, layout: RingLayout, config: RingConfig) -> TransportResult<Self> {
        let ring = Self::attach(window, layout, config)?;
        ring.read.store_release(0);
        ring.write.store_release(0);
        Ok(ring)
    }

    /// Binds to a ring whose counters are already live.
    pub fn attach(
        window: SharedWindow,
        layout: RingLayout,
        config: RingConfig,
    ) -> TransportResult<Self> {
        if layout.end() > window.len() {
            return Err(TransportError::WindowTooSmall {
                needed: layout.end(),
                available: window.len(),
            });
        }
        let write = CrossDomainCounter::new(window.clone(), layout.write_count_offset())?;
        let read = CrossDomainCounter::new(window.clone(), layout.read_count_offset())?;
        Ok(Self {
            window,
            layout,
            write,
            read,
            config,
            shadow: Mutex::new(Shadow::default()),
        })
    }

    /// Size of the data area.
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Layout this ring was created with.
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    /// `(write_count, read_count)` as currently published.
    pub fn counters(&self) -> Result<(u64, u64), LinkError> {
        let write = self.write.load_acquire()?;
        let read = self.read.load_acquire()?;
        Ok((write, read))
    }

    /// Bytes published but not yet consumed.
    pub fn used(&self) -> Result<usize, LinkError> {
        let (write, read) = self.counters()?;
        Ok(self.used_between(write, read))
    }

    /// Bytes a producer could claim right now.
    pub fn free_space(&self) -> Result<usize, LinkError> {
        Ok(self.capacity() - self.used()?)
    }

    /// True when nothing is waiting to be popped.
    pub fn is_empty(&self) -> Result<bool, LinkError> {
        let (write, read) = self.counters()?;
        Ok(write == read)
    }

    /// True when not even an empty frame fits.
    pub fn is_full(&self) -> Result<bool, LinkError> {
        Ok(self.free_space()? < frame_size(0))
    }

    /// `(write_count, read_count)` as this side last saw them, without touching
    /// shared memory. Diagnostics only; never make decisions on it.
    pub fn last_seen(&self) -> (u64, u64) {
        let shadow = self.shadow.lock();
        (shadow.write_count, shadow.read_count)
    }

    /// Number of times the consumer gave up waiting for a sentinel.
    pub fn stalls(&self) -> u64 {
        self.shadow.lock().stalls
    }

    /// Bytes thrown away by resynchronisation.
    pub fn discarded_bytes(&self) -> u64 {
        self.shadow.lock().discarded_bytes
    }

    /// Refreshes the local view of both counters from their mirrors.
    pub fn resync(&self) -> Result<(u64, u64), LinkError> {
        let mut shadow = self.shadow.lock();
        self.resync_locked(&mut shadow)
    }

    /// Appends one frame.
    ///
    /// `header.check_sentinel` and `header.length` are filled in here. Returns
    /// the number of bytes the frame consumed, wrap skip included. On error
    /// nothing in shared memory has changed.
    pub fn push(&self, header: FrameHeader, payload: &[u8]) -> Result<usize, RingError> {
        let capacity = self.capacity();
        let base_size = frame_size(payload.len());
        if base_size > capacity || payload.len() > u32::MAX as usize {
            return Err(RingError::TooLarge {
                needed: base_size,
                capacity,
            });
        }

        let mut shadow = self.shadow.lock();
        let (write, read) = self.counters()?;
        let free = capacity - self.used_between(write, read);

        let place = self.placement(write);
        let total = place.skip + base_size;
        if total > free {
            return Err(RingError::Full {
                needed: total,
                free,
            });
        }

        let header = FrameHeader {
            check_sentinel: 0,
            length: payload.len() as u32,
            ..header
        };
        let data = self.layout.data_offset;
        self.window.write_bytes(data + place.header_at, &header.encode());
        let payload_at = (place.header_at + HEADER_SIZE) & (capacity - 1);
        write_wrapping(&*self.window, data, capacity, payload_at, payload);

        fence(Ordering::Release);
        self.window
            .store_u32(data + place.header_at + CHECK_OFFSET, FRAME_COMPLETE);

        let next = write + total as u64;
        self.write.store_release(next);
        shadow.write_count = next;
        shadow.read_count = read;

        tracing::trace!(
            target_id = header.target_id,
            port = header.port,
            len = payload.len(),
            skip = place.skip,
            write_count = next,
            "frame pushed"
        );
        Ok(total)
    }

    /// Removes the oldest frame, copying at most `max_len` payload bytes.
    ///
    /// The read pointer moves past the whole frame even when the payload is
    /// truncated, so every observed frame is consumed exactly once.
    pub fn pop(&self, max_len: usize) -> Result<Frame, RingError> {
        let capacity = self.capacity();
        let data = self.layout.data_offset;

        let mut shadow = self.shadow.lock();
        let (write, read) = self.counters()?;
        if write == read {
            shadow.write_count = write;
            shadow.read_count = read;
            return Err(RingError::Empty);
        }

        let used = self.used_between(write, read);
        let place = self.placement(read);
        let check_at = data + place.header_at + CHECK_OFFSET;
        if place.skip + HEADER_SIZE > used {
            return Err(self.corrupt(&mut shadow, place.header_at, place.skip + HEADER_SIZE, used));
        }

        let visible = self.config.visibility.run(|_| {
            let check = self.window.load_u32(check_at);
            fence(Ordering::Acquire);
            (check == FRAME_COMPLETE).then_some(())
        });
        if visible.is_none() {
            return Err(self.stall(&mut shadow, place.header_at));
        }

        let mut raw = [0u8; HEADER_SIZE];
        self.window.read_bytes(data + place.header_at, &mut raw);
        let header = FrameHeader::decode(&raw);
        let length = header.length as usize;
        let total = place.skip + frame_size(length);
        if total > used {
            return Err(self.corrupt(&mut shadow, place.header_at, total, used));
        }

        let mut payload = vec![0u8; length.min(max_len)];
        let payload_at = (place.header_at + HEADER_SIZE) & (capacity - 1);
        read_wrapping(&*self.window, data, capacity, payload_at, &mut payload);

        // Scrub so a later lap can never mistake this sentinel for a fresh one.
        self.window.store_u32(check_at, 0);

        let next = read + total as u64;
        self.read.store_release(next);
        shadow.read_count = next;
        shadow.write_count = write;

        tracing::trace!(
            target_id = header.target_id,
            port = header.port,
            len = length,
            read_count = next,
            "frame popped"
        );
        Ok(Frame {
            header,
            payload,
            frame_size: total,
        })
    }

    fn used_between(&self, write: u64, read: u64) -> usize {
        (write.saturating_sub(read) as usize).min(self.capacity())
    }

    fn placement(&self, count: u64) -> Placement {
        let offset = (count & self.layout.capacity_mask()) as usize;
        let remaining = self.capacity() - offset;
        if remaining < HEADER_SIZE {
            Placement {
                header_at: 0,
                skip: remaining,
            }
        } else {
            Placement {
                header_at: offset,
                skip: 0,
            }
        }
    }

    fn resync_locked(&self, shadow: &mut Shadow) -> Result<(u64, u64), LinkError> {
        let (write, read) = self.counters()?;
        shadow.write_count = write;
        shadow.read_count = read;
        Ok((write, read))
    }

    fn stall(&self, shadow: &mut Shadow, header_at: usize) -> RingError {
        shadow.stalls += 1;
        let (write, read) = match self.resync_locked(shadow) {
            Ok(counters) => counters,
            Err(err) => return err.into(),
        };
        match self.config.stall {
            StallPolicy::Resync => {
                let dropped = write.saturating_sub(read);
                self.read.store_release(write);
                shadow.read_count = write;
                shadow.discarded_bytes += dropped;
                tracing::warn!(
                    offset = header_at,
                    dropped,
                    "frame sentinel never became visible; consumer resynchronised to producer"
                );
            }
            StallPolicy::Retain => {
                tracing::debug!(offset = header_at, "frame sentinel not visible yet");
            }
        }
        RingError::NotVisible { offset: header_at }
    }

    fn corrupt(&self, shadow: &mut Shadow, offset: usize, frame_size: usize, used: usize) -> RingError {
        let write = match self.write.load_acquire() {
            Ok(write) => write,
            Err(err) => return err.into(),
        };
        let read = shadow.read_count.max(write.saturating_sub(used as u64));
        self.read.store_release(write);
        shadow.discarded_bytes += write.saturating_sub(read);
        shadow.read_count = write;
        shadow.write_count = write;
        tracing::error!(offset, frame_size, used, "corrupt frame; consumer resynchronised");
        RingError::Corrupt {
            offset,
            frame_size,
            used,
        }
    }
}
