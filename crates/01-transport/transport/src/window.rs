//! Byte-addressed view of memory reachable over the link.
//!
//! The physical link is not ours to implement. All the transport needs from it
//! is "read memory at offset X" and "write memory at offset X", and that is all
//! [`MemoryWindow`] offers. Word accessors are required to be single-copy atomic
//! so counter mirrors and sentinels are never observed torn.

use std::sync::Arc;

/// A window of memory shared with the remote domain.
///
/// Offsets are relative to the start of the window. Implementations panic on
/// out-of-range access: every caller validates its layout against [`len`]
/// once at construction time, so a bad offset is a programming error.
///
/// [`len`]: MemoryWindow::len
pub trait MemoryWindow: Send + Sync {
    /// Size of the window in bytes.
    fn len(&self) -> usize;

    /// Returns true when the window has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    fn read_bytes(&self, offset: usize, dst: &mut [u8]);

    /// Copies `src` into the window starting at `offset`.
    fn write_bytes(&self, offset: usize, src: &[u8]);

    /// Atomically loads a little-endian `u32`. `offset` must be 4-byte aligned.
    fn load_u32(&self, offset: usize) -> u32;

    /// Atomically stores a little-endian `u32`. `offset` must be 4-byte aligned.
    fn store_u32(&self, offset: usize, value: u32);

    /// Atomically loads a little-endian `u64`. `offset` must be 8-byte aligned.
    fn load_u64(&self, offset: usize) -> u64;

    /// Atomically stores a little-endian `u64`. `offset` must be 8-byte aligned.
    fn store_u64(&self, offset: usize, value: u64);
}

/// Shared, type-erased window handle passed between layers.
pub type SharedWindow = Arc<dyn MemoryWindow>;

impl<W: MemoryWindow + ?Sized> MemoryWindow for Arc<W> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        (**self).read_bytes(offset, dst)
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        (**self).write_bytes(offset, src)
    }

    fn load_u32(&self, offset: usize) -> u32 {
        (**self).load_u32(offset)
    }

    fn store_u32(&self, offset: usize, value: u32) {
        (**self).store_u32(offset, value)
    }

    fn load_u64(&self, offset: usize) -> u64 {
        (**self).load_u64(offset)
    }

    fn store_u64(&self, offset: usize, value: u64) {
        (**self).store_u64(offset, value)
    }
}

/// Reads `dst.len()` bytes from a ring-shaped area, wrapping at `capacity`.
///
/// `start` must already be masked into `[0, capacity)`.
pub(crate) fn read_wrapping(
    window: &dyn MemoryWindow,
    base: usize,
    capacity: usize,
    start: usize,
    dst: &mut [u8],
) {
    let first = dst.len().min(capacity - start);
    let (head, tail) = dst.split_at_mut(first);
    window.read_bytes(base + start, head);
    if !tail.is_empty() {
        window.read_bytes(base, tail);
    }
}

/// Writes `src` into a ring-shaped area, wrapping at `capacity`.
pub(crate) fn write_wrapping(
    window: &dyn MemoryWindow,
    base: usize,
    capacity: usize,
    start: usize,
    src: &[u8],
) {
    let first = src.len().min(capacity - start);
    let (head, tail) = src.split_at(first);
    window.write_bytes(base + start, head);
    if !tail.is_empty() {
        window.write_bytes(base, tail);
    }
}
