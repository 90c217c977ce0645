//! Bus memory allocated by the owning domain.
//!
//! One side of a link allocates the memory that carries the rings; the other
//! side reaches it through its own mapping after the handshake. Native targets
//! prefer anonymous `mmap` regions (page aligned) and fall back to the heap
//! when the mapping is unavailable or not aligned enough.

use crate::window::MemoryWindow;
use crate::{TransportError, TransportResult};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Specifies how memory in a [`BusMemory`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

/// Word accessors need at least this much alignment from the base address.
const WORD_ALIGN: usize = 8;

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native { _map: NativeMap, ptr: NonNull<u8> },
    Owned {
        ptr: NonNull<u8>,
        layout: Layout,
    },
}

impl Backing {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            Backing::Native { ptr, .. } => ptr.as_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Contiguous, aligned memory exposed to the remote domain at `bus_address`.
///
/// All access goes through [`MemoryWindow`], so the memory can be shared
/// between the local producer/consumer and whatever stands in for the remote
/// side without handing out overlapping Rust references.
#[derive(Debug)]
pub struct BusMemory {
    len: usize,
    alignment: usize,
    bus_address: u64,
    backing: Backing,
}

// SAFETY: the backing is only reached through raw-pointer copies and atomics in
// the `MemoryWindow` impl; no `&`/`&mut` to the bytes ever escapes.
unsafe impl Send for BusMemory {}
// SAFETY: as above.
unsafe impl Sync for BusMemory {}

impl BusMemory {
    /// Allocates `len` bytes aligned to `alignment`, advertised at `bus_address`.
    pub fn new_aligned(
        len: usize,
        alignment: usize,
        bus_address: u64,
        init: RegionInit,
    ) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }
        let alignment = alignment.max(WORD_ALIGN);

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(backing) = Self::mmap_backed(len, alignment, init)? {
                return Ok(Self {
                    len,
                    alignment,
                    bus_address,
                    backing,
                });
            }
        }

        Self::heap_backed(len, alignment, bus_address, init)
    }

    fn heap_backed(
        len: usize,
        alignment: usize,
        bus_address: u64,
        init: RegionInit,
    ) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        let ptr = unsafe {
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            bus_address,
            backing: Backing::Owned { ptr, layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(
        len: usize,
        alignment: usize,
        init: RegionInit,
    ) -> TransportResult<Option<Backing>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let Some(ptr) = NonNull::new(map.as_mut_ptr()) else {
            return Ok(None);
        };
        if ptr.as_ptr() as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            unsafe {
                // SAFETY: the anonymous mapping exposes `len` bytes that can be zeroed here.
                ptr::write_bytes(ptr.as_ptr(), 0, len)
            };
        }

        Ok(Some(Backing::Native { _map: map, ptr }))
    }

    /// Address the remote domain uses to reach this memory.
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Address of the first byte in the local address space.
    pub fn local_address(&self) -> u64 {
        self.backing.as_ptr() as u64
    }

    fn check_range(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "bus memory access {offset:#x}+{len} out of range (len {})",
            self.len
        );
    }

    fn word<T>(&self, offset: usize) -> *mut T {
        let size = std::mem::size_of::<T>();
        self.check_range(offset, size);
        assert!(offset % size == 0, "unaligned {size}-byte access at {offset:#x}");
        // SAFETY: range checked above; the base is at least 8-byte aligned.
        unsafe { self.backing.as_ptr().add(offset) as *mut T }
    }
}

impl MemoryWindow for BusMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        unsafe {
            // SAFETY: range checked; `dst` is caller-owned and cannot alias the backing.
            ptr::copy_nonoverlapping(self.backing.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        unsafe {
            // SAFETY: range checked; ring discipline keeps concurrent writers on disjoint bytes.
            ptr::copy_nonoverlapping(src.as_ptr(), self.backing.as_ptr().add(offset), src.len());
        }
    }

    fn load_u32(&self, offset: usize) -> u32 {
        // SAFETY: `word` checks range and alignment; AtomicU32 has the layout of u32.
        let atomic = unsafe { &*(self.word::<u32>(offset) as *const AtomicU32) };
        u32::from_le(atomic.load(Ordering::Relaxed))
    }

    fn store_u32(&self, offset: usize, value: u32) {
        // SAFETY: see `load_u32`.
        let atomic = unsafe { &*(self.word::<u32>(offset) as *const AtomicU32) };
        atomic.store(value.to_le(), Ordering::Relaxed);
    }

    fn load_u64(&self, offset: usize) -> u64 {
        // SAFETY: `word` checks range and alignment; AtomicU64 has the layout of u64.
        let atomic = unsafe { &*(self.word::<u64>(offset) as *const AtomicU64) };
        u64::from_le(atomic.load(Ordering::Relaxed))
    }

    fn store_u64(&self, offset: usize, value: u64) {
        // SAFETY: see `load_u64`.
        let atomic = unsafe { &*(self.word::<u64>(offset) as *const AtomicU64) };
        atomic.store(value.to_le(), Ordering::Relaxed);
    }
}

impl Drop for BusMemory {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}
