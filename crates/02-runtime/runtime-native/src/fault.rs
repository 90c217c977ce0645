//! Fault injection for the link.
//!
//! A [`FaultyWindow`] wraps the window one side uses to reach the shared
//! region and, according to its [`FaultPlan`], behaves like a bus that has gone
//! away or drops completion sentinels on the floor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use transport::{MemoryWindow, SharedWindow, BUS_ERROR, FRAME_COMPLETE};
use transport_fabric::{FabricResult, MappedWindow, RegionMapper};

/// Switches shared by every window wrapped with the same plan.
#[derive(Debug, Default)]
pub struct FaultPlan {
    severed: AtomicBool,
    hold_sentinels: AtomicBool,
    held: AtomicU64,
}

impl FaultPlan {
    /// A plan with every fault switched off.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reads return all ones and writes are dropped, as on a dead bus.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
    }

    /// Undoes [`FaultPlan::sever`].
    pub fn restore(&self) {
        self.severed.store(false, Ordering::Release);
    }

    /// Whether the bus currently reads as unreachable.
    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }

    /// While set, stores of the frame completion sentinel are swallowed.
    pub fn hold_sentinels(&self, hold: bool) {
        self.hold_sentinels.store(hold, Ordering::Release);
    }

    /// Sentinel stores swallowed so far.
    pub fn held(&self) -> u64 {
        self.held.load(Ordering::Relaxed)
    }
}

/// A [`MemoryWindow`] that misbehaves on request.
pub struct FaultyWindow {
    inner: SharedWindow,
    plan: Arc<FaultPlan>,
}

impl FaultyWindow {
    /// Wraps `inner` under `plan`.
    pub fn new(inner: SharedWindow, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }
}

impl MemoryWindow for FaultyWindow {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        if self.plan.is_severed() {
            dst.fill(0xFF);
        } else {
            self.inner.read_bytes(offset, dst);
        }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        if !self.plan.is_severed() {
            self.inner.write_bytes(offset, src);
        }
    }

    fn load_u32(&self, offset: usize) -> u32 {
        if self.plan.is_severed() {
            u32::MAX
        } else {
            self.inner.load_u32(offset)
        }
    }

    fn store_u32(&self, offset: usize, value: u32) {
        if self.plan.is_severed() {
            return;
        }
        if value == FRAME_COMPLETE && self.plan.hold_sentinels.load(Ordering::Acquire) {
            self.plan.held.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.inner.store_u32(offset, value);
    }

    fn load_u64(&self, offset: usize) -> u64 {
        if self.plan.is_severed() {
            BUS_ERROR
        } else {
            self.inner.load_u64(offset)
        }
    }

    fn store_u64(&self, offset: usize, value: u64) {
        if !self.plan.is_severed() {
            self.inner.store_u64(offset, value);
        }
    }
}

/// Wraps every window another mapper hands out in a [`FaultyWindow`].
pub struct FaultyMapper {
    inner: Arc<dyn RegionMapper>,
    plan: Arc<FaultPlan>,
}

impl FaultyMapper {
    /// Mapper over `inner` whose windows follow `plan`.
    pub fn new(inner: Arc<dyn RegionMapper>, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }
}

impl RegionMapper for FaultyMapper {
    fn map(&self, bus_base: u64, size: u64) -> FabricResult<MappedWindow> {
        let mapped = self.inner.map(bus_base, size)?;
        Ok(MappedWindow {
            local_base: mapped.local_base,
            window: Arc::new(FaultyWindow::new(mapped.window, self.plan.clone())),
        })
    }
}
