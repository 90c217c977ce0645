use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use transport::{align_up, BusMemory, MemoryWindow, RegionInit, TransportResult};
use transport_fabric::{FabricError, FabricResult, MappedWindow, RegionMapper};

const PAGE: usize = 4096;
const REGION_ALIGN: usize = 64;

/// Simulated physical address space shared by every domain in the process.
///
/// Regions are handed out at increasing page-aligned bus addresses; mapping a
/// bus range hands back the very same memory, which is what makes the two
/// sides of a loopback link see each other's writes.
#[derive(Debug)]
pub struct BusMap {
    next: Mutex<u64>,
    regions: RwLock<BTreeMap<u64, Arc<BusMemory>>>,
}

impl BusMap {
    /// Address space whose first region lands at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            next: Mutex::new(base),
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Allocates a zeroed region of `len` bytes.
    pub fn allocate(&self, len: usize) -> TransportResult<Arc<BusMemory>> {
        let mut next = self.next.lock();
        let memory = Arc::new(BusMemory::new_aligned(
            len,
            REGION_ALIGN,
            *next,
            RegionInit::Zeroed,
        )?);
        self.regions.write().insert(*next, memory.clone());
        *next += align_up(len, PAGE) as u64;
        tracing::debug!(bus = %format_args!("{:#x}", memory.bus_address()), len, "bus region allocated");
        Ok(memory)
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Returns true when nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

impl RegionMapper for BusMap {
    fn map(&self, bus_base: u64, size: u64) -> FabricResult<MappedWindow> {
        let regions = self.regions.read();
        let memory = regions.get(&bus_base).ok_or(FabricError::MapFailed {
            base: bus_base,
            size,
            reason: "no region at bus address",
        })?;
        if (memory.len() as u64) < size {
            return Err(FabricError::MapFailed {
                base: bus_base,
                size,
                reason: "region smaller than requested",
            });
        }
        Ok(MappedWindow {
            local_base: memory.local_address(),
            window: memory.clone(),
        })
    }
}
