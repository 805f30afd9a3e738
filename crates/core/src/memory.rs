//! Per-device memory pools
//!
//! Each emulated device has two pools that are accounted separately:
//!
//! | Space | Default capacity | Holds |
//! |-------|------------------|-------|
//! | L1    | 96 MiB (64 cores x 1.5 MiB) | sharded activations, norm chunks |
//! | DRAM  | 12 GiB           | weights, masks, interleaved activations |
//!
//! Allocations are RAII: the bytes go back to the pool when the
//! [`Allocation`] drops, which happens when the owning tensor is consumed.
//! The pool keeps a high-water mark per space so tests can assert the
//! peak on-chip footprint of a stage.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::tensor::MemorySpace;

/// Capacity of one device's pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub l1_bytes: usize,
    pub dram_bytes: usize,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            l1_bytes: 64 * 1536 * 1024,
            dram_bytes: 12 * 1024 * 1024 * 1024,
        }
    }
}

impl MemoryBudget {
    pub fn capacity(&self, space: MemorySpace) -> usize {
        match space {
            MemorySpace::L1 => self.l1_bytes,
            MemorySpace::Dram => self.dram_bytes,
        }
    }
}

#[derive(Default)]
struct SpaceCounter {
    used: AtomicUsize,
    peak: AtomicUsize,
    live: AtomicUsize,
}

/// Memory accounting for a single device
pub struct DevicePool {
    device_id: usize,
    budget: MemoryBudget,
    l1: SpaceCounter,
    dram: SpaceCounter,
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("device_id", &self.device_id)
            .field("l1_used", &self.used(MemorySpace::L1))
            .field("dram_used", &self.used(MemorySpace::Dram))
            .finish()
    }
}

impl DevicePool {
    pub fn new(device_id: usize, budget: MemoryBudget) -> Self {
        Self {
            device_id,
            budget,
            l1: SpaceCounter::default(),
            dram: SpaceCounter::default(),
        }
    }

    fn counter(&self, space: MemorySpace) -> &SpaceCounter {
        match space {
            MemorySpace::L1 => &self.l1,
            MemorySpace::Dram => &self.dram,
        }
    }

    /// Reserve `bytes` in `space`, failing if the pool would overflow
    pub fn allocate(self: &Arc<Self>, space: MemorySpace, bytes: usize) -> Result<Allocation> {
        let capacity = self.budget.capacity(space);
        let counter = self.counter(space);
        let previous = counter
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&next| next <= capacity)
            })
            .map_err(|used| LayerError::OutOfMemory {
                device_id: self.device_id,
                space,
                requested: bytes,
                available: capacity.saturating_sub(used),
            })?;
        counter.peak.fetch_max(previous + bytes, Ordering::AcqRel);
        counter.live.fetch_add(1, Ordering::AcqRel);
        Ok(Allocation {
            pool: Arc::clone(self),
            space,
            bytes,
        })
    }

    pub fn used(&self, space: MemorySpace) -> usize {
        self.counter(space).used.load(Ordering::Acquire)
    }

    pub fn peak(&self, space: MemorySpace) -> usize {
        self.counter(space).peak.load(Ordering::Acquire)
    }

    /// Number of live allocations in `space`
    pub fn live(&self, space: MemorySpace) -> usize {
        self.counter(space).live.load(Ordering::Acquire)
    }

    /// Reset the high-water mark to current usage
    pub fn reset_peak(&self, space: MemorySpace) {
        let counter = self.counter(space);
        counter
            .peak
            .store(counter.used.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    fn release(&self, space: MemorySpace, bytes: usize) {
        let counter = self.counter(space);
        counter.used.fetch_sub(bytes, Ordering::AcqRel);
        counter.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bytes held in a device pool; released on drop
pub struct Allocation {
    pool: Arc<DevicePool>,
    space: MemorySpace,
    bytes: usize,
}

impl Allocation {
    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Allocation({} bytes in {} of device {})",
            self.bytes, self.space, self.pool.device_id
        )
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.pool.release(self.space, self.bytes);
    }
}
