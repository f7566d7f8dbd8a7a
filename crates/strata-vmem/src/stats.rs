//! # Allocator Statistics

use strata_core::ByteSize;

/// Point-in-time snapshot of an allocator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmemStats {
    /// Reserved address space
    pub capacity: ByteSize,
    /// Mapping granularity
    pub granularity: ByteSize,
    /// Bytes bound to physical memory
    pub mapped: ByteSize,
    /// Tip offset: live allocations plus unreclaimed holes
    pub tip: ByteSize,
    /// Bytes in free blocks below the tip
    pub free_bytes: ByteSize,
    /// Number of free blocks
    pub free_blocks: usize,
    /// Physical handles held
    pub handles: usize,
    /// Successful allocations
    pub allocs: u64,
    /// Successful frees
    pub frees: u64,
    /// Failed allocation attempts
    pub failed_allocs: u64,
    /// Frees that moved the tip back
    pub retractions: u64,
    /// Highest tip seen
    pub peak_tip: ByteSize,
}

impl VmemStats {
    /// Bytes below the tip that are live
    pub fn live_bytes(&self) -> ByteSize {
        ByteSize::from_bytes(self.tip.as_bytes() - self.free_bytes.as_bytes())
    }

    /// Fraction of the tip region held in holes (0.0 - 1.0)
    pub fn fragmentation(&self) -> f32 {
        if self.tip.is_zero() {
            0.0
        } else {
            self.free_bytes.as_bytes() as f32 / self.tip.as_bytes() as f32
        }
    }
}

/// Running counters kept under the allocator lock
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub allocs: u64,
    pub frees: u64,
    pub failed_allocs: u64,
    pub retractions: u64,
    pub peak_tip: u64,
}

impl Counters {
    pub fn record_alloc(&mut self, tip: u64) {
        self.allocs += 1;
        self.peak_tip = self.peak_tip.max(tip);
    }

    pub fn record_free(&mut self, retracted: bool) {
        self.frees += 1;
        if retracted {
            self.retractions += 1;
        }
    }
}

static_assertions::assert_impl_all!(VmemStats: Send, Sync, Clone);
