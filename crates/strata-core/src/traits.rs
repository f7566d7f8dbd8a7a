//! # Sub-Allocator Contract
//!
//! The surface a device memory allocator exposes to the memory manager
//! layered on top of it.

use crate::error::Result;
use crate::types::*;

// =============================================================================
// ALLOCATION
// =============================================================================

/// A block handed out by a sub-allocator
///
/// Not `Clone`: an allocation is released by moving it back into
/// [`SubAllocator::free`]. The fields are public so that callers can rebuild
/// a block they tracked elsewhere; freeing such a value is the same as
/// freeing the raw range it describes and is validated the same way.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an allocation leaks address space unless it is freed"]
pub struct Allocation {
    /// Device virtual address
    pub addr: DeviceAddr,
    /// Bytes received (the padded size, not the requested size)
    pub size: ByteSize,
}

impl Allocation {
    /// Create an allocation record
    pub const fn new(addr: DeviceAddr, size: ByteSize) -> Self {
        Self { addr, size }
    }
}

// =============================================================================
// SUB-ALLOCATOR TRAIT
// =============================================================================

/// Raw device memory provider used by higher-level memory managers
pub trait SubAllocator: Send + Sync {
    /// Allocate at least `num_bytes`
    ///
    /// `alignment` is a size unit, not an address guarantee: the request is
    /// rounded up to a multiple of `max(alignment, granularity)` and the
    /// returned address is aligned to the granularity only. `alignment == 0`
    /// requests no unit beyond the granularity. Returns `None` when the
    /// request cannot be satisfied.
    fn alloc(&self, alignment: u64, num_bytes: u64) -> Option<Allocation>;

    /// Return an allocation
    fn free(&self, allocation: Allocation) -> Result<()>;

    /// Whether adjacent freed blocks are merged by this allocator
    fn supports_coalescing(&self) -> bool;
}

static_assertions::assert_impl_all!(Allocation: Send, Sync);
static_assertions::assert_not_impl_any!(Allocation: Clone, Copy);
