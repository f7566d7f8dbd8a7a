//! # Backend Capability
//!
//! The driver-facing contract consumed by the allocator.
//!
//! A backend wraps one accelerator context. It reserves and releases
//! virtual address ranges, creates and destroys physical memory handles,
//! and maps handles into reserved ranges. All calls are synchronous: the
//! calling thread blocks until the driver returns.

use alloc::sync::Arc;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// ACCESS FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Access a device is granted to a mapped range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Device may read
        const READ = 1 << 0;
        /// Device may write
        const WRITE = 1 << 1;
        /// Read and write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Per-device access applied when a handle is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDescriptor {
    /// Device receiving access
    pub device: DeviceOrdinal,
    /// Granted access
    pub flags: AccessFlags,
}

impl AccessDescriptor {
    /// Read/write access for `device`
    pub const fn read_write(device: DeviceOrdinal) -> Self {
        Self {
            device,
            flags: AccessFlags::READ_WRITE,
        }
    }
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Virtual memory management capability of an accelerator driver
///
/// Implementations are injected into the allocator at construction.
pub trait VmemBackend {
    /// Opaque handle to one block of committed physical memory
    type Handle;

    /// Reserve `size` bytes of virtual address space, returning its base
    fn reserve_address_range(&self, size: ByteSize) -> Result<DeviceAddr>;

    /// Release a range previously returned by `reserve_address_range`
    fn release_address_range(&self, range: VaRange);

    /// Create `size` bytes of physical memory resident on `device`
    fn create_physical_memory(&self, device: DeviceOrdinal, size: ByteSize)
        -> Result<Self::Handle>;

    /// Map `handle` at `addr` and grant the listed access
    fn map_memory(
        &self,
        addr: DeviceAddr,
        handle: &Self::Handle,
        access: &[AccessDescriptor],
    ) -> Result<()>;

    /// Unmap a range previously mapped with `map_memory`
    fn unmap_memory(&self, range: VaRange) -> Result<()>;

    /// Destroy a physical memory handle
    fn destroy_physical_memory(&self, handle: Self::Handle);

    /// Minimum physical mapping granularity of `device`
    fn min_granularity(&self, device: DeviceOrdinal) -> Result<ByteSize>;

    /// Whether `device` can grant `peer` access to its memory
    fn can_access_peer(&self, device: DeviceOrdinal, peer: DeviceOrdinal) -> bool;
}

impl<T: VmemBackend + ?Sized> VmemBackend for Arc<T> {
    type Handle = T::Handle;

    fn reserve_address_range(&self, size: ByteSize) -> Result<DeviceAddr> {
        (**self).reserve_address_range(size)
    }

    fn release_address_range(&self, range: VaRange) {
        (**self).release_address_range(range)
    }

    fn create_physical_memory(
        &self,
        device: DeviceOrdinal,
        size: ByteSize,
    ) -> Result<Self::Handle> {
        (**self).create_physical_memory(device, size)
    }

    fn map_memory(
        &self,
        addr: DeviceAddr,
        handle: &Self::Handle,
        access: &[AccessDescriptor],
    ) -> Result<()> {
        (**self).map_memory(addr, handle, access)
    }

    fn unmap_memory(&self, range: VaRange) -> Result<()> {
        (**self).unmap_memory(range)
    }

    fn destroy_physical_memory(&self, handle: Self::Handle) {
        (**self).destroy_physical_memory(handle)
    }

    fn min_granularity(&self, device: DeviceOrdinal) -> Result<ByteSize> {
        (**self).min_granularity(device)
    }

    fn can_access_peer(&self, device: DeviceOrdinal, peer: DeviceOrdinal) -> bool {
        (**self).can_access_peer(device, peer)
    }
}
