//! # Arena
//!
//! The reserved address range, its mapped prefix, and the bump tip.
//!
//! The arena grows the mapped prefix one granule at a time and never shrinks
//! it. Growth is all-or-nothing: if any granule of a request fails to map,
//! every granule created during that request is unmapped and destroyed.

use alloc::vec::Vec;

use strata_core::{
    AccessDescriptor, ByteSize, DeviceAddr, DeviceOrdinal, Error, Result, VaRange, VmemBackend,
};

// =============================================================================
// MAPPING
// =============================================================================

/// One physical granule bound into the range
#[derive(Debug)]
struct Mapping<H> {
    range: VaRange,
    handle: H,
}

// =============================================================================
// ARENA
// =============================================================================

/// Reserved device address range with a lazily mapped prefix
#[derive(Debug)]
pub struct Arena<H> {
    /// Reserved range
    range: VaRange,
    /// Mapping granularity
    granularity: ByteSize,
    /// Granules in creation order
    mappings: Vec<Mapping<H>>,
    /// Length of the mapped prefix
    mapped: u64,
    /// End of the live-or-pending region
    tip: u64,
}

impl<H> Arena<H> {
    /// Create an arena over an already reserved range
    ///
    /// `range` must be aligned to `granularity` at both ends.
    pub fn new(range: VaRange, granularity: ByteSize) -> Self {
        debug_assert!(granularity.as_bytes().is_power_of_two());
        debug_assert!(range.start.is_aligned(granularity.as_bytes()));
        debug_assert!(range.size().is_multiple_of(granularity));

        Self {
            range,
            granularity,
            mappings: Vec::new(),
            mapped: 0,
            tip: 0,
        }
    }

    /// Reserved range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Base address
    pub fn base(&self) -> DeviceAddr {
        self.range.start
    }

    /// Mapping granularity
    pub fn granularity(&self) -> ByteSize {
        self.granularity
    }

    /// Reserved capacity
    pub fn capacity(&self) -> ByteSize {
        self.range.size()
    }

    /// Bytes bound to physical memory
    pub fn mapped_bytes(&self) -> ByteSize {
        ByteSize::from_bytes(self.mapped)
    }

    /// Current tip offset
    pub fn tip(&self) -> u64 {
        self.tip
    }

    /// Number of physical handles held
    pub fn handle_count(&self) -> usize {
        self.mappings.len()
    }

    /// Padded size for a request
    ///
    /// Rounds `num_bytes` up to `max(alignment, granularity)`. Both are
    /// powers of two, so the result is a multiple of each.
    pub fn pad(&self, alignment: u64, num_bytes: u64) -> Result<ByteSize> {
        if num_bytes == 0 {
            return Err(Error::ZeroSizedRequest);
        }

        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment);
        }

        let unit = alignment.max(self.granularity.as_bytes());
        ByteSize::from_bytes(num_bytes)
            .checked_align_up(unit)
            .ok_or(Error::OutOfAddressSpace)
    }

    /// Carve `padded` bytes at the tip, mapping more memory if needed
    ///
    /// On failure the tip and the mapped prefix are unchanged.
    pub fn bump<B>(
        &mut self,
        backend: &B,
        device: DeviceOrdinal,
        access: &[AccessDescriptor],
        padded: ByteSize,
    ) -> Result<DeviceAddr>
    where
        B: VmemBackend<Handle = H>,
    {
        debug_assert!(padded.is_multiple_of(self.granularity));

        let end = self
            .tip
            .checked_add(padded.as_bytes())
            .filter(|&end| end <= self.capacity().as_bytes())
            .ok_or(Error::OutOfAddressSpace)?;

        if end > self.mapped {
            self.grow(backend, device, access, end)?;
        }

        let addr = self.range.start + self.tip;
        self.tip = end;

        Ok(addr)
    }

    /// Map granules until the prefix covers `target` bytes
    fn grow<B>(
        &mut self,
        backend: &B,
        device: DeviceOrdinal,
        access: &[AccessDescriptor],
        target: u64,
    ) -> Result<()>
    where
        B: VmemBackend<Handle = H>,
    {
        let keep = self.mappings.len();
        let before = self.mapped;

        while self.mapped < target {
            if let Err(err) = self.map_granule(backend, device, access) {
                log::debug!(
                    "growth from {} to {} failed after {} granule(s): {}",
                    ByteSize::from_bytes(before),
                    ByteSize::from_bytes(target),
                    self.mappings.len() - keep,
                    err
                );
                self.unwind(backend, keep);
                return Err(err);
            }
        }

        log::debug!(
            "mapped prefix grew from {} to {}",
            ByteSize::from_bytes(before),
            ByteSize::from_bytes(self.mapped)
        );

        Ok(())
    }

    fn map_granule<B>(
        &mut self,
        backend: &B,
        device: DeviceOrdinal,
        access: &[AccessDescriptor],
    ) -> Result<()>
    where
        B: VmemBackend<Handle = H>,
    {
        let range = VaRange::new(self.range.start + self.mapped, self.granularity);
        let handle = backend.create_physical_memory(device, self.granularity)?;

        if let Err(err) = backend.map_memory(range.start, &handle, access) {
            backend.destroy_physical_memory(handle);
            return Err(err);
        }

        self.mappings.push(Mapping { range, handle });
        self.mapped += self.granularity.as_bytes();

        Ok(())
    }

    /// Drop granules past the first `keep`, newest first
    fn unwind<B>(&mut self, backend: &B, keep: usize)
    where
        B: VmemBackend<Handle = H>,
    {
        while self.mappings.len() > keep {
            if let Some(mapping) = self.mappings.pop() {
                Self::unbind(backend, mapping);
                self.mapped -= self.granularity.as_bytes();
            }
        }
    }

    fn unbind<B>(backend: &B, mapping: Mapping<H>)
    where
        B: VmemBackend<Handle = H>,
    {
        if let Err(err) = backend.unmap_memory(mapping.range) {
            log::warn!("failed to unmap {}: {}", mapping.range, err);
        }
        backend.destroy_physical_memory(mapping.handle);
    }

    /// Arena offset of a range being freed
    ///
    /// The range must be granule aligned and lie entirely below the tip.
    pub fn offset_of(&self, addr: DeviceAddr, size: ByteSize) -> Result<u64> {
        if size.is_zero() || !size.is_multiple_of(self.granularity) {
            return Err(Error::MisalignedRange);
        }

        if addr < self.range.start {
            return Err(Error::AddressOutOfRange);
        }

        let offset = addr - self.range.start;
        if offset % self.granularity.as_bytes() != 0 {
            return Err(Error::MisalignedRange);
        }

        match offset.checked_add(size.as_bytes()) {
            Some(end) if end <= self.tip => Ok(offset),
            _ => Err(Error::AddressOutOfRange),
        }
    }

    /// Move the tip back to `tip`
    pub fn retract(&mut self, tip: u64) {
        debug_assert!(tip <= self.tip);
        debug_assert!(tip % self.granularity.as_bytes() == 0);
        self.tip = tip;
    }

    /// Unmap and destroy every granule, newest first, then release the range
    pub fn release<B>(&mut self, backend: &B)
    where
        B: VmemBackend<Handle = H>,
    {
        let granules = self.mappings.len();
        self.unwind(backend, 0);
        self.tip = 0;
        backend.release_address_range(self.range);

        log::info!(
            "released {} of virtual memory at {} ({} granule(s) unmapped)",
            self.capacity(),
            self.range.start,
            granules
        );
    }
}
