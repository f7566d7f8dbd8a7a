//! # Virtual Memory Allocator
//!
//! Ties the [`Arena`] and the [`FreeList`] together behind one lock and
//! exposes them through [`SubAllocator`].

use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;
use strata_core::{
    AccessDescriptor, Allocation, ByteSize, DeviceAddr, DeviceOrdinal, Error, Result, SubAllocator,
    VaRange, VmemBackend,
};

use crate::arena::Arena;
use crate::free_list::FreeList;
use crate::options::{AllocVisitor, AllocatorOptions, FreeVisitor};
use crate::stats::{Counters, VmemStats};

// =============================================================================
// STATE
// =============================================================================

struct AllocatorState<H> {
    arena: Arena<H>,
    free_list: FreeList,
    counters: Counters,
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// Device memory allocator over one growable virtual address range
///
/// **This is not a general-purpose allocator.** Allocations are always
/// carved from the tip of the range; freed interior blocks are never reused
/// until every block above them has been freed too, at which point the tip
/// retracts over them. Physical memory stays mapped until the allocator is
/// dropped, so reusing retracted space is free of driver calls.
///
/// Every request is padded to a multiple of the mapping granularity, which
/// is typically 2 MiB. Small allocations belong in a caching allocator
/// layered on top.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(SimBackend::default());
/// let vmem = VirtualMemAllocator::create(
///     AllocatorOptions::default(),
///     DeviceOrdinal::new(0),
///     ByteSize::from_gib(16),
///     backend,
/// )?;
///
/// let block = vmem.alloc(0, 1 << 20).ok_or(Error::OutOfAddressSpace)?;
/// vmem.free(block)?;
/// ```
pub struct VirtualMemAllocator<B: VmemBackend> {
    backend: B,
    device: DeviceOrdinal,
    access: Vec<AccessDescriptor>,
    range: VaRange,
    granularity: ByteSize,
    name: &'static str,
    alloc_visitors: Vec<AllocVisitor>,
    free_visitors: Vec<FreeVisitor>,
    state: Mutex<AllocatorState<B::Handle>>,
}

impl<B: VmemBackend> VirtualMemAllocator<B> {
    /// Reserve `size` bytes of address space for `device`
    ///
    /// `size` is rounded up to the mapping granularity. No physical memory
    /// is committed until the first allocation.
    pub fn create(
        options: AllocatorOptions,
        device: DeviceOrdinal,
        size: ByteSize,
        backend: B,
    ) -> Result<Self> {
        let AllocatorOptions {
            peer_devices,
            alloc_visitors,
            free_visitors,
            name,
        } = options;

        if size.is_zero() {
            return Err(Error::InvalidCapacity);
        }

        let access = Self::access_list(&backend, device, &peer_devices, name);

        let mut granularity = ByteSize::ZERO;
        for descriptor in &access {
            granularity = granularity.max(backend.min_granularity(descriptor.device)?);
        }

        if !granularity.as_bytes().is_power_of_two() {
            log::error!("{}: unusable granularity {}", name, granularity);
            return Err(Error::InvalidGranularity);
        }

        let capacity = size
            .checked_align_up(granularity.as_bytes())
            .ok_or(Error::InvalidCapacity)?;

        let base = backend.reserve_address_range(capacity).map_err(|err| {
            log::error!("{}: failed to reserve {}: {}", name, capacity, err);
            err
        })?;

        let range = VaRange::new(base, capacity);
        if !base.is_aligned(granularity.as_bytes()) {
            log::error!("{}: reservation {} not aligned to {}", name, range, granularity);
            backend.release_address_range(range);
            return Err(Error::MisalignedReservation);
        }

        log::info!(
            "{}: reserved {} at {} on {} (granularity {}, {} peer(s))",
            name,
            capacity,
            base,
            device,
            granularity,
            access.len() - 1
        );

        Ok(Self {
            backend,
            device,
            access,
            range,
            granularity,
            name,
            alloc_visitors,
            free_visitors,
            state: Mutex::new(AllocatorState {
                arena: Arena::new(range, granularity),
                free_list: FreeList::new(),
                counters: Counters::default(),
            }),
        })
    }

    /// Owning device first, then each distinct reachable peer
    fn access_list(
        backend: &B,
        device: DeviceOrdinal,
        peers: &[DeviceOrdinal],
        name: &str,
    ) -> Vec<AccessDescriptor> {
        let mut access = Vec::with_capacity(peers.len() + 1);
        access.push(AccessDescriptor::read_write(device));

        for &peer in peers {
            if access.iter().any(|a| a.device == peer) {
                continue;
            }

            if backend.can_access_peer(device, peer) {
                access.push(AccessDescriptor::read_write(peer));
            } else {
                log::warn!("{}: {} cannot access memory of {}, skipping", name, peer, device);
            }
        }

        access
    }

    /// Allocate at least `num_bytes`
    ///
    /// The request is padded to a multiple of `max(alignment, granularity)`.
    /// `alignment` sizes the block but does not move it: the address is the
    /// current tip, which is aligned to the granularity and nothing more.
    ///
    /// Returns `None` for zero-byte requests, when the reserved range is
    /// exhausted, or when the backend cannot commit more memory. State is
    /// unchanged in every failure case.
    pub fn alloc(&self, alignment: u64, num_bytes: u64) -> Option<Allocation> {
        if num_bytes == 0 {
            return None;
        }

        self.try_alloc(alignment, num_bytes).ok()
    }

    /// Like [`alloc`](Self::alloc), reporting why a request failed
    pub fn try_alloc(&self, alignment: u64, num_bytes: u64) -> Result<Allocation> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let result = state.arena.pad(alignment, num_bytes).and_then(|padded| {
            state
                .arena
                .bump(&self.backend, self.device, &self.access, padded)
                .map(|addr| Allocation::new(addr, padded))
        });

        match result {
            Ok(allocation) => {
                state.counters.record_alloc(state.arena.tip());
                log::trace!(
                    "{}: alloc {} -> {} at {}",
                    self.name,
                    ByteSize::from_bytes(num_bytes),
                    allocation.size,
                    allocation.addr
                );

                for visitor in &self.alloc_visitors {
                    visitor(allocation.addr, self.device, allocation.size);
                }

                Ok(allocation)
            }
            Err(err) => {
                state.counters.failed_allocs += 1;
                log::error!(
                    "{}: failed to allocate {} (align {:#x}, tip {}, mapped {}, capacity {}): {}",
                    self.name,
                    ByteSize::from_bytes(num_bytes),
                    alignment,
                    ByteSize::from_bytes(state.arena.tip()),
                    state.arena.mapped_bytes(),
                    self.capacity(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Return an allocation
    pub fn free(&self, allocation: Allocation) -> Result<()> {
        self.free_range(allocation.addr, allocation.size)
    }

    /// Return `size` bytes starting at `addr`
    ///
    /// The range may span several consecutive allocations. It must be
    /// granule aligned, lie below the tip, and not overlap memory that is
    /// already free; otherwise it is rejected and nothing changes.
    pub fn free_range(&self, addr: DeviceAddr, size: ByteSize) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let offset = state
            .arena
            .offset_of(addr, size)
            .and_then(|offset| state.free_list.insert(offset, size.as_bytes()).map(|()| offset))
            .map_err(|err| {
                log::error!(
                    "{}: rejected free of {} at {}: {}",
                    self.name,
                    size,
                    addr,
                    err
                );
                err
            })?;

        let tip = state.arena.tip();
        let retracted = state.free_list.retract(tip);
        if retracted != tip {
            state.arena.retract(retracted);
            log::debug!(
                "{}: tip retracted from {} to {}",
                self.name,
                ByteSize::from_bytes(tip),
                ByteSize::from_bytes(retracted)
            );
        }

        state.counters.record_free(retracted != tip);
        log::trace!("{}: free {} at offset {:#x}", self.name, size, offset);

        for visitor in &self.free_visitors {
            visitor(addr, self.device, size);
        }

        Ok(())
    }

    /// Snapshot of the allocator's counters and layout
    pub fn stats(&self) -> VmemStats {
        let state = self.state.lock();

        VmemStats {
            capacity: self.capacity(),
            granularity: self.granularity,
            mapped: state.arena.mapped_bytes(),
            tip: ByteSize::from_bytes(state.arena.tip()),
            free_bytes: ByteSize::from_bytes(state.free_list.free_bytes()),
            free_blocks: state.free_list.len(),
            handles: state.arena.handle_count(),
            allocs: state.counters.allocs,
            frees: state.counters.frees,
            failed_allocs: state.counters.failed_allocs,
            retractions: state.counters.retractions,
            peak_tip: ByteSize::from_bytes(state.counters.peak_tip),
        }
    }

    /// Reserved address range
    pub fn address_range(&self) -> VaRange {
        self.range
    }

    /// Reserved capacity
    pub fn capacity(&self) -> ByteSize {
        self.range.size()
    }

    /// Mapping granularity
    pub fn granularity(&self) -> ByteSize {
        self.granularity
    }

    /// Owning device
    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    /// Devices granted access to mapped memory, owner first
    pub fn access_devices(&self) -> impl Iterator<Item = DeviceOrdinal> + '_ {
        self.access.iter().map(|a| a.device)
    }
}

impl<B: VmemBackend> Drop for VirtualMemAllocator<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.arena.tip() != 0 {
            log::warn!(
                "{}: dropped with {} still allocated",
                self.name,
                ByteSize::from_bytes(state.arena.tip() - state.free_list.free_bytes())
            );
        }

        state.arena.release(&self.backend);
    }
}

impl<B: VmemBackend> fmt::Debug for VirtualMemAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemAllocator")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("range", &self.range)
            .field("granularity", &self.granularity)
            .field("peers", &(self.access.len() - 1))
            .finish_non_exhaustive()
    }
}

impl<B> SubAllocator for VirtualMemAllocator<B>
where
    B: VmemBackend + Send + Sync,
    B::Handle: Send,
{
    fn alloc(&self, alignment: u64, num_bytes: u64) -> Option<Allocation> {
        VirtualMemAllocator::alloc(self, alignment, num_bytes)
    }

    fn free(&self, allocation: Allocation) -> Result<()> {
        VirtualMemAllocator::free(self, allocation)
    }

    fn supports_coalescing(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    use strata_core::sim::{SimBackend, SimConfig, SimEvent, SimOp};

    use super::*;

    const G: u64 = 2 << 20;
    const DEV: DeviceOrdinal = DeviceOrdinal::new(0);

    type Vmem = VirtualMemAllocator<Arc<SimBackend>>;

    fn setup(granules: u64) -> (Arc<SimBackend>, Vmem) {
        setup_with(SimConfig::default(), AllocatorOptions::default(), granules)
    }

    fn setup_with(config: SimConfig, options: AllocatorOptions, granules: u64) -> (Arc<SimBackend>, Vmem) {
        let sim = Arc::new(SimBackend::new(config));
        let vmem = VirtualMemAllocator::create(
            options,
            DEV,
            ByteSize::from_bytes(granules * G),
            Arc::clone(&sim),
        )
        .unwrap();
        (sim, vmem)
    }

    fn creates(sim: &SimBackend) -> usize {
        sim.journal()
            .iter()
            .filter(|e| matches!(e, SimEvent::Create { .. }))
            .count()
    }

    #[test]
    fn test_small_request_padded_to_granule() {
        let (_sim, vmem) = setup(4);

        let a = vmem.alloc(0, 1).unwrap();
        assert_eq!(a.size.as_bytes(), G);
        assert!(a.addr.is_aligned(G));
        assert_eq!(a.addr, vmem.address_range().start);
        vmem.free(a).unwrap();
    }

    #[test]
    fn test_consecutive_allocs_contiguous() {
        let (_sim, vmem) = setup(8);

        let a0 = vmem.alloc(0, G).unwrap();
        let a1 = vmem.alloc(0, 3 * G - 1).unwrap();
        let a2 = vmem.alloc(0, G).unwrap();

        assert_eq!(a1.addr, a0.addr + G);
        assert_eq!(a1.size.as_bytes(), 3 * G);
        assert_eq!(a2.addr, a1.addr + 3 * G);

        vmem.free(a2).unwrap();
        vmem.free(a1).unwrap();
        vmem.free(a0).unwrap();
    }

    #[test]
    fn test_alloc_past_capacity_fails() {
        let (sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let a1 = vmem.alloc(0, 2 * G).unwrap();
        assert_eq!(a1.addr, a0.addr + G);

        let before = vmem.stats();
        assert!(vmem.alloc(0, 4 * G).is_none());
        assert_eq!(vmem.try_alloc(0, 4 * G), Err(Error::OutOfAddressSpace));

        let after = vmem.stats();
        assert_eq!(after.tip, before.tip);
        assert_eq!(after.mapped, before.mapped);
        assert_eq!(after.failed_allocs, 2);
        assert_eq!(sim.live_handles(), 3);

        // Exactly the remaining granule still fits
        let a2 = vmem.alloc(0, G).unwrap();
        assert_eq!(a2.addr, a0.addr + 3 * G);
    }

    #[test]
    fn test_tail_reuse() {
        let (_sim, vmem) = setup(4);

        let _a0 = vmem.alloc(0, G).unwrap();
        let a1 = vmem.alloc(0, G).unwrap();
        let a1_addr = a1.addr;

        vmem.free(a1).unwrap();
        let again = vmem.alloc(0, G).unwrap();
        assert_eq!(again.addr, a1_addr);
    }

    #[test]
    fn test_interior_hole_not_reused() {
        let (_sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let a1 = vmem.alloc(0, G).unwrap();
        let a1_addr = a1.addr;

        vmem.free(a0).unwrap();
        let next = vmem.alloc(0, G).unwrap();
        assert_eq!(next.addr, a1_addr + G);

        let stats = vmem.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes.as_bytes(), G);
        assert_eq!(stats.retractions, 0);
    }

    #[test]
    fn test_range_free_spanning_allocations() {
        let (_sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let base = a0.addr;
        let _a1 = vmem.alloc(0, G).unwrap();
        let _a2 = vmem.alloc(0, G).unwrap();

        vmem.free_range(base, ByteSize::from_bytes(3 * G)).unwrap();
        assert_eq!(vmem.stats().tip, ByteSize::ZERO);
        assert_eq!(vmem.alloc(0, G).unwrap().addr, base);
    }

    #[test]
    fn test_out_of_order_frees_fully_retract() {
        let (_sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let base = a0.addr;
        let a1 = vmem.alloc(0, G).unwrap();
        let a2 = vmem.alloc(0, G).unwrap();

        vmem.free(a1).unwrap();
        vmem.free(a0).unwrap();
        assert_eq!(vmem.stats().tip.as_bytes(), 3 * G);

        vmem.free(a2).unwrap();
        let stats = vmem.stats();
        assert_eq!(stats.tip, ByteSize::ZERO);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.peak_tip.as_bytes(), 3 * G);
        assert_eq!(vmem.alloc(0, G).unwrap().addr, base);
    }

    #[test]
    fn test_mapped_prefix_never_shrinks() {
        let (sim, vmem) = setup(4);

        let a = vmem.alloc(0, 3 * G).unwrap();
        vmem.free(a).unwrap();

        let stats = vmem.stats();
        assert_eq!(stats.tip, ByteSize::ZERO);
        assert_eq!(stats.mapped.as_bytes(), 3 * G);
        assert_eq!(sim.live_handles(), 3);

        sim.clear_journal();
        let _b = vmem.alloc(0, 2 * G).unwrap();
        assert_eq!(creates(&sim), 0);
        assert!(sim.journal().is_empty());
    }

    #[test]
    fn test_growth_failure_rolls_back() {
        let (sim, vmem) = setup(8);
        let _a0 = vmem.alloc(0, G).unwrap();

        sim.fail_after(SimOp::Create, 1);
        assert!(vmem.alloc(0, 3 * G).is_none());

        let stats = vmem.stats();
        assert_eq!(stats.tip.as_bytes(), G);
        assert_eq!(stats.mapped.as_bytes(), G);
        assert_eq!(stats.handles, 1);
        assert_eq!(sim.live_handles(), 1);
        assert_eq!(sim.mapped_ranges(), 1);

        // The next attempt succeeds from the same tip
        let a1 = vmem.alloc(0, 3 * G).unwrap();
        assert_eq!(a1.addr, vmem.address_range().start + G);
        assert_eq!(sim.live_handles(), 4);
    }

    #[test]
    fn test_map_failure_rolls_back() {
        let (sim, vmem) = setup(4);

        sim.fail_after(SimOp::Map, 1);
        assert_eq!(vmem.try_alloc(0, 2 * G), Err(Error::MappingFailed));
        assert_eq!(sim.live_handles(), 0);
        assert_eq!(sim.mapped_ranges(), 0);
        assert_eq!(vmem.stats().mapped, ByteSize::ZERO);
    }

    #[test]
    fn test_physical_budget_exhausted() {
        let config = SimConfig::default().with_physical_limit(ByteSize::from_bytes(2 * G));
        let (sim, vmem) = setup_with(config, AllocatorOptions::default(), 8);

        assert_eq!(vmem.try_alloc(0, 3 * G), Err(Error::PhysicalAllocationFailed));
        assert_eq!(sim.physical_in_use(), ByteSize::ZERO);
        assert!(vmem.alloc(0, 2 * G).is_some());
    }

    #[test]
    fn test_capacity_rounded_up() {
        let sim = Arc::new(SimBackend::default());
        let vmem = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DEV,
            ByteSize::from_mib(3),
            Arc::clone(&sim),
        )
        .unwrap();

        assert_eq!(vmem.capacity(), ByteSize::from_mib(4));
        assert_eq!(vmem.granularity(), ByteSize::MIB_2);
        assert_eq!(sim.reservations(), 1);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_create_failures() {
        let sim = Arc::new(SimBackend::new(
            SimConfig::default().with_va_limit(ByteSize::from_mib(4)),
        ));

        let err = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DEV,
            ByteSize::from_mib(8),
            Arc::clone(&sim),
        );
        assert_eq!(err.err(), Some(Error::ReservationFailed));

        let err = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DEV,
            ByteSize::ZERO,
            Arc::clone(&sim),
        );
        assert_eq!(err.err(), Some(Error::InvalidCapacity));

        sim.fail_next(SimOp::Granularity);
        let err = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DEV,
            ByteSize::MIB_2,
            Arc::clone(&sim),
        );
        assert_eq!(err.err(), Some(Error::GranularityQueryFailed));

        let err = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DeviceOrdinal::new(7),
            ByteSize::MIB_2,
            Arc::clone(&sim),
        );
        assert_eq!(err.err(), Some(Error::DeviceNotFound));

        assert_eq!(sim.reservations(), 0);
    }

    #[test]
    fn test_invalid_granularity() {
        let config = SimConfig::default().with_granularity(ByteSize::from_mib(3));
        let sim = Arc::new(SimBackend::new(config));

        let err = VirtualMemAllocator::create(
            AllocatorOptions::default(),
            DEV,
            ByteSize::from_mib(12),
            Arc::clone(&sim),
        );
        assert_eq!(err.err(), Some(Error::InvalidGranularity));
        assert_eq!(sim.reservations(), 0);
    }

    #[test]
    fn test_zero_byte_request() {
        let (sim, vmem) = setup(4);

        assert!(vmem.alloc(0, 0).is_none());
        assert_eq!(vmem.try_alloc(0, 0), Err(Error::ZeroSizedRequest));
        assert_eq!(vmem.stats().tip, ByteSize::ZERO);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_alignment() {
        let (_sim, vmem) = setup(16);

        // Alignment below G changes nothing
        let a = vmem.alloc(4096, 1).unwrap();
        assert_eq!(a.size.as_bytes(), G);

        // Alignment above G pads the request
        let b = vmem.alloc(4 * G, 1).unwrap();
        assert_eq!(b.size.as_bytes(), 4 * G);
        assert_eq!(b.addr, a.addr + G);

        // The address is the tip, not rounded up to the alignment
        assert!(!b.addr.is_aligned(4 * G));
        assert_eq!(vmem.stats().tip.as_bytes(), 5 * G);
        assert_eq!(vmem.stats().free_bytes, ByteSize::ZERO);

        assert_eq!(vmem.try_alloc(3, G), Err(Error::InvalidAlignment));
        assert!(vmem.alloc(3, G).is_none());
    }

    #[test]
    fn test_double_free_rejected() {
        let (_sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let base = a0.addr;
        let _a1 = vmem.alloc(0, G).unwrap();

        vmem.free(a0).unwrap();
        let err = vmem.free_range(base, ByteSize::from_bytes(G));
        assert_eq!(err, Err(Error::DoubleFree));
        assert!(err.unwrap_err().is_contract_violation());

        let stats = vmem.stats();
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.free_bytes.as_bytes(), G);
    }

    #[test]
    fn test_bad_ranges_rejected() {
        let (_sim, vmem) = setup(4);

        let a = vmem.alloc(0, 2 * G).unwrap();
        let base = a.addr;
        let g = ByteSize::from_bytes(G);

        assert_eq!(vmem.free_range(base + 4096, g), Err(Error::MisalignedRange));
        assert_eq!(vmem.free_range(base, ByteSize::from_bytes(G / 2)), Err(Error::MisalignedRange));
        assert_eq!(vmem.free_range(base, ByteSize::ZERO), Err(Error::MisalignedRange));
        assert_eq!(vmem.free_range(base + 2 * G, g), Err(Error::AddressOutOfRange));
        assert_eq!(
            vmem.free_range(DeviceAddr::new(base.raw() - G), g),
            Err(Error::AddressOutOfRange)
        );

        let stats = vmem.stats();
        assert_eq!(stats.tip.as_bytes(), 2 * G);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.frees, 0);

        vmem.free(a).unwrap();
    }

    #[test]
    fn test_drop_releases_everything() {
        let (sim, vmem) = setup(4);
        let base = vmem.address_range().start;

        let a = vmem.alloc(0, 2 * G).unwrap();
        vmem.free(a).unwrap();
        sim.clear_journal();
        drop(vmem);

        let journal = sim.journal();
        assert_eq!(journal.len(), 5);
        assert_eq!(journal[0], SimEvent::Unmap(VaRange::new(base + G, ByteSize::from_bytes(G))));
        assert_eq!(journal[1], SimEvent::Destroy { handle: 2 });
        assert_eq!(journal[2], SimEvent::Unmap(VaRange::new(base, ByteSize::from_bytes(G))));
        assert_eq!(journal[3], SimEvent::Destroy { handle: 1 });
        assert_eq!(
            journal[4],
            SimEvent::Release(VaRange::new(base, ByteSize::from_bytes(4 * G)))
        );

        assert_eq!(sim.live_handles(), 0);
        assert_eq!(sim.mapped_ranges(), 0);
        assert_eq!(sim.reservations(), 0);
        assert_eq!(sim.physical_in_use(), ByteSize::ZERO);
    }

    #[test]
    fn test_drop_survives_unmap_failure() {
        let (sim, vmem) = setup(4);
        let a = vmem.alloc(0, 2 * G).unwrap();
        vmem.free(a).unwrap();

        sim.fail_next(SimOp::Unmap);
        drop(vmem);

        // The failed unmap leaves one stale mapping; everything else is gone
        assert_eq!(sim.live_handles(), 0);
        assert_eq!(sim.physical_in_use(), ByteSize::ZERO);
        assert_eq!(sim.reservations(), 0);
        assert_eq!(sim.mapped_ranges(), 1);
    }

    #[test]
    fn test_rollback_survives_unmap_failure() {
        let (sim, vmem) = setup(8);
        let _a0 = vmem.alloc(0, G).unwrap();

        sim.fail_after(SimOp::Map, 1);
        sim.fail_next(SimOp::Unmap);
        assert_eq!(vmem.try_alloc(0, 3 * G), Err(Error::MappingFailed));

        let stats = vmem.stats();
        assert_eq!(stats.tip.as_bytes(), G);
        assert_eq!(stats.mapped.as_bytes(), G);
        assert_eq!(stats.handles, 1);
        assert_eq!(sim.live_handles(), 1);
        assert_eq!(sim.physical_in_use().as_bytes(), G);
    }

    #[test]
    fn test_rebuilt_allocation_frees_like_range() {
        let (_sim, vmem) = setup(4);

        let a0 = vmem.alloc(0, G).unwrap();
        let base = a0.addr;
        let _a1 = vmem.alloc(0, G).unwrap();
        let _a2 = vmem.alloc(0, G).unwrap();
        drop(a0);

        vmem.free(Allocation::new(base, ByteSize::from_bytes(3 * G))).unwrap();
        assert_eq!(vmem.stats().tip, ByteSize::ZERO);

        let err = vmem.free(Allocation::new(base, ByteSize::from_bytes(G)));
        assert_eq!(err, Err(Error::AddressOutOfRange));
    }

    #[test]
    fn test_peer_access() {
        let (d0, d1, d2) = (DEV, DeviceOrdinal::new(1), DeviceOrdinal::new(2));
        let config = SimConfig::default()
            .with_devices(3)
            .with_device_granularity(d1, ByteSize::from_mib(4))
            .with_peer_link(d0, d1);
        let options = AllocatorOptions::default().with_peers([d1, d1, d2]);
        let (sim, vmem) = setup_with(config, options, 4);

        let devices: Vec<_> = vmem.access_devices().collect();
        assert_eq!(devices, [d0, d1]);
        assert_eq!(vmem.granularity(), ByteSize::from_mib(4));

        sim.clear_journal();
        let a = vmem.alloc(0, 1).unwrap();
        assert_eq!(a.size, ByteSize::from_mib(4));

        let maps: Vec<_> = sim
            .journal()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Map { devices, .. } => Some(devices),
                _ => None,
            })
            .collect();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0], [d0, d1]);
    }

    #[test]
    fn test_visitors() {
        let allocated = Arc::new(AtomicU64::new(0));
        let freed = Arc::new(AtomicU64::new(0));

        let options = {
            let allocated = Arc::clone(&allocated);
            let freed = Arc::clone(&freed);
            AllocatorOptions::default()
                .with_alloc_visitor(move |_, device, size| {
                    assert_eq!(device, DEV);
                    allocated.fetch_add(size.as_bytes(), Ordering::Relaxed);
                })
                .with_free_visitor(move |_, _, size| {
                    freed.fetch_add(size.as_bytes(), Ordering::Relaxed);
                })
        };
        let (_sim, vmem) = setup_with(SimConfig::default(), options, 4);

        let a = vmem.alloc(0, 1).unwrap();
        let b = vmem.alloc(0, G + 1).unwrap();
        assert!(vmem.alloc(0, 4 * G).is_none());
        assert_eq!(allocated.load(Ordering::Relaxed), 3 * G);

        vmem.free(b).unwrap();
        assert_eq!(freed.load(Ordering::Relaxed), 2 * G);

        let addr = a.addr;
        vmem.free(a).unwrap();
        assert!(vmem.free_range(addr, ByteSize::from_bytes(G)).is_err());
        assert_eq!(freed.load(Ordering::Relaxed), 3 * G);
    }

    #[test]
    fn test_stats() {
        let (_sim, vmem) = setup(8);

        let a0 = vmem.alloc(0, G).unwrap();
        let a1 = vmem.alloc(0, 2 * G).unwrap();
        let _a2 = vmem.alloc(0, G).unwrap();
        vmem.free(a0).unwrap();
        vmem.free(a1).unwrap();

        let stats = vmem.stats();
        assert_eq!(stats.capacity.as_bytes(), 8 * G);
        assert_eq!(stats.granularity.as_bytes(), G);
        assert_eq!(stats.mapped.as_bytes(), 4 * G);
        assert_eq!(stats.tip.as_bytes(), 4 * G);
        assert_eq!(stats.free_bytes.as_bytes(), 3 * G);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.handles, 4);
        assert_eq!(stats.allocs, 3);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.retractions, 0);
        assert_eq!(stats.live_bytes().as_bytes(), G);
    }

    #[test]
    fn test_sub_allocator_trait() {
        let (_sim, vmem) = setup(4);
        let sub: &dyn SubAllocator = &vmem;

        assert!(sub.supports_coalescing());
        let a = sub.alloc(0, 1).unwrap();
        sub.free(a).unwrap();
        assert_eq!(vmem.stats().tip, ByteSize::ZERO);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let (sim, vmem) = setup(64);
        let vmem = Arc::new(vmem);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let vmem = Arc::clone(&vmem);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let a = vmem.alloc(0, G).unwrap();
                        let b = vmem.alloc(0, 2 * G).unwrap();
                        vmem.free(b).unwrap();
                        vmem.free(a).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let stats = vmem.stats();
        assert_eq!(stats.tip, ByteSize::ZERO);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.allocs, 400);
        assert_eq!(stats.frees, 400);
        assert!(stats.mapped.as_bytes() <= 12 * G);
        assert_eq!(sim.live_handles() as u64, stats.mapped.as_bytes() / G);
    }
}
