//! # Simulated Backend
//!
//! An in-memory [`VmemBackend`] for host-side testing.
//!
//! The simulator hands out address ranges from a fake device address space,
//! accounts physical memory against a budget, validates every map and unmap
//! against its reservations, and records each call in a journal. Faults can
//! be injected per operation to exercise rollback paths.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::backend::{AccessDescriptor, VmemBackend};
use crate::error::{Error, Result};
use crate::types::*;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of devices; ordinals `0..device_count` exist
    pub device_count: u32,
    /// Default mapping granularity
    pub granularity: ByteSize,
    /// Per-device granularity overrides
    pub granularity_overrides: Vec<(DeviceOrdinal, ByteSize)>,
    /// First address handed out by reservations
    pub va_base: DeviceAddr,
    /// Total reservable virtual address space
    pub va_limit: ByteSize,
    /// Total physical memory across all devices
    pub physical_limit: ByteSize,
    /// Directed peer links `(device, peer)`: `device` can grant `peer` access
    pub peer_links: Vec<(DeviceOrdinal, DeviceOrdinal)>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            granularity: ByteSize::MIB_2,
            granularity_overrides: Vec::new(),
            va_base: DeviceAddr::new(0x7f00_0000_0000),
            va_limit: ByteSize::from_gib(1024),
            physical_limit: ByteSize::from_gib(16),
            peer_links: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Set device count
    pub fn with_devices(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    /// Set default granularity
    pub fn with_granularity(mut self, granularity: ByteSize) -> Self {
        self.granularity = granularity;
        self
    }

    /// Override granularity for one device
    pub fn with_device_granularity(mut self, device: DeviceOrdinal, granularity: ByteSize) -> Self {
        self.granularity_overrides.push((device, granularity));
        self
    }

    /// Limit reservable virtual address space
    pub fn with_va_limit(mut self, limit: ByteSize) -> Self {
        self.va_limit = limit;
        self
    }

    /// Limit physical memory
    pub fn with_physical_limit(mut self, limit: ByteSize) -> Self {
        self.physical_limit = limit;
        self
    }

    /// Allow `device` to grant `peer` access
    pub fn with_peer_link(mut self, device: DeviceOrdinal, peer: DeviceOrdinal) -> Self {
        self.peer_links.push((device, peer));
        self
    }

    fn granularity_of(&self, device: DeviceOrdinal) -> ByteSize {
        self.granularity_overrides
            .iter()
            .find(|(d, _)| *d == device)
            .map(|(_, g)| *g)
            .unwrap_or(self.granularity)
    }

    fn max_granularity(&self) -> ByteSize {
        self.granularity_overrides
            .iter()
            .map(|(_, g)| *g)
            .fold(self.granularity, ByteSize::max)
    }
}

// =============================================================================
// JOURNAL
// =============================================================================

/// Backend operation selector for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// `reserve_address_range`
    Reserve,
    /// `min_granularity`
    Granularity,
    /// `create_physical_memory`
    Create,
    /// `map_memory`
    Map,
    /// `unmap_memory`
    Unmap,
}

/// A successful backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Range reserved
    Reserve(VaRange),
    /// Range released
    Release(VaRange),
    /// Physical memory created
    Create {
        /// Handle ID
        handle: u64,
        /// Owning device
        device: DeviceOrdinal,
        /// Size
        size: ByteSize,
    },
    /// Handle mapped
    Map {
        /// Mapped address
        addr: DeviceAddr,
        /// Handle ID
        handle: u64,
        /// Devices granted access
        devices: Vec<DeviceOrdinal>,
    },
    /// Range unmapped
    Unmap(VaRange),
    /// Handle destroyed
    Destroy {
        /// Handle ID
        handle: u64,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Simulated physical memory handle
#[derive(Debug, PartialEq, Eq)]
pub struct SimHandle {
    id: u64,
    device: DeviceOrdinal,
    size: ByteSize,
}

impl SimHandle {
    /// Handle ID (matches journal entries)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning device
    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    /// Size of the physical block
    pub fn size(&self) -> ByteSize {
        self.size
    }
}

// =============================================================================
// SIMULATED BACKEND
// =============================================================================

#[derive(Debug)]
struct Fault {
    op: SimOp,
    skip: u32,
}

#[derive(Debug)]
struct SimState {
    next_va: u64,
    va_reserved: u64,
    reservations: BTreeMap<u64, VaRange>,
    next_handle: u64,
    live_handles: BTreeMap<u64, ByteSize>,
    physical_in_use: u64,
    mappings: BTreeMap<u64, (u64, ByteSize)>,
    faults: Vec<Fault>,
    journal: Vec<SimEvent>,
}

impl SimState {
    /// Consume a pending fault for `op`, if one is due
    fn trip(&mut self, op: SimOp) -> bool {
        let Some(index) = self.faults.iter().position(|f| f.op == op) else {
            return false;
        };

        if self.faults[index].skip == 0 {
            self.faults.remove(index);
            true
        } else {
            self.faults[index].skip -= 1;
            false
        }
    }

    fn reservation_enclosing(&self, range: &VaRange) -> Option<VaRange> {
        self.reservations
            .range(..=range.start.raw())
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.encloses(range))
    }

    fn overlaps_mapping(&self, range: &VaRange) -> bool {
        let before = self
            .mappings
            .range(..=range.start.raw())
            .next_back()
            .is_some_and(|(&addr, &(_, size))| addr + size.as_bytes() > range.start.raw());
        let after = self
            .mappings
            .range(range.start.raw()..)
            .next()
            .is_some_and(|(&addr, _)| addr < range.end.raw());
        before || after
    }
}

/// In-memory virtual memory backend
#[derive(Debug)]
pub struct SimBackend {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimBackend {
    /// Create a simulator
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            next_va: config.va_base.raw(),
            va_reserved: 0,
            reservations: BTreeMap::new(),
            next_handle: 1,
            live_handles: BTreeMap::new(),
            physical_in_use: 0,
            mappings: BTreeMap::new(),
            faults: Vec::new(),
            journal: Vec::new(),
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Let `successes` calls of `op` succeed, then fail the next one
    pub fn fail_after(&self, op: SimOp, successes: u32) {
        self.state.lock().faults.push(Fault {
            op,
            skip: successes,
        });
    }

    /// Fail the next call of `op`
    pub fn fail_next(&self, op: SimOp) {
        self.fail_after(op, 0);
    }

    /// Number of physical handles not yet destroyed
    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles.len()
    }

    /// Number of mapped ranges
    pub fn mapped_ranges(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Physical memory currently committed
    pub fn physical_in_use(&self) -> ByteSize {
        ByteSize::from_bytes(self.state.lock().physical_in_use)
    }

    /// Number of outstanding reservations
    pub fn reservations(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Snapshot of the call journal
    pub fn journal(&self) -> Vec<SimEvent> {
        self.state.lock().journal.clone()
    }

    /// Drop all journal entries
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn device_exists(&self, device: DeviceOrdinal) -> bool {
        device.raw() < self.config.device_count
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl VmemBackend for SimBackend {
    type Handle = SimHandle;

    fn reserve_address_range(&self, size: ByteSize) -> Result<DeviceAddr> {
        let mut state = self.state.lock();

        if size.is_zero() || state.trip(SimOp::Reserve) {
            return Err(Error::ReservationFailed);
        }

        if state.va_reserved + size.as_bytes() > self.config.va_limit.as_bytes() {
            log::trace!("sim: reservation of {} exceeds VA budget", size);
            return Err(Error::ReservationFailed);
        }

        let align = self.config.max_granularity().as_bytes();
        let base = DeviceAddr::new(state.next_va).align_up(align);
        let range = VaRange::new(base, size);

        state.next_va = range.end.raw();
        state.va_reserved += size.as_bytes();
        state.reservations.insert(base.raw(), range);
        state.journal.push(SimEvent::Reserve(range));

        Ok(base)
    }

    fn release_address_range(&self, range: VaRange) {
        let mut state = self.state.lock();

        match state.reservations.remove(&range.start.raw()) {
            Some(reserved) if reserved == range => {
                state.va_reserved -= range.size().as_bytes();
                state.journal.push(SimEvent::Release(range));
            }
            Some(reserved) => {
                log::warn!("sim: release of {} does not match reservation {}", range, reserved);
                state.reservations.insert(reserved.start.raw(), reserved);
            }
            None => log::warn!("sim: release of unknown range {}", range),
        }
    }

    fn create_physical_memory(&self, device: DeviceOrdinal, size: ByteSize) -> Result<SimHandle> {
        if !self.device_exists(device) {
            return Err(Error::DeviceNotFound);
        }

        let mut state = self.state.lock();

        if state.trip(SimOp::Create)
            || state.physical_in_use + size.as_bytes() > self.config.physical_limit.as_bytes()
        {
            return Err(Error::PhysicalAllocationFailed);
        }

        let id = state.next_handle;
        state.next_handle += 1;
        state.physical_in_use += size.as_bytes();
        state.live_handles.insert(id, size);
        state.journal.push(SimEvent::Create {
            handle: id,
            device,
            size,
        });

        Ok(SimHandle { id, device, size })
    }

    fn map_memory(
        &self,
        addr: DeviceAddr,
        handle: &SimHandle,
        access: &[AccessDescriptor],
    ) -> Result<()> {
        let mut state = self.state.lock();

        if state.trip(SimOp::Map) || !state.live_handles.contains_key(&handle.id) {
            return Err(Error::MappingFailed);
        }

        let range = VaRange::new(addr, handle.size);
        if state.reservation_enclosing(&range).is_none() || state.overlaps_mapping(&range) {
            log::trace!("sim: refusing to map {}", range);
            return Err(Error::MappingFailed);
        }

        let granted = access.iter().all(|a| {
            self.device_exists(a.device)
                && (a.device == handle.device || self.can_access_peer(handle.device, a.device))
        });
        if !granted {
            return Err(Error::MappingFailed);
        }

        state.mappings.insert(addr.raw(), (handle.id, handle.size));
        state.journal.push(SimEvent::Map {
            addr,
            handle: handle.id,
            devices: access.iter().map(|a| a.device).collect(),
        });

        Ok(())
    }

    fn unmap_memory(&self, range: VaRange) -> Result<()> {
        let mut state = self.state.lock();

        if state.trip(SimOp::Unmap) {
            return Err(Error::UnmapFailed);
        }

        match state.mappings.get(&range.start.raw()) {
            Some(&(_, size)) if size == range.size() => {
                state.mappings.remove(&range.start.raw());
                state.journal.push(SimEvent::Unmap(range));
                Ok(())
            }
            _ => Err(Error::UnmapFailed),
        }
    }

    fn destroy_physical_memory(&self, handle: SimHandle) {
        let mut state = self.state.lock();

        if state.live_handles.remove(&handle.id).is_some() {
            state.physical_in_use -= handle.size.as_bytes();
            state.journal.push(SimEvent::Destroy { handle: handle.id });
        } else {
            log::warn!("sim: destroy of unknown handle {}", handle.id);
        }
    }

    fn min_granularity(&self, device: DeviceOrdinal) -> Result<ByteSize> {
        if !self.device_exists(device) {
            return Err(Error::DeviceNotFound);
        }

        if self.state.lock().trip(SimOp::Granularity) {
            return Err(Error::GranularityQueryFailed);
        }

        Ok(self.config.granularity_of(device))
    }

    fn can_access_peer(&self, device: DeviceOrdinal, peer: DeviceOrdinal) -> bool {
        self.config.peer_links.contains(&(device, peer))
    }
}
