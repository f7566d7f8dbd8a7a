//! # Allocator Options
//!
//! Construction-time configuration: peer devices, visitor callbacks, and a
//! name used in log lines.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use strata_core::{ByteSize, DeviceAddr, DeviceOrdinal};

/// Callback run after every successful allocation
///
/// Receives the base address, the owning device and the padded size.
/// Runs while the allocator lock is held and must not call back into the
/// allocator.
pub type AllocVisitor = Box<dyn Fn(DeviceAddr, DeviceOrdinal, ByteSize) + Send + Sync>;

/// Callback run after every successful free, with the same arguments as
/// [`AllocVisitor`]
pub type FreeVisitor = Box<dyn Fn(DeviceAddr, DeviceOrdinal, ByteSize) + Send + Sync>;

/// Default allocator name
pub const DEFAULT_NAME: &str = "strata_vmem";

/// Allocator configuration
pub struct AllocatorOptions {
    /// Devices that should also be able to access the memory
    pub peer_devices: Vec<DeviceOrdinal>,
    /// Allocation visitors, run in registration order
    pub alloc_visitors: Vec<AllocVisitor>,
    /// Free visitors, run in registration order
    pub free_visitors: Vec<FreeVisitor>,
    /// Name used in log output
    pub name: &'static str,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            peer_devices: Vec::new(),
            alloc_visitors: Vec::new(),
            free_visitors: Vec::new(),
            name: DEFAULT_NAME,
        }
    }
}

impl AllocatorOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Request peer access for one device
    pub fn with_peer(mut self, device: DeviceOrdinal) -> Self {
        self.peer_devices.push(device);
        self
    }

    /// Request peer access for several devices
    pub fn with_peers<I>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = DeviceOrdinal>,
    {
        self.peer_devices.extend(devices);
        self
    }

    /// Add an allocation visitor
    pub fn with_alloc_visitor<F>(mut self, visitor: F) -> Self
    where
        F: Fn(DeviceAddr, DeviceOrdinal, ByteSize) + Send + Sync + 'static,
    {
        self.alloc_visitors.push(Box::new(visitor));
        self
    }

    /// Add a free visitor
    pub fn with_free_visitor<F>(mut self, visitor: F) -> Self
    where
        F: Fn(DeviceAddr, DeviceOrdinal, ByteSize) + Send + Sync + 'static,
    {
        self.free_visitors.push(Box::new(visitor));
        self
    }

    /// Set the log name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl fmt::Debug for AllocatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorOptions")
            .field("peer_devices", &self.peer_devices)
            .field("alloc_visitors", &self.alloc_visitors.len())
            .field("free_visitors", &self.free_visitors.len())
            .field("name", &self.name)
            .finish()
    }
}

static_assertions::assert_impl_all!(AllocatorOptions: Send, Sync);
