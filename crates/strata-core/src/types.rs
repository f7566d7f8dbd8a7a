//! # STRATA Core Types
//!
//! Fundamental type definitions used by the allocator and its backends.
//!
//! These types provide:
//! - Strong typing for device virtual addresses
//! - Device identifiers
//! - Size and alignment helpers

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// Device Virtual Address
///
/// This is an address in an accelerator's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    /// Create a new device address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment (`alignment` must be a power of two)
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl Add<u64> for DeviceAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<DeviceAddr> for DeviceAddr {
    type Output = u64;

    fn sub(self, rhs: DeviceAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// DEVICE ORDINAL
// =============================================================================

/// Platform ordinal of an accelerator
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceOrdinal(u32);

impl DeviceOrdinal {
    /// Create a device ordinal
    #[inline]
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Get the raw ordinal
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceOrdinal({})", self.0)
    }
}

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 2 MiB (common physical mapping granularity)
    pub const MIB_2: Self = Self(2 * 1024 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from GiB
    #[inline]
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Check for zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Align up to a power-of-two boundary, `None` on overflow
    #[inline]
    pub const fn checked_align_up(self, alignment: u64) -> Option<Self> {
        let mask = alignment - 1;
        match self.0.checked_add(mask) {
            Some(bytes) => Some(Self(bytes & !mask)),
            None => None,
        }
    }

    /// Check that the size is a whole number of `unit`s
    #[inline]
    pub const fn is_multiple_of(self, unit: ByteSize) -> bool {
        unit.0 != 0 && self.0 % unit.0 == 0
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 3] = [
            (1024 * 1024 * 1024, "GiB"),
            (1024 * 1024, "MiB"),
            (1024, "KiB"),
        ];

        for (scale, name) in UNITS {
            if self.0 >= scale {
                let whole = self.0 / scale;
                let tenths = (self.0 % scale) * 10 / scale;
                return if tenths == 0 {
                    write!(f, "{} {}", whole, name)
                } else {
                    write!(f, "{}.{} {}", whole, tenths, name)
                };
            }
        }

        write!(f, "{} B", self.0)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in device virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: DeviceAddr,
    /// End address (exclusive)
    pub end: DeviceAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: DeviceAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: DeviceAddr(start.0 + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end.0 - self.start.0)
    }

    /// Check if `other` lies entirely inside this range
    pub fn encloses(&self, other: &VaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

impl fmt::Display for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_eq_size!(DeviceAddr, u64);
static_assertions::assert_eq_size!(ByteSize, u64);
static_assertions::assert_impl_all!(DeviceAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(VaRange: Send, Sync, Copy);
