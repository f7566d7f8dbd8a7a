//! # STRATA Error Handling
//!
//! Error types for the allocator and the backends it drives.
//!
//! Errors are grouped by the phase that produces them:
//! - reservation errors end allocator construction
//! - growth errors turn into a failed allocation with state unchanged
//! - contract errors reject a bad free without touching the free set

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// STRATA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// STRATA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Reservation Errors
    // =========================================================================
    /// Backend could not reserve the virtual address range
    ReservationFailed,
    /// Backend could not report the mapping granularity
    GranularityQueryFailed,
    /// Granularity is zero or not a power of two
    InvalidGranularity,
    /// Requested address space size is zero or overflows
    InvalidCapacity,
    /// Backend returned a base address not aligned to the granularity
    MisalignedReservation,
    /// Device ordinal unknown to the backend
    DeviceNotFound,

    // =========================================================================
    // Growth Errors
    // =========================================================================
    /// Request does not fit in the remaining reserved address space
    OutOfAddressSpace,
    /// Backend could not create physical memory
    PhysicalAllocationFailed,
    /// Backend could not map physical memory into the range
    MappingFailed,
    /// Alignment is not zero or a power of two
    InvalidAlignment,
    /// Zero-byte request
    ZeroSizedRequest,

    // =========================================================================
    // Contract Errors (bad free)
    // =========================================================================
    /// Range does not lie below the current tip of the arena
    AddressOutOfRange,
    /// Range offset or length is not a multiple of the granularity
    MisalignedRange,
    /// Range overlaps memory that is already free
    DoubleFree,

    // =========================================================================
    // Teardown Errors
    // =========================================================================
    /// Backend could not unmap a range
    UnmapFailed,
}

impl Error {
    /// Check if the error reports caller misuse of `free`
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AddressOutOfRange | Self::MisalignedRange | Self::DoubleFree
        )
    }

    /// Check if the error can only occur while constructing an allocator
    pub const fn is_reservation_error(&self) -> bool {
        matches!(
            self,
            Self::ReservationFailed
                | Self::GranularityQueryFailed
                | Self::InvalidGranularity
                | Self::InvalidCapacity
                | Self::MisalignedReservation
                | Self::DeviceNotFound
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Reservation
            Self::ReservationFailed => write!(f, "virtual address reservation failed"),
            Self::GranularityQueryFailed => write!(f, "granularity query failed"),
            Self::InvalidGranularity => write!(f, "granularity is not a power of two"),
            Self::InvalidCapacity => write!(f, "invalid address space size"),
            Self::MisalignedReservation => write!(f, "reservation base is misaligned"),
            Self::DeviceNotFound => write!(f, "device not found"),

            // Growth
            Self::OutOfAddressSpace => write!(f, "out of reserved address space"),
            Self::PhysicalAllocationFailed => write!(f, "physical memory allocation failed"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::InvalidAlignment => write!(f, "alignment is not a power of two"),
            Self::ZeroSizedRequest => write!(f, "zero-byte request"),

            // Contract
            Self::AddressOutOfRange => write!(f, "range outside allocated region"),
            Self::MisalignedRange => write!(f, "range not aligned to granularity"),
            Self::DoubleFree => write!(f, "range already free"),

            // Teardown
            Self::UnmapFailed => write!(f, "memory unmapping failed"),
        }
    }
}
