//! # STRATA Core
//!
//! Foundational types shared by the STRATA virtual memory allocator and the
//! driver layers that back it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      strata-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Backend   │  │     Error           │  │
//! │  │ (DeviceAddr,│  │ (reserve,   │  │   Handling          │  │
//! │  │  ByteSize)  │  │  map, ...)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │                   ┌─────────────┐  ┌─────────────────────┐  │
//! │                   │SubAllocator │  │  SimBackend (sim)   │  │
//! │                   └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend trait is the only path to the device. Allocators receive an
//! implementation at construction and never reach into global device state.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod backend;
pub mod error;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports for convenience
pub use backend::{AccessDescriptor, AccessFlags, VmemBackend};
pub use error::{Error, Result};
pub use traits::{Allocation, SubAllocator};
pub use types::{ByteSize, DeviceAddr, DeviceOrdinal, VaRange};
