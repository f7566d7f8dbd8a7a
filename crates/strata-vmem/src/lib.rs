//! # STRATA Virtual Memory Allocator
//!
//! A device memory allocator that reserves one contiguous range of
//! accelerator virtual address space up front and binds physical memory
//! into it only as allocations reach further into the range.
//!
//! ## Architecture
//!
//! ```text
//!  base                                                      base + capacity
//!   │                                                                  │
//!   ▼                                                                  ▼
//!   ┌────────┬──────┬────────┬──────────────┬────────────┬─────────────┐
//!   │  live  │ hole │  live  │     live     │  mapped,   │  reserved,  │
//!   │        │(free)│        │              │  unused    │  unmapped   │
//!   └────────┴──────┴────────┴──────────────┴────────────┴─────────────┘
//!                                           ▲            ▲
//!                                          tip      mapped prefix
//! ```
//!
//! ## Allocation Policy
//!
//! **This is not a general-purpose allocator.** It behaves like a stack
//! with lazy hole accumulation:
//!
//! - Every allocation is carved from the tip, even when interior holes
//!   large enough to hold it exist. Holes are never searched.
//! - Freed ranges are merged with free neighbours. When a merged range ends
//!   at the tip, the tip moves back to its start and the space is reused by
//!   the next allocation.
//! - Physical memory, once mapped, stays mapped until the allocator is
//!   dropped. Reusing retracted space therefore costs no driver calls.
//!
//! Callers that need fine-grained reuse of freed interior blocks should
//! layer a caching allocator over this one.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod arena;
pub mod free_list;
pub mod options;
pub mod stats;

// Re-exports
pub use allocator::VirtualMemAllocator;
pub use arena::Arena;
pub use free_list::{FreeBlock, FreeList};
pub use options::{AllocVisitor, AllocatorOptions, FreeVisitor};
pub use stats::VmemStats;
