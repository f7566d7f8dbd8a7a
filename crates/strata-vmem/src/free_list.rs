//! # Free Tracker
//!
//! Freed byte ranges below the arena tip, kept coalesced.
//!
//! The set is never searched for a fit. Its only consumer is tip
//! retraction: when a block ends exactly at the tip it is removed and the
//! tip moves back to the block's start.

use alloc::collections::BTreeMap;

use strata_core::{Error, Result};

// =============================================================================
// FREE BLOCK
// =============================================================================

/// A freed, not yet reclaimed range (arena-relative)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset from the arena base
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl FreeBlock {
    /// End offset (exclusive)
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

// =============================================================================
// FREE LIST
// =============================================================================

/// Coalescing set of free ranges
///
/// Invariant: blocks are pairwise disjoint and no two blocks touch.
#[derive(Debug, Default)]
pub struct FreeList {
    /// Offset -> length
    blocks: BTreeMap<u64, u64>,
    /// Sum of all block lengths
    free_bytes: u64,
}

impl FreeList {
    /// Create an empty free list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[offset, offset + length)` as free, merging with neighbours
    ///
    /// Fails with [`Error::DoubleFree`] if the range overlaps a block that is
    /// already free; the set is left untouched in that case.
    pub fn insert(&mut self, offset: u64, length: u64) -> Result<()> {
        debug_assert!(length > 0);
        let end = offset + length;

        if self.overlaps(offset, length) {
            return Err(Error::DoubleFree);
        }

        let prev = self.block_at_or_before(offset);
        let next = self.block_after(offset);
        let mut merged = FreeBlock { offset, length };

        if let Some(prev) = prev.filter(|b| b.end() == offset) {
            self.blocks.remove(&prev.offset);
            merged.offset = prev.offset;
            merged.length += prev.length;
        }

        if let Some(next) = next.filter(|b| b.offset == end) {
            self.blocks.remove(&next.offset);
            merged.length += next.length;
        }

        self.blocks.insert(merged.offset, merged.length);
        self.free_bytes += length;

        Ok(())
    }

    /// Pop every block that ends at `tip`, returning the retracted tip
    pub fn retract(&mut self, mut tip: u64) -> u64 {
        while let Some((&offset, &length)) = self.blocks.last_key_value() {
            if offset + length != tip {
                break;
            }

            self.blocks.pop_last();
            self.free_bytes -= length;
            tip = offset;
        }

        tip
    }

    /// Check whether any byte of `[offset, offset + length)` is free
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        let end = offset + length;
        self.block_at_or_before(offset).is_some_and(|b| b.end() > offset)
            || self.block_after(offset).is_some_and(|b| b.offset < end)
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check for no free blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate blocks in address order
    pub fn iter(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        self.blocks
            .iter()
            .map(|(&offset, &length)| FreeBlock { offset, length })
    }

    fn block_at_or_before(&self, offset: u64) -> Option<FreeBlock> {
        self.blocks
            .range(..=offset)
            .next_back()
            .map(|(&offset, &length)| FreeBlock { offset, length })
    }

    fn block_after(&self, offset: u64) -> Option<FreeBlock> {
        self.blocks
            .range(offset + 1..)
            .next()
            .map(|(&offset, &length)| FreeBlock { offset, length })
    }
}

static_assertions::assert_impl_all!(FreeList: Send, Sync);
static_assertions::assert_impl_all!(FreeBlock: Send, Sync, Copy);
