//! Segment Module
//!
//! Fixed-size blocks stored in memory-mapped segment files.
//!
//! ## Responsibilities
//! - Lay out blocks inside a segment file
//! - Allocate and free blocks through a per-segment free list
//! - Create segment files lazily as the store fills up
//! - Guard block contents with a per-block sequence lock

mod allocator;
mod block;
mod pool;

pub(crate) use allocator::{Segment, SEGMENT_HEADER_SIZE};
pub(crate) use block::{block_size, Block, Probe};
pub(crate) use pool::SegmentPool;

/// Address of a block: segment ordinal and block index within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Location {
    pub segment: u32,
    pub block: u32,
}

impl Location {
    /// Pack into the 64-bit word stored in an index slot
    pub fn pack(self) -> u64 {
        ((self.segment as u64) << 32) | self.block as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            segment: (word >> 32) as u32,
            block: word as u32,
        }
    }
}
