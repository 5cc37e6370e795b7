//! Segment
//!
//! A segment file is a fixed array of blocks plus a small header that tracks
//! which blocks are free. All processes share the header through the mapping.
//!
//! ## Layout
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                          │
//! │   magic | version | id | block count | block size          │
//! │   used count | free head | next unused | lock | dirty      │
//! ├────────────────────────────────────────────────────────────┤
//! │ Block 0                                                    │
//! │ Block 1                                                    │
//! │ ...                                                        │
//! │ Block N-1                                                  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Allocation
//! Freed blocks form an intrusive list through `next_free`. Allocation pops
//! the list first and otherwise hands out the next never-used block, so a
//! fresh segment only touches the pages it actually uses.
//!
//! A segment holds `blocks_per_segment` blocks plus spares. The pool fills
//! segments up to their quota and only dips into the spares once no segment
//! can be added; see `SegmentPool::allocate`.

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::control::Geometry;
use crate::error::{MemKvError, Result};
use crate::shm::{lock, segment_path, MappedRegion, ShmLockGuard, LAYOUT_VERSION, MAGIC};

use super::block::{Block, StoredEntry};

/// Bytes reserved for the segment header
pub(crate) const SEGMENT_HEADER_SIZE: usize = 64;

/// End of the free list
const NIL: u32 = u32::MAX;

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    layout_version: AtomicU32,
    segment_id: AtomicU32,
    block_count: AtomicU32,
    block_size: AtomicU32,
    used_count: AtomicU32,
    free_head: AtomicU32,
    next_unused: AtomicU32,
    lock: AtomicU32,
    /// Set when the lock was taken over from a dead process
    dirty: AtomicU32,
    _reserved: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= SEGMENT_HEADER_SIZE);

/// One mapped segment file
pub(crate) struct Segment {
    id: u32,
    region: MappedRegion,
    geometry: Geometry,
}

impl Segment {
    /// Create segment `id`. Caller holds the pool lock.
    ///
    /// A file that already exists but was never published is left over from
    /// a creator that died; it is wiped and initialized again.
    pub fn create(store_dir: &Path, id: u32, geometry: Geometry) -> Result<Self> {
        let path = segment_path(store_dir, id);
        let len = geometry.segment_len();

        let region = match MappedRegion::create_new(&path, len)? {
            Some(region) => region,
            None => {
                tracing::warn!("Reinitializing unpublished segment {}", path.display());
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(len as u64)?;
                drop(file);

                let region = MappedRegion::open(&path)?;
                // Safety: the mapping is exactly `len` bytes
                unsafe { ptr::write_bytes(region.ptr(0), 0, region.len()) };
                region
            }
        };

        let segment = Self {
            id,
            region,
            geometry,
        };

        let header = segment.header();
        header.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.segment_id.store(id, Ordering::Relaxed);
        header.block_count.store(geometry.blocks_per_file(), Ordering::Relaxed);
        header.block_size.store(geometry.block_size, Ordering::Relaxed);
        header.used_count.store(0, Ordering::Relaxed);
        header.free_head.store(NIL, Ordering::Relaxed);
        header.next_unused.store(0, Ordering::Relaxed);
        header.lock.store(0, Ordering::Relaxed);
        header.dirty.store(0, Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);

        Ok(segment)
    }

    /// Map a published segment
    pub fn open(store_dir: &Path, id: u32, geometry: Geometry) -> Result<Self> {
        let path = segment_path(store_dir, id);
        let region = MappedRegion::open(&path)?;

        if region.len() < geometry.segment_len() {
            return Err(MemKvError::Corrupted(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                region.len(),
                geometry.segment_len()
            )));
        }

        let segment = Self {
            id,
            region,
            geometry,
        };

        let header = segment.header();
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(MemKvError::Corrupted(format!(
                "{} has no segment header",
                path.display()
            )));
        }
        let version = header.layout_version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(MemKvError::IncompatibleLayout(format!(
                "{} has layout version {}",
                path.display(),
                version
            )));
        }
        if header.segment_id.load(Ordering::Relaxed) != id
            || header.block_count.load(Ordering::Relaxed) != geometry.blocks_per_file()
            || header.block_size.load(Ordering::Relaxed) != geometry.block_size
        {
            return Err(MemKvError::Corrupted(format!(
                "{} does not match the store geometry",
                path.display()
            )));
        }

        Ok(segment)
    }

    fn header(&self) -> &SegmentHeader {
        // Safety: the mapping is at least SEGMENT_HEADER_SIZE bytes
        unsafe { self.region.get::<SegmentHeader>(0) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Blocks in the file, spares included
    pub fn block_count(&self) -> u32 {
        self.geometry.blocks_per_file()
    }

    /// Blocks the segment contributes to the store's capacity
    pub fn quota(&self) -> u32 {
        self.geometry.blocks_per_segment
    }

    /// View of block `index`, `None` if out of range
    pub fn block(&self, index: u32) -> Option<Block<'_>> {
        if index >= self.block_count() {
            return None;
        }
        let offset = SEGMENT_HEADER_SIZE + index as usize * self.geometry.block_size as usize;
        // Safety: index < block_count, so the block lies inside the mapping
        Some(unsafe {
            Block::from_raw(
                self.region.ptr(offset),
                self.geometry.max_key_size as usize,
                self.geometry.max_value_size as usize,
            )
        })
    }

    pub fn used_count(&self) -> u32 {
        self.header().used_count.load(Ordering::Relaxed)
    }

    /// Unlocked hint; `allocate` has the final say
    pub fn has_room(&self, limit: u32) -> bool {
        self.used_count() < limit.min(self.block_count())
    }

    pub fn is_dirty(&self) -> bool {
        self.header().dirty.load(Ordering::Acquire) != 0
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Take the segment lock, flagging the segment if it was recovered
    pub fn lock(&self) -> ShmLockGuard<'_> {
        let guard = lock(&self.header().lock);
        if guard.recovered() {
            self.header().dirty.store(1, Ordering::Release);
        }
        guard
    }

    /// Reserve a free block, `None` once `limit` blocks are in use
    pub fn allocate(&self, limit: u32) -> Option<u32> {
        let guard = self.lock();
        self.allocate_locked(&guard, limit)
    }

    fn allocate_locked(&self, _guard: &ShmLockGuard<'_>, limit: u32) -> Option<u32> {
        let header = self.header();
        let count = self.block_count();

        let used = header.used_count.load(Ordering::Relaxed);
        if used >= limit.min(count) {
            return None;
        }

        let head = header.free_head.load(Ordering::Relaxed);
        let index = match self.block(head) {
            Some(block) => {
                header.free_head.store(block.next_free(), Ordering::Relaxed);
                block.set_next_free(NIL);
                head
            }
            None => {
                if head != NIL {
                    tracing::warn!("Segment {} has a broken free list", self.id);
                    header.free_head.store(NIL, Ordering::Relaxed);
                    header.dirty.store(1, Ordering::Release);
                }
                let next = header.next_unused.load(Ordering::Relaxed);
                if next >= count {
                    return None;
                }
                header.next_unused.store(next + 1, Ordering::Relaxed);
                next
            }
        };

        header.used_count.store(used + 1, Ordering::Relaxed);
        Some(index)
    }

    /// Clear block `index` and return it to the free list
    pub fn free(&self, index: u32) {
        let Some(block) = self.block(index) else {
            return;
        };
        block.clear();

        let header = self.header();
        let _guard = self.lock();
        block.set_next_free(header.free_head.load(Ordering::Relaxed));
        header.free_head.store(index, Ordering::Relaxed);
        let used = header.used_count.load(Ordering::Relaxed);
        header.used_count.store(used.saturating_sub(1), Ordering::Relaxed);
    }

    // =========================================================================
    // Rebuild Support (caller holds every stripe lock and this segment lock)
    // =========================================================================

    /// Every block that holds a well-formed entry
    pub fn scan_occupied(&self, _guard: &ShmLockGuard<'_>) -> Vec<(u32, StoredEntry)> {
        let limit = self
            .header()
            .next_unused
            .load(Ordering::Relaxed)
            .min(self.block_count());

        (0..limit)
            .filter_map(|index| {
                let block = self.block(index)?;
                block.entry_exclusive().map(|entry| (index, entry))
            })
            .collect()
    }

    /// Rebuild the free list so exactly the blocks flagged in `keep` stay used
    ///
    /// Dropped blocks are cleared. Lower indices end up at the front of the
    /// list.
    pub fn reset_free_list(&self, _guard: &ShmLockGuard<'_>, keep: &[bool]) {
        let header = self.header();
        let limit = header
            .next_unused
            .load(Ordering::Relaxed)
            .min(self.block_count());

        let mut head = NIL;
        let mut used = 0u32;
        for index in (0..limit).rev() {
            let Some(block) = self.block(index) else {
                continue;
            };
            if keep.get(index as usize).copied().unwrap_or(false) {
                used += 1;
            } else {
                block.clear();
                block.set_next_free(head);
                head = index;
            }
        }

        header.next_unused.store(limit, Ordering::Relaxed);
        header.free_head.store(head, Ordering::Relaxed);
        header.used_count.store(used, Ordering::Relaxed);
        header.dirty.store(0, Ordering::Release);
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    pub fn flush_block(&self, index: u32) -> Result<()> {
        let size = self.geometry.block_size as usize;
        self.region
            .flush_range(SEGMENT_HEADER_SIZE + index as usize * size, size)
    }
}
