//! Segment Pool
//!
//! Per-process view of the store's segments. Segment files are created
//! lazily, one at a time, when every existing segment is full. The number of
//! published segments lives in the control header; each process maps newly
//! published segments on demand.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::control::ControlFile;
use crate::error::{MemKvError, Result};
use crate::shm::lock;

use super::{Location, Segment};

pub(crate) struct SegmentPool {
    store_dir: PathBuf,
    control: Arc<ControlFile>,
    /// Segments mapped by this process, indexed by id
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentPool {
    pub fn new(store_dir: PathBuf, control: Arc<ControlFile>) -> Result<Self> {
        let pool = Self {
            store_dir,
            control,
            segments: RwLock::new(Vec::new()),
        };
        pool.refresh()?;
        Ok(pool)
    }

    /// Map every segment published since the last call; returns the mapped count
    pub fn refresh(&self) -> Result<usize> {
        let geometry = self.control.geometry();
        let published = self
            .control
            .header()
            .segment_count
            .load(Ordering::Acquire)
            .min(geometry.segment_limit) as usize;

        {
            let segments = self.segments.read();
            if segments.len() >= published {
                return Ok(segments.len());
            }
        }

        let mut segments = self.segments.write();
        while segments.len() < published {
            let id = segments.len() as u32;
            let segment = Segment::open(&self.store_dir, id, geometry)?;
            tracing::debug!("Mapped segment {}", id);
            segments.push(Arc::new(segment));
        }
        Ok(segments.len())
    }

    /// Segments currently mapped by this process
    pub fn mapped(&self) -> usize {
        self.segments.read().len()
    }

    /// Segment `id`, mapping it first if another process published it.
    /// `None` if no such segment has been published.
    pub fn segment(&self, id: u32) -> Result<Option<Arc<Segment>>> {
        if let Some(segment) = self.segments.read().get(id as usize) {
            return Ok(Some(Arc::clone(segment)));
        }
        self.refresh()?;
        Ok(self.segments.read().get(id as usize).cloned())
    }

    /// Snapshot of all published segments
    pub fn segments(&self) -> Result<Vec<Arc<Segment>>> {
        self.refresh()?;
        Ok(self.segments.read().clone())
    }

    /// Reserve a block, creating a new segment when all are full
    ///
    /// Spare blocks are handed out only once every segment exists and is at
    /// its quota. The store keeps the number of live keys within capacity,
    /// so the spares only ever hold the new copy of an overwritten key.
    pub fn allocate(&self) -> Result<Location> {
        self.refresh()?;
        if let Some(location) = self.allocate_existing(Segment::quota) {
            return Ok(location);
        }

        if let Some(location) = self.grow()? {
            return Ok(location);
        }

        self.allocate_existing(Segment::block_count)
            .ok_or(MemKvError::CapacityExceeded)
    }

    /// Create the next segment and take its first block, `None` at the limit
    fn grow(&self) -> Result<Option<Location>> {
        let header = self.control.header();
        let guard = lock(&header.pool_lock);
        if guard.recovered() {
            self.control.mark_dirty();
        }

        // Someone may have created a segment while we waited
        self.refresh()?;
        if let Some(location) = self.allocate_existing(Segment::quota) {
            return Ok(Some(location));
        }

        let geometry = self.control.geometry();
        let count = header.segment_count.load(Ordering::Acquire);
        if count >= geometry.segment_limit {
            return Ok(None);
        }

        let segment = Arc::new(Segment::create(&self.store_dir, count, geometry)?);
        let block = segment.allocate(segment.quota()).ok_or_else(|| {
            MemKvError::Corrupted(format!("new segment {} has no free block", count))
        })?;

        self.segments.write().push(Arc::clone(&segment));
        header.segment_count.store(count + 1, Ordering::Release);
        tracing::info!(
            "Created segment {} ({} of {})",
            count,
            count + 1,
            geometry.segment_limit
        );

        Ok(Some(Location {
            segment: count,
            block,
        }))
    }

    fn allocate_existing(&self, limit: fn(&Segment) -> u32) -> Option<Location> {
        let segments = self.segments.read();
        segments
            .iter()
            .filter(|segment| segment.has_room(limit(segment)))
            .find_map(|segment| {
                segment.allocate(limit(segment)).map(|block| Location {
                    segment: segment.id(),
                    block,
                })
            })
    }

    /// Return a block to its segment
    pub fn free(&self, location: Location) -> Result<()> {
        if let Some(segment) = self.segment(location.segment)? {
            segment.free(location.block);
        }
        Ok(())
    }

    /// Blocks in use across all mapped segments
    pub fn used_blocks(&self) -> Result<u64> {
        Ok(self
            .segments()?
            .iter()
            .map(|segment| segment.used_count() as u64)
            .sum())
    }

    pub fn flush(&self) -> Result<()> {
        for segment in self.segments()? {
            segment.flush()?;
        }
        Ok(())
    }
}
