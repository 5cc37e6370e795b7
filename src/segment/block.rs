//! Block
//!
//! One fixed-size key/value slot inside a segment.
//!
//! ## Layout
//! ```text
//! ┌────────┬──────────┬─────────┬─────────┬──────────┬──────────┬──────────┐
//! │ Seq(4) │ Occ (4)  │KeyLen(4)│ValLen(4)│NextFree4 │ Rsvd (4) │ Stamp(8) │
//! ├────────┴──────────┴─────────┴─────────┴──────────┴──────────┴──────────┤
//! │ Key bytes [max_key_size]                                               │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │ Value bytes [max_value_size]                                           │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sequence Lock
//! `seq` is odd while a write is in progress. Writers are exclusive: the
//! store only writes blocks it has just allocated and not yet published, and
//! only clears blocks it has already unpublished. Readers copy optimistically
//! and discard the copy when `seq` was odd or changed underneath them.
//!
//! `occupied` drops to 0 as the first step of every write and is set again
//! only after the last byte is in place. A write cut short by a crash leaves
//! a vacant block behind, never a torn entry.

use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::shm::align_up;

/// Size of the block header in bytes
pub(crate) const BLOCK_HEADER_SIZE: usize = 32;

/// Bytes a block occupies for the given key/value capacities
pub(crate) const fn block_size(max_key_size: usize, max_value_size: usize) -> usize {
    align_up(BLOCK_HEADER_SIZE + max_key_size + max_value_size, 8)
}

#[repr(C)]
pub(crate) struct BlockHeader {
    seq: AtomicU32,
    occupied: AtomicU32,
    key_len: AtomicU32,
    value_len: AtomicU32,
    next_free: AtomicU32,
    _reserved: AtomicU32,
    stamp: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Outcome of an optimistic read
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Probe {
    /// A write was in progress; retry
    Busy,
    /// Block holds no key
    Vacant,
    /// Block holds a different key
    Mismatch,
    /// Block holds the key; value copied out
    Match(Vec<u8>),
}

/// Entry recovered by an exclusive scan
pub(crate) struct StoredEntry {
    pub key: Vec<u8>,
    pub stamp: u64,
}

/// View of one block inside a mapped segment
pub(crate) struct Block<'a> {
    header: &'a BlockHeader,
    /// Start of the key bytes
    data: *mut u8,
    key_cap: usize,
    value_cap: usize,
}

impl<'a> Block<'a> {
    /// # Safety
    /// `base` must point at a block of `block_size(key_cap, value_cap)` bytes
    /// inside a live mapping that outlives `'a`.
    pub(crate) unsafe fn from_raw(base: *mut u8, key_cap: usize, value_cap: usize) -> Self {
        Self {
            header: &*(base as *const BlockHeader),
            data: base.add(BLOCK_HEADER_SIZE),
            key_cap,
            value_cap,
        }
    }

    // =========================================================================
    // Allocator fields (guarded by the segment lock)
    // =========================================================================

    pub fn next_free(&self) -> u32 {
        self.header.next_free.load(Ordering::Relaxed)
    }

    pub fn set_next_free(&self, next: u32) {
        self.header.next_free.store(next, Ordering::Relaxed);
    }

    pub fn is_occupied(&self) -> bool {
        self.header.occupied.load(Ordering::Acquire) != 0
    }

    // =========================================================================
    // Optimistic Reads
    // =========================================================================

    /// Compare the stored key with `key` and copy the value out on a match
    pub fn probe(&self, key: &[u8]) -> Probe {
        let start = self.header.seq.load(Ordering::Acquire);
        if start & 1 == 1 {
            return Probe::Busy;
        }

        let result = self.read_unchecked(key);

        fence(Ordering::Acquire);
        if self.header.seq.load(Ordering::Relaxed) != start {
            return Probe::Busy;
        }
        result
    }

    fn read_unchecked(&self, key: &[u8]) -> Probe {
        if self.header.occupied.load(Ordering::Relaxed) == 0 {
            return Probe::Vacant;
        }

        let key_len = self.header.key_len.load(Ordering::Relaxed) as usize;
        let value_len = self.header.value_len.load(Ordering::Relaxed) as usize;
        if key_len > self.key_cap || value_len > self.value_cap {
            // Lengths from a half-finished write
            return Probe::Busy;
        }

        if key_len != key.len() || !self.key_bytes_equal(key) {
            return Probe::Mismatch;
        }

        let mut value = vec![0u8; value_len];
        // Safety: value_len <= value_cap, inside the block
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(self.key_cap), value.as_mut_ptr(), value_len);
        }
        Probe::Match(value)
    }

    fn key_bytes_equal(&self, key: &[u8]) -> bool {
        key.iter().enumerate().all(|(i, &b)| {
            // Safety: i < key.len() <= key_cap; volatile because a writer may race
            unsafe { ptr::read_volatile(self.data.add(i)) == b }
        })
    }

    // =========================================================================
    // Exclusive Access (caller holds the owning stripe lock)
    // =========================================================================

    /// Close a write abandoned by a dead process. Returns true if repaired.
    ///
    /// The block reads as vacant afterwards unless the writer died before
    /// touching anything but `seq`.
    pub fn repair(&self) -> bool {
        let seq = self.header.seq.load(Ordering::Acquire);
        if seq & 1 == 1 {
            self.header.seq.store(seq.wrapping_add(1), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Value stored for `key`, read under exclusive access
    pub fn read_exclusive(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.repair();
        match self.read_unchecked(key) {
            Probe::Match(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the block holds `key`, checked under exclusive access
    pub fn holds_exclusive(&self, key: &[u8]) -> bool {
        self.repair();
        self.is_occupied()
            && self.header.key_len.load(Ordering::Relaxed) as usize == key.len()
            && key.len() <= self.key_cap
            && self.key_bytes_equal(key)
    }

    /// Stored key and stamp, or `None` for a vacant or garbled block
    pub fn entry_exclusive(&self) -> Option<StoredEntry> {
        self.repair();
        if !self.is_occupied() {
            return None;
        }

        let key_len = self.header.key_len.load(Ordering::Relaxed) as usize;
        let value_len = self.header.value_len.load(Ordering::Relaxed) as usize;
        if key_len == 0 || key_len > self.key_cap || value_len > self.value_cap {
            return None;
        }

        let mut key = vec![0u8; key_len];
        // Safety: key_len <= key_cap
        unsafe {
            ptr::copy_nonoverlapping(self.data, key.as_mut_ptr(), key_len);
        }
        Some(StoredEntry {
            key,
            stamp: self.header.stamp.load(Ordering::Relaxed),
        })
    }

    /// Write key and value, marking the block occupied
    pub fn write(&self, key: &[u8], value: &[u8], stamp: u64) {
        debug_assert!(key.len() <= self.key_cap && value.len() <= self.value_cap);

        self.begin_write();
        self.header.occupied.store(0, Ordering::Relaxed);
        self.fill(key, value, stamp);
        self.header.occupied.store(1, Ordering::Release);
        self.end_write();
    }

    fn fill(&self, key: &[u8], value: &[u8], stamp: u64) {
        let old_key_len = (self.header.key_len.load(Ordering::Relaxed) as usize).min(self.key_cap);
        let old_value_len =
            (self.header.value_len.load(Ordering::Relaxed) as usize).min(self.value_cap);

        // Safety: all ranges are within key_cap / value_cap
        unsafe {
            ptr::copy_nonoverlapping(key.as_ptr(), self.data, key.len());
            if old_key_len > key.len() {
                ptr::write_bytes(self.data.add(key.len()), 0, old_key_len - key.len());
            }

            let value_base = self.data.add(self.key_cap);
            ptr::copy_nonoverlapping(value.as_ptr(), value_base, value.len());
            if old_value_len > value.len() {
                ptr::write_bytes(value_base.add(value.len()), 0, old_value_len - value.len());
            }
        }

        self.header.key_len.store(key.len() as u32, Ordering::Relaxed);
        self.header.value_len.store(value.len() as u32, Ordering::Relaxed);
        self.header.stamp.store(stamp, Ordering::Relaxed);
    }

    /// Zero key and value bytes and mark the block vacant
    pub fn clear(&self) {
        self.begin_write();
        self.header.occupied.store(0, Ordering::Relaxed);

        let key_len = self.header.key_len.load(Ordering::Relaxed) as usize;
        let value_len = self.header.value_len.load(Ordering::Relaxed) as usize;
        let (key_len, value_len) = if key_len > self.key_cap || value_len > self.value_cap {
            (self.key_cap, self.value_cap)
        } else {
            (key_len, value_len)
        };

        // Safety: lengths clamped to capacities
        unsafe {
            ptr::write_bytes(self.data, 0, key_len);
            ptr::write_bytes(self.data.add(self.key_cap), 0, value_len);
        }

        self.header.key_len.store(0, Ordering::Relaxed);
        self.header.value_len.store(0, Ordering::Relaxed);
        self.header.stamp.store(0, Ordering::Relaxed);

        self.end_write();
    }

    /// Leave the block mid-write, as a writer that died would
    #[cfg(test)]
    pub(crate) fn abandon_write(&self) {
        self.begin_write();
    }

    /// Die in the middle of writing `key` and `value`, after every byte but
    /// before the block is marked occupied
    #[cfg(test)]
    pub(crate) fn abandon_write_partway(&self, key: &[u8], value: &[u8], stamp: u64) {
        self.begin_write();
        self.header.occupied.store(0, Ordering::Relaxed);
        self.fill(key, value, stamp);
    }

    fn begin_write(&self) {
        let seq = self.header.seq.load(Ordering::Relaxed);
        // An odd value here means a previous writer died mid-write
        let next = if seq & 1 == 1 { seq } else { seq.wrapping_add(1) };
        self.header.seq.store(next, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn end_write(&self) {
        let seq = self.header.seq.load(Ordering::Relaxed);
        self.header.seq.store(seq.wrapping_add(1), Ordering::Release);
    }
}
