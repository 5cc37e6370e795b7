//! Key Index Table
//!
//! Open-addressed hash table living in the control file. Each slot maps a
//! key hash to the location of the block holding the key; the key itself is
//! only stored in the block, so every hit is confirmed against block bytes.
//!
//! ## Slot States
//! ```text
//!   EMPTY ──claim──► RESERVED ──publish──► OCCUPIED ──remove──► TOMBSTONE
//!     ▲                                                            │
//!     └──────────────── rebuild ◄───────── claim (reuse) ◄─────────┘
//! ```
//!
//! Probing is linear from `hash & mask`. A lookup stops at the first EMPTY
//! slot; RESERVED and TOMBSTONE slots are stepped over. Tombstones only turn
//! back into EMPTY slots when the whole index is rebuilt, which the store does
//! as soon as they exceed a quarter of the table.
//!
//! Overwrites swap the location of an OCCUPIED slot in place with
//! [`KeyIndex::relocate`]; the slot never leaves the OCCUPIED state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::segment::Location;

const EMPTY: u32 = 0;
const RESERVED: u32 = 1;
const OCCUPIED: u32 = 2;
const TOMBSTONE: u32 = 3;

/// One index entry (16 bytes)
#[repr(C)]
pub(crate) struct IndexSlot {
    state: AtomicU32,
    hash: AtomicU32,
    location: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<IndexSlot>() == 16);

/// A slot taken by [`KeyIndex::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub slot: usize,
    /// The slot held a tombstone before
    pub reused_tombstone: bool,
}

/// View of the index slots inside the control file
pub(crate) struct KeyIndex<'a> {
    slots: &'a [IndexSlot],
    mask: usize,
}

impl<'a> KeyIndex<'a> {
    /// `slots.len()` must be a power of two
    pub fn new(slots: &'a [IndexSlot]) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        Self {
            slots,
            mask: slots.len().wrapping_sub(1),
        }
    }

    /// Occupied slots whose hash equals `hash`, in probe order
    pub fn candidates(&self, hash: u32) -> Candidates<'a> {
        Candidates {
            slots: self.slots,
            mask: self.mask,
            hash,
            position: hash as usize & self.mask,
            remaining: self.slots.len(),
        }
    }

    /// Publish `location` under `hash` in the first free slot of the probe
    /// sequence. `None` when the table has no free slot left.
    ///
    /// Caller holds the stripe lock for `hash` and has checked the key is
    /// not already present.
    pub fn claim(&self, hash: u32, location: Location) -> Option<Claim> {
        let start = hash as usize & self.mask;

        for step in 0..self.slots.len() {
            let index = (start + step) & self.mask;
            let slot = &self.slots[index];

            let state = slot.state.load(Ordering::Acquire);
            if state != EMPTY && state != TOMBSTONE {
                continue;
            }
            if slot
                .state
                .compare_exchange(state, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Lost to a writer of another stripe; keep probing
                continue;
            }

            slot.hash.store(hash, Ordering::Relaxed);
            slot.location.store(location.pack(), Ordering::Relaxed);
            slot.state.store(OCCUPIED, Ordering::Release);

            return Some(Claim {
                slot: index,
                reused_tombstone: state == TOMBSTONE,
            });
        }

        None
    }

    /// Point an occupied slot at a new block. Caller holds the stripe lock.
    pub fn relocate(&self, slot: usize, location: Location) {
        self.slots[slot]
            .location
            .store(location.pack(), Ordering::Release);
    }

    /// Whether `slot` still maps `hash` to `location`
    ///
    /// Lets an unlocked reader tell a block that was moved or removed under
    /// it from a plain hash collision.
    pub fn points_to(&self, slot: usize, hash: u32, location: Location) -> bool {
        let slot = &self.slots[slot];
        slot.state.load(Ordering::Acquire) == OCCUPIED
            && slot.hash.load(Ordering::Relaxed) == hash
            && slot.location.load(Ordering::Acquire) == location.pack()
    }

    /// Mark a slot returned by [`KeyIndex::candidates`] as removed
    pub fn tombstone(&self, slot: usize) {
        self.slots[slot].state.store(TOMBSTONE, Ordering::Release);
    }

    /// Reset every slot to EMPTY. Caller holds every stripe lock.
    pub fn clear(&self) {
        for slot in self.slots {
            slot.state.store(EMPTY, Ordering::Relaxed);
            slot.hash.store(0, Ordering::Relaxed);
            slot.location.store(0, Ordering::Relaxed);
        }
    }

    /// Count (occupied, tombstone) slots by walking the whole table
    #[cfg(test)]
    pub fn census(&self) -> (usize, usize) {
        self.slots
            .iter()
            .fold((0, 0), |(live, dead), slot| match slot.state.load(Ordering::Relaxed) {
                OCCUPIED => (live + 1, dead),
                TOMBSTONE => (live, dead + 1),
                _ => (live, dead),
            })
    }
}

/// Iterator over `(slot, location)` pairs for one hash
pub(crate) struct Candidates<'a> {
    slots: &'a [IndexSlot],
    mask: usize,
    hash: u32,
    position: usize,
    remaining: usize,
}

impl Iterator for Candidates<'_> {
    type Item = (usize, Location);

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let index = self.position;
            self.position = (self.position + 1) & self.mask;
            self.remaining -= 1;

            let slot = &self.slots[index];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => {
                    self.remaining = 0;
                    return None;
                }
                OCCUPIED if slot.hash.load(Ordering::Relaxed) == self.hash => {
                    let location = Location::unpack(slot.location.load(Ordering::Acquire));
                    return Some((index, location));
                }
                _ => {}
            }
        }
        None
    }
}
