//! Shared Memory Module
//!
//! Plumbing shared by the control file and the segment files.
//!
//! ## Responsibilities
//! - Create/open memory-mapped files and hand out typed views into them
//! - Cross-process lock words with dead-owner recovery
//! - File naming inside a store directory
//!
//! Every structure placed in mapped memory is `#[repr(C)]` and made of
//! atomics, so all processes can share `&` references into the mapping.
//! Raw byte payloads (keys and values) are only touched under the
//! block sequence-lock protocol in `segment::block`.

mod lock;
mod paths;
mod region;

pub(crate) use lock::{lock, process_alive, ShmLockGuard};
pub(crate) use paths::{
    control_path, manifest_path, parse_segment_id, segment_path, store_dir,
};
pub(crate) use region::MappedRegion;

/// Marks a region whose header has been fully written ("MEMKV\0v1")
pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"MEMKV\0v1");

/// Current on-disk layout version
pub const LAYOUT_VERSION: u32 = 2;

/// Round `value` up to a multiple of `align` (power of two)
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
