//! Control File
//!
//! The store-wide shared metadata, one memory-mapped file per store.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (256 bytes)                                          │
//! │   magic | init pid | layout version | geometry | counters   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Lock stripes [AtomicU32; 64]                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Connection table [AtomicU32; max_connections] (owner PIDs)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Key index [IndexSlot; index_capacity] (64-byte aligned)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Creation
//! The first process to `create_new` the file writes its PID into
//! `init_pid`, fills the header, runs the creation hook (manifest) and
//! publishes `magic` last. Everyone else waits for `magic`. If the creator
//! dies before publishing, the next opener takes over initialization. A file
//! without `magic` or creator PID that nobody touched for `INIT_TIMEOUT` is
//! treated the same way: its creator died before recording itself.

use std::fs::{self, OpenOptions};
use std::mem::size_of;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::{MemKvError, Result};
use crate::index::{IndexSlot, KeyIndex};
use crate::segment::{block_size, SEGMENT_HEADER_SIZE};
use crate::shm::{align_up, control_path, process_alive, MappedRegion, LAYOUT_VERSION, MAGIC};

// =============================================================================
// Constants
// =============================================================================

/// Bytes reserved for the header
pub(crate) const CONTROL_HEADER_SIZE: usize = 256;

/// Number of stripe locks guarding the key index
pub(crate) const LOCK_STRIPES: usize = 64;

/// Smallest index table
const MIN_INDEX_CAPACITY: usize = 16;

/// Largest segment file
const SEGMENT_BYTES_LIMIT: u64 = 1 << 40;

/// Blocks per segment file beyond the advertised capacity. Overwrites write
/// the new value into a free block before releasing the old one, so a full
/// store needs somewhere to put it.
pub(crate) const SPARE_BLOCKS_PER_SEGMENT: u32 = 1;

/// How long to wait for another process to finish creating the store
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for initialization
const INIT_POLL: Duration = Duration::from_millis(1);

// =============================================================================
// Geometry
// =============================================================================

/// The layout-defining part of a config, fixed when the store is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub max_key_size: u32,
    pub max_value_size: u32,
    pub blocks_per_segment: u32,
    pub segment_limit: u32,
    pub connection_limit: u32,
    pub index_capacity: u32,
    pub block_size: u32,
}

impl Geometry {
    /// Derive the layout for a validated config
    pub fn from_config(config: &Config) -> Result<Self> {
        let block_size = block_size(config.max_key_size, config.max_value_size);
        let index_capacity = config
            .capacity()
            .saturating_mul(2)
            .max(MIN_INDEX_CAPACITY)
            .next_power_of_two();

        let segment_bytes = SEGMENT_HEADER_SIZE as u64
            + (config.max_blocks_per_segment as u64 + SPARE_BLOCKS_PER_SEGMENT as u64)
                * block_size as u64;
        if segment_bytes > SEGMENT_BYTES_LIMIT || segment_bytes > usize::MAX as u64 {
            return Err(MemKvError::InvalidConfig(format!(
                "segment of {} bytes is too large",
                segment_bytes
            )));
        }

        let to_u32 = |field: &str, value: usize| {
            u32::try_from(value).map_err(|_| {
                MemKvError::InvalidConfig(format!("{} {} does not fit the layout", field, value))
            })
        };

        Ok(Self {
            max_key_size: to_u32("max_key_size", config.max_key_size)?,
            max_value_size: to_u32("max_value_size", config.max_value_size)?,
            blocks_per_segment: to_u32("max_blocks_per_segment", config.max_blocks_per_segment)?,
            segment_limit: to_u32("max_segment_count", config.max_segment_count)?,
            connection_limit: to_u32("max_connections", config.max_connections)?,
            index_capacity: to_u32("index capacity", index_capacity)?,
            block_size: to_u32("block size", block_size)?,
        })
    }

    /// Number of keys the store can hold
    pub fn capacity(&self) -> u64 {
        self.blocks_per_segment as u64 * self.segment_limit as u64
    }

    /// Blocks in one segment file, spares included
    pub fn blocks_per_file(&self) -> u32 {
        self.blocks_per_segment + SPARE_BLOCKS_PER_SEGMENT
    }

    /// Size of one segment file
    pub fn segment_len(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.blocks_per_file() as usize * self.block_size as usize
    }

    fn is_sane(&self) -> bool {
        self.max_key_size > 0
            && self.max_value_size > 0
            && self.blocks_per_segment > 0
            && self.blocks_per_segment < u32::MAX
            && self.segment_limit > 0
            && self.connection_limit > 0
            && self.index_capacity.is_power_of_two()
            && self.index_capacity as u64 >= self.capacity()
            && self.block_size as usize
                == block_size(self.max_key_size as usize, self.max_value_size as usize)
    }
}

// =============================================================================
// Header
// =============================================================================

#[repr(C)]
pub(crate) struct ControlHeader {
    magic: AtomicU64,
    init_pid: AtomicU32,
    layout_version: AtomicU32,

    max_key_size: AtomicU32,
    max_value_size: AtomicU32,
    blocks_per_segment: AtomicU32,
    segment_limit: AtomicU32,
    connection_limit: AtomicU32,
    index_capacity: AtomicU32,
    block_size: AtomicU32,

    /// Published segments; grows under `pool_lock`
    pub segment_count: AtomicU32,
    /// Guards segment creation
    pub pool_lock: AtomicU32,
    /// Odd while the index is being rebuilt
    index_epoch: AtomicU32,
    /// PID of the running host process, 0 if none
    pub host_pid: AtomicU32,
    /// Live connection slots
    pub connection_count: AtomicU32,
    /// Set when a lock was recovered from a dead process
    dirty: AtomicU32,
    _reserved: AtomicU32,

    /// Indexed keys plus inserts in flight; never exceeds the capacity
    pub live_keys: AtomicU64,
    pub tombstones: AtomicU64,
    write_stamp: AtomicU64,
    pub maintenance_runs: AtomicU64,
    created_at_ms: AtomicU64,
}

const _: () = assert!(size_of::<ControlHeader>() <= CONTROL_HEADER_SIZE);

/// Byte offsets of the sections following the header
#[derive(Debug, Clone, Copy)]
struct Offsets {
    stripes: usize,
    connections: usize,
    index: usize,
    len: usize,
}

impl Offsets {
    fn of(geometry: &Geometry) -> Self {
        let stripes = CONTROL_HEADER_SIZE;
        let connections = stripes + LOCK_STRIPES * size_of::<AtomicU32>();
        let index = align_up(
            connections + geometry.connection_limit as usize * size_of::<AtomicU32>(),
            64,
        );
        let len = index + geometry.index_capacity as usize * size_of::<IndexSlot>();
        Self {
            stripes,
            connections,
            index,
            len,
        }
    }
}

/// Result of opening a control file that another process created
enum Existing {
    Ready(ControlFile),
    /// Creator died before publishing; caller now owns initialization
    Abandoned,
}

// =============================================================================
// Control File
// =============================================================================

/// Mapped control file of one store
pub(crate) struct ControlFile {
    region: MappedRegion,
    geometry: Geometry,
    offsets: Offsets,
}

impl ControlFile {
    /// Create the control file, or attach to the existing one
    ///
    /// `on_create` runs only in the creating process, before the header is
    /// published. Returns whether this call created the store.
    pub fn open_or_create<F>(store_dir: &Path, geometry: Geometry, on_create: F) -> Result<(Self, bool)>
    where
        F: FnOnce() -> Result<()>,
    {
        let path = control_path(store_dir);
        let len = Offsets::of(&geometry).len;

        if let Some(region) = MappedRegion::create_new(&path, len)? {
            let control = Self::initialize(region, geometry, false, on_create)?;
            return Ok((control, true));
        }

        match Self::open_existing(&path, true)? {
            Existing::Ready(control) => {
                control.check_geometry(&geometry)?;
                Ok((control, false))
            }
            Existing::Abandoned => {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(len as u64)?;
                drop(file);

                let region = MappedRegion::open(&path)?;
                let control = Self::initialize(region, geometry, true, on_create)?;
                Ok((control, true))
            }
        }
    }

    /// Attach to an existing store, adopting its geometry
    pub fn attach(store_dir: &Path) -> Result<Self> {
        let path = control_path(store_dir);
        match Self::open_existing(&path, false)? {
            Existing::Ready(control) => Ok(control),
            Existing::Abandoned => Err(MemKvError::Corrupted(format!(
                "store at {} was never initialized",
                store_dir.display()
            ))),
        }
    }

    fn initialize<F>(region: MappedRegion, geometry: Geometry, wipe: bool, on_create: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()>,
    {
        // Safety: the region is at least CONTROL_HEADER_SIZE bytes
        let header = unsafe { region.get::<ControlHeader>(0) };
        header.init_pid.store(std::process::id(), Ordering::Release);

        if wipe {
            // Safety: everything after the header lies within the mapping
            unsafe {
                ptr::write_bytes(
                    region.ptr(CONTROL_HEADER_SIZE),
                    0,
                    region.len() - CONTROL_HEADER_SIZE,
                );
            }
        }

        header.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.max_key_size.store(geometry.max_key_size, Ordering::Relaxed);
        header.max_value_size.store(geometry.max_value_size, Ordering::Relaxed);
        header.blocks_per_segment.store(geometry.blocks_per_segment, Ordering::Relaxed);
        header.segment_limit.store(geometry.segment_limit, Ordering::Relaxed);
        header.connection_limit.store(geometry.connection_limit, Ordering::Relaxed);
        header.index_capacity.store(geometry.index_capacity, Ordering::Relaxed);
        header.block_size.store(geometry.block_size, Ordering::Relaxed);

        for counter in [
            &header.segment_count,
            &header.pool_lock,
            &header.index_epoch,
            &header.host_pid,
            &header.connection_count,
            &header.dirty,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [
            &header.live_keys,
            &header.tombstones,
            &header.write_stamp,
            &header.maintenance_runs,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        header.created_at_ms.store(unix_millis(), Ordering::Relaxed);

        on_create()?;

        header.magic.store(MAGIC, Ordering::Release);
        Self::from_initialized(region)
    }

    fn open_existing(path: &Path, takeover: bool) -> Result<Existing> {
        let deadline = Instant::now() + INIT_TIMEOUT;
        let me = std::process::id();

        loop {
            let stale = untouched_for(path, INIT_TIMEOUT)?;
            if stale && takeover {
                Self::grow_to_header(path)?;
            }

            match Self::map_if_sized(path)? {
                Some(region) => {
                    // Safety: map_if_sized guarantees the header fits
                    let header = unsafe { region.get::<ControlHeader>(0) };
                    if header.magic.load(Ordering::Acquire) == MAGIC {
                        return Self::from_initialized(region).map(Existing::Ready);
                    }

                    let creator = header.init_pid.load(Ordering::Acquire);
                    let abandoned = if creator == 0 {
                        stale
                    } else {
                        !process_alive(creator)
                    };
                    if abandoned {
                        if !takeover {
                            return Ok(Existing::Abandoned);
                        }
                        if header
                            .init_pid
                            .compare_exchange(creator, me, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            tracing::warn!(
                                "Creator process {} of {} died during initialization, taking over",
                                creator,
                                path.display()
                            );
                            return Ok(Existing::Abandoned);
                        }
                    }
                }
                None if stale => return Ok(Existing::Abandoned),
                None => {}
            }

            if Instant::now() >= deadline {
                return Err(MemKvError::Timeout(format!(
                    "{} was not initialized within {:?}",
                    path.display(),
                    INIT_TIMEOUT
                )));
            }
            std::thread::sleep(INIT_POLL);
        }
    }

    /// Extend a file cut short before its header was written
    fn grow_to_header(path: &Path) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() < CONTROL_HEADER_SIZE as u64 {
            file.set_len(CONTROL_HEADER_SIZE as u64)?;
        }
        Ok(())
    }

    /// Map the file once it is at least as long as the header
    fn map_if_sized(path: &Path) -> Result<Option<MappedRegion>> {
        let len = fs::metadata(path)?.len();
        if len < CONTROL_HEADER_SIZE as u64 {
            return Ok(None);
        }
        MappedRegion::open(path).map(Some)
    }

    fn from_initialized(region: MappedRegion) -> Result<Self> {
        // Safety: callers checked the header fits
        let header = unsafe { region.get::<ControlHeader>(0) };

        let version = header.layout_version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(MemKvError::IncompatibleLayout(format!(
                "{} has layout version {}, expected {}",
                region.path().display(),
                version,
                LAYOUT_VERSION
            )));
        }

        let geometry = Geometry {
            max_key_size: header.max_key_size.load(Ordering::Relaxed),
            max_value_size: header.max_value_size.load(Ordering::Relaxed),
            blocks_per_segment: header.blocks_per_segment.load(Ordering::Relaxed),
            segment_limit: header.segment_limit.load(Ordering::Relaxed),
            connection_limit: header.connection_limit.load(Ordering::Relaxed),
            index_capacity: header.index_capacity.load(Ordering::Relaxed),
            block_size: header.block_size.load(Ordering::Relaxed),
        };
        if !geometry.is_sane() {
            return Err(MemKvError::Corrupted(format!(
                "{} has an invalid geometry: {:?}",
                region.path().display(),
                geometry
            )));
        }

        let offsets = Offsets::of(&geometry);
        if region.len() < offsets.len {
            return Err(MemKvError::Corrupted(format!(
                "{} is {} bytes, expected {}",
                region.path().display(),
                region.len(),
                offsets.len
            )));
        }

        Ok(Self {
            region,
            geometry,
            offsets,
        })
    }

    fn check_geometry(&self, requested: &Geometry) -> Result<()> {
        if &self.geometry != requested {
            return Err(MemKvError::IncompatibleLayout(format!(
                "store exists with {:?}, requested {:?}",
                self.geometry, requested
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn header(&self) -> &ControlHeader {
        // Safety: validated in from_initialized
        unsafe { self.region.get::<ControlHeader>(0) }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn stripes(&self) -> &[AtomicU32] {
        // Safety: offsets derived from the validated geometry
        unsafe { self.region.slice(self.offsets.stripes, LOCK_STRIPES) }
    }

    pub fn connections(&self) -> &[AtomicU32] {
        // Safety: offsets derived from the validated geometry
        unsafe {
            self.region
                .slice(self.offsets.connections, self.geometry.connection_limit as usize)
        }
    }

    pub fn index(&self) -> KeyIndex<'_> {
        // Safety: offsets derived from the validated geometry
        let slots = unsafe {
            self.region
                .slice::<IndexSlot>(self.offsets.index, self.geometry.index_capacity as usize)
        };
        KeyIndex::new(slots)
    }

    pub fn created_at_ms(&self) -> u64 {
        self.header().created_at_ms.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Counters and Flags
    // =========================================================================

    /// Next write stamp; orders duplicate blocks during a rebuild
    pub fn next_stamp(&self) -> u64 {
        self.header().write_stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_dirty(&self) {
        self.header().dirty.store(1, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.header().dirty.load(Ordering::Acquire) != 0
    }

    pub fn clear_dirty(&self) {
        self.header().dirty.store(0, Ordering::Release);
    }

    // =========================================================================
    // Index Epoch (sequence lock over the whole index)
    // =========================================================================

    /// Epoch to validate against, or `None` while a rebuild is running
    pub fn epoch_read_begin(&self) -> Option<u32> {
        let epoch = self.header().index_epoch.load(Ordering::Acquire);
        (epoch & 1 == 0).then_some(epoch)
    }

    /// Whether no rebuild started since `epoch_read_begin`
    pub fn epoch_read_validate(&self, epoch: u32) -> bool {
        fence(Ordering::Acquire);
        self.header().index_epoch.load(Ordering::Relaxed) == epoch
    }

    /// True while a rebuild is running or was abandoned mid-way
    pub fn rebuild_in_progress(&self) -> bool {
        self.header().index_epoch.load(Ordering::Acquire) & 1 == 1
    }

    /// Caller holds every stripe lock
    pub fn epoch_write_begin(&self) {
        let epoch = &self.header().index_epoch;
        let current = epoch.load(Ordering::Relaxed);
        if current & 1 == 0 {
            epoch.store(current.wrapping_add(1), Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    pub fn epoch_write_end(&self) {
        let epoch = &self.header().index_epoch;
        let current = epoch.load(Ordering::Relaxed);
        epoch.store(current.wrapping_add(1), Ordering::Release);
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    pub fn flush_slot(&self, slot: usize) -> Result<()> {
        let size = size_of::<IndexSlot>();
        self.region.flush_range(self.offsets.index + slot * size, size)
    }
}

/// Whether `path` was last modified at least `age` ago
fn untouched_for(path: &Path, age: Duration) -> Result<bool> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().map_or(false, |elapsed| elapsed >= age))
}

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
