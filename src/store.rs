//! Store Module
//!
//! The per-process handle onto a shared store.
//!
//! ## Responsibilities
//! - Create or attach to a store's files and claim a connection slot
//! - Validate keys and values against the store's geometry
//! - put / get / remove through the key index and the block allocator
//! - Rebuild the index from block contents after a crash
//! - Maintenance: reap dead connections, map new segments, flush
//!
//! ## Concurrency Model
//!
//! ```text
//!   put / remove ──► stripe lock (hash >> 26) ──► pool lock ──► segment lock
//!   get          ──► optimistic: index epoch + block sequence lock
//!                    fallback after repeated conflicts: stripe lock
//!   rebuild      ──► all stripe locks ──► all segment locks
//! ```
//!
//! Locks are always taken in the order shown, so no two paths can deadlock.
//! Every lock lives in shared memory and is recovered if its owner dies.
//!
//! A published block is never written again. An overwrite fills a fresh
//! block, points the key's index slot at it and only then frees the old one,
//! so a writer dying at any point leaves the old or the new value readable.

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use crate::config::{validate_name, Config, SyncStrategy};
use crate::connection::{self, Connection};
use crate::control::{unix_millis, ControlFile, Geometry, LOCK_STRIPES};
use crate::error::{MemKvError, Result};
use crate::index::{hash_key, stripe_of};
use crate::manifest::Manifest;
use crate::segment::{Block, Location, Probe, Segment, SegmentPool};
use crate::shm::{self, lock, parse_segment_id, process_alive, ShmLockGuard};

/// Optimistic read attempts before a `get` falls back to the stripe lock
const OPTIMISTIC_ATTEMPTS: usize = 16;

/// How long a writer waits for a spare block held by concurrent overwrites
const SPARE_BLOCK_WAIT: Duration = Duration::from_millis(500);

// =============================================================================
// Reports
// =============================================================================

/// Point-in-time view of a store's shared counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub name: String,
    pub live_keys: u64,
    pub tombstones: u64,
    pub capacity: u64,
    pub used_blocks: u64,
    pub segments: u32,
    pub max_segments: u32,
    pub connections: u32,
    pub max_connections: u32,
    pub index_capacity: u32,
    pub host_pid: Option<u32>,
    pub host_alive: bool,
    pub maintenance_runs: u64,
    pub created_at_ms: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "live_keys: {}", self.live_keys)?;
        writeln!(f, "tombstones: {}", self.tombstones)?;
        writeln!(f, "blocks: {}/{}", self.used_blocks, self.capacity)?;
        writeln!(f, "segments: {}/{}", self.segments, self.max_segments)?;
        writeln!(f, "connections: {}/{}", self.connections, self.max_connections)?;
        writeln!(f, "index_capacity: {}", self.index_capacity)?;
        match self.host_pid {
            Some(pid) => writeln!(
                f,
                "host: {} ({})",
                pid,
                if self.host_alive { "alive" } else { "dead" }
            )?,
            None => writeln!(f, "host: none")?,
        }
        writeln!(f, "maintenance_runs: {}", self.maintenance_runs)?;
        write!(f, "created_at_ms: {}", self.created_at_ms)
    }
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Connection slots released from dead processes
    pub reaped_connections: usize,
    /// Segments newly mapped by this process
    pub segments_mapped: usize,
    /// Whether the index was rebuilt
    pub rebuilt: bool,
    /// Whether mapped files were flushed
    pub flushed: bool,
}

/// Outcome of an index rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Keys indexed after the rebuild
    pub live_keys: u64,
    /// Blocks returned to the free lists (duplicates, leaks, garbage)
    pub reclaimed_blocks: u64,
}

/// Result of a single optimistic lookup
enum Lookup {
    Done(Option<Vec<u8>>),
    Retry,
}

// =============================================================================
// Store
// =============================================================================

/// Handle onto a named shared store
///
/// Any number of handles, in any number of processes, may be open on the
/// same store at once (up to `max_connections`). Dropping the handle
/// releases its connection slot; the data stays.
pub struct Store {
    config: Config,
    store_dir: PathBuf,
    control: Arc<ControlFile>,
    pool: SegmentPool,
    /// Held for the lifetime of the handle
    connection: Connection,
}

impl Store {
    /// Create the store described by `config`, or attach to it if it exists
    ///
    /// Attaching with a geometry different from the existing store's fails
    /// with `IncompatibleLayout`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let geometry = Geometry::from_config(&config)?;
        let store_dir = config.store_dir();
        fs::create_dir_all(&store_dir)?;

        let (control, created) = ControlFile::open_or_create(&store_dir, geometry, || {
            Manifest::new(&config, unix_millis()).write(&store_dir)
        })?;

        let store = Self::assemble(config, store_dir, control)?;
        if created {
            tracing::info!(
                "Created store '{}' at {} ({} blocks of {} bytes)",
                store.config.name,
                store.store_dir.display(),
                geometry.capacity(),
                geometry.block_size
            );
        } else {
            tracing::info!(
                "Attached to store '{}' (connection {})",
                store.config.name,
                store.connection.slot()
            );
        }
        Ok(store)
    }

    /// Open the named store with the default config
    pub fn open_default(name: &str) -> Result<Self> {
        Self::open(Config::named(name))
    }

    /// Attach to an existing store, adopting its geometry
    pub fn attach(data_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        validate_name(name)?;
        let data_dir = data_dir.as_ref();
        let store_dir = shm::store_dir(data_dir, name);

        let control = ControlFile::attach(&store_dir)?;
        let geometry = control.geometry();

        let config = match Manifest::read(&store_dir) {
            Ok(manifest)
                if Geometry::from_config(&manifest.config).ok() == Some(geometry) =>
            {
                Config {
                    name: name.to_string(),
                    data_dir: data_dir.to_path_buf(),
                    ..manifest.config
                }
            }
            Ok(_) => {
                tracing::warn!("Manifest of '{}' disagrees with its control file", name);
                config_from_geometry(name, data_dir, &geometry)
            }
            Err(e) => {
                tracing::warn!("Manifest of '{}' unreadable: {}", name, e);
                config_from_geometry(name, data_dir, &geometry)
            }
        };

        let store = Self::assemble(config, store_dir, control)?;
        tracing::info!(
            "Attached to store '{}' (connection {})",
            name,
            store.connection.slot()
        );
        Ok(store)
    }

    fn assemble(config: Config, store_dir: PathBuf, control: ControlFile) -> Result<Self> {
        let control = Arc::new(control);
        let connection = Connection::admit(Arc::clone(&control))?;
        let pool = SegmentPool::new(store_dir.clone(), Arc::clone(&control))?;

        Ok(Self {
            config,
            store_dir,
            control,
            pool,
            connection,
        })
    }

    /// Detach from the store, releasing this handle's connection slot
    pub fn dispose(self) {
        tracing::info!(
            "Detached from store '{}' (connection {})",
            self.config.name,
            self.connection.slot()
        );
    }

    /// Remove every file of a store nobody is attached to
    ///
    /// Returns `Ok(false)` if the store did not exist.
    pub fn destroy(data_dir: impl AsRef<Path>, name: &str) -> Result<bool> {
        validate_name(name)?;
        let store_dir = shm::store_dir(data_dir.as_ref(), name);
        if !store_dir.exists() {
            return Ok(false);
        }

        match ControlFile::attach(&store_dir) {
            Ok(control) => {
                connection::reap_dead(&control);
                let connections = connection::occupied_slots(&control);
                if connections > 0 {
                    return Err(MemKvError::InUse { connections });
                }
            }
            Err(e) => {
                tracing::warn!("Destroying unreadable store '{}': {}", name, e);
            }
        }

        let control_path = shm::control_path(&store_dir);
        let manifest_path = shm::manifest_path(&store_dir);
        for entry in fs::read_dir(&store_dir)? {
            let path = entry?.path();
            let owned = path == control_path
                || path == manifest_path
                || path == manifest_path.with_extension("tmp")
                || parse_segment_id(&path).is_some();
            if owned {
                fs::remove_file(&path)?;
            }
        }
        fs::remove_dir(&store_dir)?;

        tracing::info!("Destroyed store '{}'", name);
        Ok(true)
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    /// Insert or overwrite `key`
    ///
    /// An overwrite never needs free capacity: the new value goes into a
    /// spare block and the old block is released right after.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if value.len() > self.config.max_value_size {
            return Err(MemKvError::ValueTooLong {
                len: value.len(),
                max: self.config.max_value_size,
            });
        }

        let hash = hash_key(key);
        let _stripe = self.lock_key(hash)?;

        match self.find_locked(key, hash)? {
            Some((slot, old)) => self.overwrite(slot, old, key, value),
            None => self.insert(hash, key, value),
        }
    }

    /// Caller holds the stripe lock and found `key` in `slot`
    fn overwrite(&self, slot: usize, old: Location, key: &[u8], value: &[u8]) -> Result<()> {
        let location = self.allocate_block()?;
        self.write_new_block(location, key, value)?;

        self.control.index().relocate(slot, location);
        self.pool.free(old)?;

        self.sync_written(location, Some(slot))?;
        tracing::trace!(
            "Overwrote {} byte value, moved {:?} -> {:?}",
            value.len(),
            old,
            location
        );
        Ok(())
    }

    /// Caller holds the stripe lock and checked `key` is absent
    fn insert(&self, hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let header = self.control.header();
        let capacity = self.control.geometry().capacity();
        if header
            .live_keys
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |live| {
                (live < capacity).then_some(live + 1)
            })
            .is_err()
        {
            return Err(MemKvError::CapacityExceeded);
        }

        let result = self.insert_reserved(hash, key, value);
        if result.is_err() {
            decrement(&header.live_keys);
        }
        result
    }

    fn insert_reserved(&self, hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let location = self.allocate_block()?;
        self.write_new_block(location, key, value)?;

        let Some(claim) = self.control.index().claim(hash, location) else {
            self.pool.free(location)?;
            tracing::warn!("Key index of '{}' is full", self.config.name);
            return Err(MemKvError::CapacityExceeded);
        };
        if claim.reused_tombstone {
            decrement(&self.control.header().tombstones);
        }

        self.sync_written(location, Some(claim.slot))?;
        tracing::trace!("Inserted {} byte value at {:?}", value.len(), location);
        Ok(())
    }

    /// Allocate a block, waiting briefly for spares other overwrites hold
    ///
    /// Live keys never exceed the capacity, so a store whose quota blocks
    /// are all taken still has its spares. Each overwrite in flight holds one
    /// of them until it frees the key's old block.
    fn allocate_block(&self) -> Result<Location> {
        let deadline = Instant::now() + SPARE_BLOCK_WAIT;
        let backoff = Backoff::new();
        loop {
            match self.pool.allocate() {
                Err(MemKvError::CapacityExceeded) if Instant::now() < deadline => {
                    backoff.snooze();
                }
                Err(MemKvError::CapacityExceeded) => {
                    tracing::warn!(
                        "No free block in '{}' after {:?}",
                        self.config.name,
                        SPARE_BLOCK_WAIT
                    );
                    return Err(MemKvError::CapacityExceeded);
                }
                other => return other,
            }
        }
    }

    /// Fill a freshly allocated block, giving it back if that fails
    fn write_new_block(&self, location: Location, key: &[u8], value: &[u8]) -> Result<()> {
        if let Err(e) = self.write_block(location, key, value) {
            self.pool.free(location)?;
            return Err(e);
        }
        Ok(())
    }

    /// Value stored under `key`, `None` if absent
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let hash = hash_key(key);

        let backoff = Backoff::new();
        for _ in 0..OPTIMISTIC_ATTEMPTS {
            match self.get_optimistic(key, hash)? {
                Lookup::Done(value) => return Ok(value),
                Lookup::Retry => backoff.snooze(),
            }
        }

        tracing::debug!("Optimistic read kept conflicting, taking stripe lock");
        self.get_locked(key, hash)
    }

    /// Copy the value of `key` into `buf`, returning its length
    ///
    /// Fails with `BufferTooSmall` without touching `buf` if the value does
    /// not fit. A buffer of exactly the value's length is enough.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8]) -> Result<usize> {
        let value = self.get(key)?.ok_or(MemKvError::KeyNotFound)?;
        if value.len() > buf.len() {
            return Err(MemKvError::BufferTooSmall {
                needed: value.len(),
                capacity: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    /// Remove `key` and free its block
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let hash = hash_key(key);

        {
            let _stripe = self.lock_key(hash)?;

            let Some((slot, location)) = self.find_locked(key, hash)? else {
                return Err(MemKvError::KeyNotFound);
            };

            self.control.index().tombstone(slot);
            self.pool.free(location)?;

            let header = self.control.header();
            decrement(&header.live_keys);
            header.tombstones.fetch_add(1, Ordering::Relaxed);

            self.sync_written(location, Some(slot))?;
            tracing::trace!("Removed key at {:?}", location);
        }

        if let Err(e) = self.compact_if_needed() {
            tracing::warn!("Compacting index of '{}' failed: {}", self.config.name, e);
        }
        Ok(())
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // =========================================================================
    // Lookup Internals
    // =========================================================================

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(MemKvError::EmptyKey);
        }
        if key.len() > self.config.max_key_size {
            return Err(MemKvError::KeyTooLong {
                len: key.len(),
                max: self.config.max_key_size,
            });
        }
        Ok(())
    }

    fn get_optimistic(&self, key: &[u8], hash: u32) -> Result<Lookup> {
        let Some(epoch) = self.control.epoch_read_begin() else {
            return Ok(Lookup::Retry);
        };

        let index = self.control.index();
        let mut found = None;
        for (slot, location) in index.candidates(hash) {
            let probe = self.with_block(location, |block| block.probe(key))?;
            match probe {
                Some(Probe::Busy) => return Ok(Lookup::Retry),
                Some(Probe::Match(value)) => {
                    found = Some(value);
                    break;
                }
                Some(Probe::Vacant) | Some(Probe::Mismatch) | None => {
                    // The block may have been freed by an overwrite or remove
                    // after we read the slot
                    if !index.points_to(slot, hash, location) {
                        return Ok(Lookup::Retry);
                    }
                }
            }
        }

        if !self.control.epoch_read_validate(epoch) {
            return Ok(Lookup::Retry);
        }
        Ok(Lookup::Done(found))
    }

    fn get_locked(&self, key: &[u8], hash: u32) -> Result<Option<Vec<u8>>> {
        let _stripe = self.lock_key(hash)?;
        for (_, location) in self.control.index().candidates(hash) {
            if let Some(Some(value)) = self.with_block(location, |block| block.read_exclusive(key))? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Index slot and block holding `key`. Caller holds its stripe lock.
    fn find_locked(&self, key: &[u8], hash: u32) -> Result<Option<(usize, Location)>> {
        for (slot, location) in self.control.index().candidates(hash) {
            if self.with_block(location, |block| block.holds_exclusive(key))? == Some(true) {
                return Ok(Some((slot, location)));
            }
        }
        Ok(None)
    }

    /// Run `f` on the block at `location`; `None` if it does not resolve
    fn with_block<R>(&self, location: Location, f: impl FnOnce(&Block<'_>) -> R) -> Result<Option<R>> {
        if location.segment >= self.control.geometry().segment_limit {
            return Ok(None);
        }
        let Some(segment) = self.pool.segment(location.segment)? else {
            return Ok(None);
        };
        Ok(segment.block(location.block).map(|block| f(&block)))
    }

    fn write_block(&self, location: Location, key: &[u8], value: &[u8]) -> Result<()> {
        let stamp = self.control.next_stamp();
        self.with_block(location, |block| block.write(key, value, stamp))?
            .ok_or_else(|| MemKvError::Corrupted(format!("block {:?} does not exist", location)))
    }

    fn sync_written(&self, location: Location, slot: Option<usize>) -> Result<()> {
        if self.config.sync_strategy != SyncStrategy::EveryWrite {
            return Ok(());
        }
        if let Some(segment) = self.pool.segment(location.segment)? {
            segment.flush_block(location.block)?;
        }
        if let Some(slot) = slot {
            self.control.flush_slot(slot)?;
        }
        Ok(())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    fn lock_stripe(&self, stripe: usize) -> ShmLockGuard<'_> {
        let guard = lock(&self.control.stripes()[stripe]);
        if guard.recovered() {
            self.control.mark_dirty();
        }
        guard
    }

    /// Stripe lock for `hash`, finishing a rebuild a dead process abandoned
    fn lock_key(&self, hash: u32) -> Result<ShmLockGuard<'_>> {
        loop {
            let guard = self.lock_stripe(stripe_of(hash));
            if !self.control.rebuild_in_progress() {
                return Ok(guard);
            }
            drop(guard);
            tracing::warn!("Finishing interrupted index rebuild of '{}'", self.config.name);
            self.rebuild()?;
        }
    }

    fn lock_all_stripes(&self) -> Vec<ShmLockGuard<'_>> {
        (0..LOCK_STRIPES).map(|stripe| self.lock_stripe(stripe)).collect()
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Re-derive the key index and free lists from block contents
    ///
    /// Blocks whose writes were cut short read as vacant and are reclaimed.
    /// When two blocks hold the same key the one written last wins, which
    /// settles an overwrite interrupted between writing and freeing.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let _stripes = self.lock_all_stripes();
        self.rebuild_locked()
    }

    fn rebuild_locked(&self) -> Result<RebuildReport> {
        let control = &self.control;
        control.epoch_write_begin();

        let index = control.index();
        index.clear();

        let segments = self.pool.segments()?;
        let guards: Vec<_> = segments.iter().map(|segment| segment.lock()).collect();
        let used_before: u64 = segments.iter().map(|s| s.used_count() as u64).sum();

        let mut winners: HashMap<Vec<u8>, (Location, u64)> = HashMap::new();
        for (segment, guard) in segments.iter().zip(&guards) {
            for (block, entry) in segment.scan_occupied(guard) {
                let location = Location {
                    segment: segment.id(),
                    block,
                };
                match winners.entry(entry.key) {
                    Entry::Vacant(slot) => {
                        slot.insert((location, entry.stamp));
                    }
                    Entry::Occupied(mut slot) => {
                        if entry.stamp > slot.get().1 {
                            slot.insert((location, entry.stamp));
                        }
                    }
                }
            }
        }

        let mut keep: Vec<Vec<bool>> = segments
            .iter()
            .map(|segment| vec![false; segment.block_count() as usize])
            .collect();
        for (key, (location, _)) in &winners {
            if index.claim(hash_key(key), *location).is_none() {
                return Err(MemKvError::Corrupted(
                    "key index too small for live keys".to_string(),
                ));
            }
            keep[location.segment as usize][location.block as usize] = true;
        }

        for ((segment, guard), keep) in segments.iter().zip(&guards).zip(&keep) {
            segment.reset_free_list(guard, keep);
        }
        drop(guards);

        let live_keys = winners.len() as u64;
        let header = control.header();
        header.live_keys.store(live_keys, Ordering::Relaxed);
        header.tombstones.store(0, Ordering::Relaxed);
        control.clear_dirty();
        control.epoch_write_end();

        let report = RebuildReport {
            live_keys,
            reclaimed_blocks: used_before.saturating_sub(live_keys),
        };
        tracing::info!(
            "Rebuilt index of '{}': {} live keys, {} blocks reclaimed",
            self.config.name,
            report.live_keys,
            report.reclaimed_blocks
        );
        Ok(report)
    }

    fn too_many_tombstones(&self) -> bool {
        let tombstones = self.control.header().tombstones.load(Ordering::Relaxed);
        tombstones.saturating_mul(4) > self.control.geometry().index_capacity as u64
    }

    /// Rebuild once tombstones take up a quarter of the index, so lookup
    /// chains keep ending at an empty slot without a host running
    fn compact_if_needed(&self) -> Result<()> {
        if !self.too_many_tombstones() {
            return Ok(());
        }

        let _stripes = self.lock_all_stripes();
        // Another handle may have compacted while we waited
        if self.too_many_tombstones() {
            tracing::debug!("Compacting index of '{}'", self.config.name);
            self.rebuild_locked()?;
        }
        Ok(())
    }

    /// Why the index should be rebuilt, if it should. Caller holds every stripe.
    fn rebuild_reason(&self, segments: &[Arc<Segment>]) -> Option<&'static str> {
        let control = &self.control;
        let header = control.header();

        if control.rebuild_in_progress() {
            return Some("interrupted rebuild");
        }
        if control.is_dirty() {
            return Some("lock recovered from a dead process");
        }
        if segments.iter().any(|segment| segment.is_dirty()) {
            return Some("segment lock recovered from a dead process");
        }

        if self.too_many_tombstones() {
            return Some("too many tombstones");
        }

        let used: u64 = segments.iter().map(|s| s.used_count() as u64).sum();
        if used != header.live_keys.load(Ordering::Relaxed) {
            return Some("block accounting drift");
        }
        None
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One maintenance pass
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let reaped_connections = connection::reap_dead(&self.control);

        let mapped_before = self.pool.mapped();
        let segments_mapped = self.pool.refresh()?.saturating_sub(mapped_before);

        let rebuilt = {
            let _stripes = self.lock_all_stripes();
            let segments = self.pool.segments()?;
            match self.rebuild_reason(&segments) {
                Some(reason) => {
                    tracing::info!("Rebuilding index of '{}': {}", self.config.name, reason);
                    self.rebuild_locked()?;
                    true
                }
                None => false,
            }
        };

        let flushed = self.config.sync_strategy == SyncStrategy::Deferred;
        if flushed {
            self.flush()?;
        }

        self.control
            .header()
            .maintenance_runs
            .fetch_add(1, Ordering::Relaxed);

        let report = MaintenanceReport {
            reaped_connections,
            segments_mapped,
            rebuilt,
            flushed,
        };
        tracing::debug!("Maintenance of '{}': {:?}", self.config.name, report);
        Ok(report)
    }

    /// Flush every mapped file to disk
    pub fn flush(&self) -> Result<()> {
        self.control.flush()?;
        self.pool.flush()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let header = self.control.header();
        let geometry = self.control.geometry();
        let host_pid = header.host_pid.load(Ordering::Acquire);
        let segments = self.pool.refresh()? as u32;

        Ok(StoreStats {
            name: self.config.name.clone(),
            live_keys: header.live_keys.load(Ordering::Relaxed),
            tombstones: header.tombstones.load(Ordering::Relaxed),
            capacity: geometry.capacity(),
            used_blocks: self.pool.used_blocks()?,
            segments,
            max_segments: geometry.segment_limit,
            connections: header.connection_count.load(Ordering::Relaxed),
            max_connections: geometry.connection_limit,
            index_capacity: geometry.index_capacity,
            host_pid: (host_pid != 0).then_some(host_pid),
            host_alive: process_alive(host_pid),
            maintenance_runs: header.maintenance_runs.load(Ordering::Relaxed),
            created_at_ms: self.control.created_at_ms(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Record this process as the store's host
    pub(crate) fn claim_host(&self) -> Option<u32> {
        let previous = self
            .control
            .header()
            .host_pid
            .swap(std::process::id(), Ordering::AcqRel);
        (previous != 0 && previous != std::process::id()).then_some(previous)
    }

    /// Clear the host record if it still names this process
    pub(crate) fn release_host(&self) {
        let _ = self.control.header().host_pid.compare_exchange(
            std::process::id(),
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// Config reconstructed from a control file when the manifest is unusable
fn config_from_geometry(name: &str, data_dir: &Path, geometry: &Geometry) -> Config {
    Config {
        name: name.to_string(),
        data_dir: data_dir.to_path_buf(),
        max_key_size: geometry.max_key_size as usize,
        max_value_size: geometry.max_value_size as usize,
        max_blocks_per_segment: geometry.blocks_per_segment as usize,
        max_segment_count: geometry.segment_limit as usize,
        max_connections: geometry.connection_limit as usize,
        ..Config::default()
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
        Some(count.saturating_sub(1))
    });
}
