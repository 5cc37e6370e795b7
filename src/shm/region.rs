//! Mapped Region
//!
//! A read/write memory map over one file, addressed by byte offset.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{MemKvError, Result};

/// A shared, writable mapping of a whole file
///
/// The file handle is closed right after mapping; the mapping keeps the
/// pages alive. Writes go straight to the page cache, so they are visible
/// to every process mapping the same file and survive the writer's death.
pub(crate) struct MappedRegion {
    /// Keeps the mapping alive, used for flushing
    mmap: MmapMut,
    /// Start of the mapping
    base: NonNull<u8>,
    /// Backing file (for logging)
    path: PathBuf,
}

// The mapping is plain memory shared with other processes anyway; all
// in-process sharing goes through atomics or the block sequence lock.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create a new zero-filled file of `len` bytes and map it
    ///
    /// Returns `Ok(None)` when the file already exists, so racing creators
    /// can tell who won.
    pub fn create_new(path: &Path, len: usize) -> Result<Option<Self>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        file.set_len(len as u64)?;
        Self::map(file, path, len).map(Some)
    }

    /// Map an existing file at its current length
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(MemKvError::Corrupted(format!(
                "{} is empty",
                path.display()
            )));
        }
        Self::map(file, path, len)
    }

    fn map(file: File, path: &Path, len: usize) -> Result<Self> {
        // Safety: the mapping is only accessed through the typed views below,
        // which confine shared mutation to atomics and sequence-locked bytes.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            MemKvError::Corrupted(format!("null mapping for {}", path.display()))
        })?;

        Ok(Self {
            mmap,
            base,
            path: path.to_path_buf(),
        })
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw pointer to `offset`
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len(), "offset {} out of mapping", offset);
        // Safety: bounds checked above
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Typed reference into the mapping
    ///
    /// # Safety
    /// `T` must be valid for any bit pattern (atomics / integers) and every
    /// process must agree on the layout at `offset`.
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        assert!(offset + size_of::<T>() <= self.len());
        let ptr = self.ptr(offset);
        debug_assert_eq!(ptr as usize % align_of::<T>(), 0);
        &*(ptr as *const T)
    }

    /// Typed slice into the mapping
    ///
    /// # Safety
    /// Same contract as [`MappedRegion::get`].
    pub unsafe fn slice<T>(&self, offset: usize, count: usize) -> &[T] {
        assert!(offset + count * size_of::<T>() <= self.len());
        let ptr = self.ptr(offset);
        debug_assert_eq!(ptr as usize % align_of::<T>(), 0);
        std::slice::from_raw_parts(ptr as *const T, count)
    }

    /// Flush the whole mapping to its file
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Flush `len` bytes starting at `offset`
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.mmap.flush_range(offset, len)?;
        Ok(())
    }
}
