//! # File Contract and Shared Helpers
//!
//! The [`StorageFile`] trait is the contract the database layer consumes: a
//! growable byte region with copy-based read/write entry points. Zones (the
//! zero-copy windows) live on the concrete types because their lifetimes are
//! tied to the variant's lock.
//!
//! This module also holds the pieces both mmap variants share: open-mode
//! resolution from [`OpenFlags`], the advisory whole-file lock, and the
//! [`MapRegion`] wrapper whose `Empty` variant represents a zero-length
//! mapping without resorting to a sentinel pointer.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};

bitflags! {
    /// Bit-sum options for [`StorageFile::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Do not create the file if it is missing.
        const NO_CREATE = 1 << 0;
        /// Truncate an existing file on open.
        const TRUNCATE = 1 << 1;
        /// Skip the advisory whole-file lock.
        const NO_LOCK = 1 << 2;
        /// Fail immediately if the advisory lock is contended.
        const NO_WAIT = 1 << 3;
        /// Request device-level durability on close and synchronize.
        const SYNC = 1 << 4;
    }
}

/// A growable byte region backed by a file.
///
/// All methods take `&self`; implementations synchronize internally so a
/// single handle can be shared across threads. Every operation returns an
/// explicit status and never panics.
pub trait StorageFile: Send + Sync {
    /// Opens or creates the file at `path` per `flags`.
    fn open(&self, path: &Path, writable: bool, flags: OpenFlags) -> Result<()>;

    /// Unmaps, truncates to the logical size (if writable), releases the
    /// advisory lock, and closes the handle. Failures from every step are
    /// folded into one status.
    fn close(&self) -> Result<()>;

    /// Reads exactly `buf.len()` bytes at `off`. Fails `Infeasible` if the
    /// range extends past the logical size.
    fn read(&self, off: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads up to `size` bytes at `off`, returning an empty vector on any
    /// failure.
    fn read_simple(&self, off: u64, size: usize) -> Vec<u8>;

    /// Writes `buf` at `off`, growing the region as needed.
    fn write(&self, off: u64, buf: &[u8]) -> Result<()>;

    /// Appends `buf` at the tail, returning the offset it was written to.
    fn append(&self, buf: &[u8]) -> Result<u64>;

    /// Reserves `inc_size` bytes at the tail without writing them,
    /// returning the pre-expansion size.
    fn expand(&self, inc_size: u64) -> Result<u64>;

    /// Sets the logical size, remapping and shrinking the on-disk length.
    fn truncate(&self, new_size: u64) -> Result<()>;

    /// Adjusts only the logical size. Fails `Infeasible` if `new_size`
    /// exceeds the mapped extent.
    fn truncate_fakely(&self, new_size: u64) -> Result<()>;

    /// Clamps the mapped extent to the logical size and resizes the on-disk
    /// file; with `hard`, flushes the mapping and then the file handle.
    fn synchronize(&self, hard: bool) -> Result<()>;

    /// The logical size in bytes.
    fn size(&self) -> Result<u64>;

    /// Adjusts the growth policy. Fails `Precondition` once open.
    fn set_allocation_strategy(&self, init_size: u64, inc_factor: f64) -> Result<()>;

    /// Copies the growth policy onto another file object.
    fn copy_properties(&self, other: &dyn StorageFile) -> Result<()>;

    /// Pins the mapped region in memory. Retained as a success-returning
    /// no-op.
    fn lock_memory(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    /// The path the file was opened at.
    fn path(&self) -> Result<PathBuf>;

    /// Renames the underlying file and updates the stored path.
    fn rename(&self, new_path: &Path) -> Result<()>;

    /// Makes subsequent `path()`/`rename()` calls fail `Precondition`.
    fn disable_path_operations(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn is_writable(&self) -> bool;
}

/// A mapping that may be absent.
///
/// A zero-length file maps to `Empty`; nothing ever dereferences or offsets
/// a pointer of an empty region.
pub(crate) enum MapRegion {
    Empty,
    Mapped(MmapRaw),
}

impl MapRegion {
    pub(crate) fn len(&self) -> usize {
        match self {
            MapRegion::Empty => 0,
            MapRegion::Mapped(raw) => raw.len(),
        }
    }

    /// Base pointer of a live mapping, or `None` when empty.
    pub(crate) fn as_ptr(&self) -> Option<*mut u8> {
        match self {
            MapRegion::Empty => None,
            MapRegion::Mapped(raw) => Some(raw.as_mut_ptr()),
        }
    }

    /// Flushes dirty pages in `[0, len)` back to the file.
    pub(crate) fn flush_range(&self, len: usize) -> Result<()> {
        match self {
            MapRegion::Empty => Ok(()),
            MapRegion::Mapped(raw) => {
                let len = len.min(raw.len());
                raw.flush_range(0, len)
                    .map_err(|e| Error::sys("msync", e))
            }
        }
    }
}

/// Opens the backing file per the open mode, returning it with its size.
pub(crate) fn open_backing_file(
    path: &Path,
    writable: bool,
    flags: OpenFlags,
) -> Result<(File, u64)> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    if writable {
        options.write(true);
        if !flags.contains(OpenFlags::NO_CREATE) {
            options.create(true);
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }
    }
    let file = options
        .open(path)
        .map_err(|e| Error::sys("open", e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::sys("fstat", e))?
        .len();
    Ok((file, size))
}

/// Takes the advisory whole-file lock unless `NO_LOCK` is set.
pub(crate) fn lock_backing_file(file: &File, writable: bool, flags: OpenFlags) -> Result<()> {
    if flags.contains(OpenFlags::NO_LOCK) {
        return Ok(());
    }
    let mut operation = if writable {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    if flags.contains(OpenFlags::NO_WAIT) {
        operation |= libc::LOCK_NB;
    }
    // SAFETY: flock on an owned, open descriptor has no memory preconditions.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc != 0 {
        return Err(Error::sys("flock", io::Error::last_os_error()));
    }
    Ok(())
}

/// Releases the advisory lock taken by [`lock_backing_file`].
pub(crate) fn unlock_backing_file(file: &File) -> Result<()> {
    // SAFETY: flock on an owned, open descriptor has no memory preconditions.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc != 0 {
        return Err(Error::sys("flock", io::Error::last_os_error()));
    }
    Ok(())
}

/// Maps `len` bytes of `file`, extending the on-disk length first so no
/// mapped page lies past end-of-file.
pub(crate) fn map_backing_file(
    file: &File,
    len: u64,
    file_len: u64,
    writable: bool,
) -> Result<MapRegion> {
    if len == 0 {
        return Ok(MapRegion::Empty);
    }
    if writable && len > file_len {
        // One byte at the tail forces the filesystem to account for the
        // full extent before any page of it is touched through the map.
        file.write_at(&[0u8], len - 1)
            .map_err(|e| Error::sys("pwrite", e))?;
    }
    let mut options = MmapOptions::new();
    options.len(len as usize);
    // SAFETY: mapping a file we hold open is sound here because:
    // 1. The advisory lock (unless the caller opted out) keeps other
    //    tidepool processes from mutating the file underneath us.
    // 2. The mapping is replaced only under the variant's exclusive lock,
    //    while zones pin the shared mode, so no view outlives its mapping.
    // 3. `len` never exceeds the on-disk length, so no access can fault
    //    past end-of-file.
    let raw = unsafe {
        if writable {
            options.map_raw(file)
        } else {
            options.map_raw_read_only(file)
        }
    }
    .map_err(|e| Error::sys("mmap", e))?;
    Ok(MapRegion::Mapped(raw))
}
