//! # Coarse-Grained Memory-Mapped File
//!
//! [`MmapAtomicFile`] offers the same contract as the parallel variant with
//! one reader-writer lock guarding all state. Writer zones hold the lock
//! exclusively, reader zones share it, and the sizes are plain integers
//! because nothing observes them outside the lock.
//!
//! Throughput is lower than the parallel variant under write contention,
//! but there is no window in which a resize and a zone pointer access can
//! race, which makes this the variant of choice for callers that interleave
//! structural operations with writes.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{align_up, page_size, DEFAULT_ALLOC_INC_FACTOR, DEFAULT_ALLOC_INIT_SIZE};
use crate::error::{accumulate, Error, Result};
use crate::storage::{
    lock_backing_file, map_backing_file, open_backing_file, unlock_backing_file, MapRegion,
    OpenFlags, StorageFile,
};

struct Inner {
    file: Option<std::fs::File>,
    path: PathBuf,
    path_enabled: bool,
    map: MapRegion,
    file_size: u64,
    map_size: u64,
    writable: bool,
    flags: OpenFlags,
    alloc_init_size: u64,
    alloc_inc_factor: f64,
}

impl Inner {
    fn require_open(&self) -> Result<&std::fs::File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::precondition("not opened file"))
    }
}

/// Grows the mapping to cover at least `min_size` bytes. A failed remap
/// closes the handle and leaves the file permanently failed.
fn allocate_space(inner: &mut Inner, min_size: u64) -> Result<()> {
    if min_size <= inner.map_size {
        return Ok(());
    }
    let grown = (inner.map_size as f64 * inner.alloc_inc_factor) as u64;
    let new_map_size = align_up(min_size.max(grown).max(page_size()), page_size());
    let file = inner.file.as_ref().unwrap();
    match map_backing_file(file, new_map_size, inner.map_size, true) {
        Ok(map) => {
            inner.map = map;
            inner.map_size = new_map_size;
            Ok(())
        }
        Err(e) => {
            inner.map = MapRegion::Empty;
            inner.file = None;
            inner.path.clear();
            inner.file_size = 0;
            inner.map_size = 0;
            Err(e)
        }
    }
}

/// Resolves the base pointer for a zone, verifying the mapping covers it.
fn zone_pointer(inner: &Inner, off: u64, len: usize) -> Result<*mut u8> {
    if len == 0 {
        return Ok(NonNull::dangling().as_ptr());
    }
    let base = inner
        .map
        .as_ptr()
        .ok_or_else(|| Error::precondition("no mapped region"))?;
    if off + len as u64 > inner.map.len() as u64 {
        return Err(Error::infeasible("zone beyond mapped region"));
    }
    // SAFETY: the range was just checked against the mapping length, which
    // cannot change while the zone's guard is held.
    Ok(unsafe { base.add(off as usize) })
}

/// Memory-mapped file with one exclusive writer or many readers at a time.
pub struct MmapAtomicFile {
    inner: RwLock<Inner>,
}

impl Default for MmapAtomicFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapAtomicFile {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                file: None,
                path: PathBuf::new(),
                path_enabled: true,
                map: MapRegion::Empty,
                file_size: 0,
                map_size: 0,
                writable: false,
                flags: OpenFlags::empty(),
                alloc_init_size: DEFAULT_ALLOC_INIT_SIZE,
                alloc_inc_factor: DEFAULT_ALLOC_INC_FACTOR,
            }),
        }
    }

    /// Creates a reader zone over `[off, off + size)`, clamped to the
    /// logical size.
    pub fn read_zone(&self, off: u64, size: usize) -> Result<ReadZone<'_>> {
        let guard = self.inner.read();
        guard.require_open()?;
        if off > guard.file_size {
            return Err(Error::infeasible("excessive offset"));
        }
        let len = (size as u64).min(guard.file_size - off) as usize;
        let ptr = zone_pointer(&guard, off, len)?;
        Ok(ReadZone {
            _guard: guard,
            ptr,
            off,
            len,
        })
    }

    /// Creates a writer zone holding the lock exclusively. `off` of `None`
    /// appends at the tail.
    pub fn write_zone(&self, off: Option<u64>, size: usize) -> Result<WriteZone<'_>> {
        let mut guard = self.inner.write();
        guard.require_open()?;
        if !guard.writable {
            return Err(Error::precondition("not writable file"));
        }
        let off = off.unwrap_or(guard.file_size);
        let end = off + size as u64;
        allocate_space(&mut guard, end)?;
        if end > guard.file_size {
            guard.file_size = end;
        }
        let ptr = zone_pointer(&guard, off, size)?;
        Ok(WriteZone {
            _guard: guard,
            ptr,
            off,
            len: size,
        })
    }
}

/// Scoped window for reading; holds the lock shared.
pub struct ReadZone<'a> {
    _guard: RwLockReadGuard<'a, Inner>,
    ptr: *mut u8,
    off: u64,
    len: usize,
}

impl ReadZone<'_> {
    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: validated at construction; the shared guard pins the map.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Scoped window for writing; holds the lock exclusively, so no other zone
/// can exist while it is alive.
pub struct WriteZone<'a> {
    _guard: RwLockWriteGuard<'a, Inner>,
    ptr: *mut u8,
    off: u64,
    len: usize,
}

impl WriteZone<'_> {
    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into the zone. `data` must be exactly the zone length.
    pub fn fill(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.len);
        if self.len == 0 {
            return;
        }
        // SAFETY: the exclusive guard makes this the only live view.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: the exclusive guard makes this the only live view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl StorageFile for MmapAtomicFile {
    fn open(&self, path: &Path, writable: bool, flags: OpenFlags) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.file.is_some() {
            return Err(Error::precondition("opened file"));
        }
        let (file, file_len) = open_backing_file(path, writable, flags)?;
        lock_backing_file(&file, writable, flags)?;
        let map_size = if writable {
            align_up(file_len.max(inner.alloc_init_size).max(page_size()), page_size())
        } else {
            file_len
        };
        let map = map_backing_file(&file, map_size, file_len, writable)?;
        inner.file = Some(file);
        inner.path = path.to_path_buf();
        inner.path_enabled = true;
        inner.map = map;
        inner.file_size = file_len;
        inner.map_size = map_size;
        inner.writable = writable;
        inner.flags = flags;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        let mut status = Ok(());

        inner.map = MapRegion::Empty;
        let file = inner.file.take().unwrap();
        if inner.writable {
            accumulate(
                &mut status,
                file.set_len(inner.file_size)
                    .map_err(|e| Error::sys("ftruncate", e)),
            );
            if inner.flags.contains(OpenFlags::SYNC) {
                accumulate(
                    &mut status,
                    file.sync_all().map_err(|e| Error::sys("fsync", e)),
                );
            }
        }
        if !inner.flags.contains(OpenFlags::NO_LOCK) {
            accumulate(&mut status, unlock_backing_file(&file));
        }
        drop(file);

        inner.path.clear();
        inner.path_enabled = true;
        inner.file_size = 0;
        inner.map_size = 0;
        inner.writable = false;
        inner.flags = OpenFlags::empty();
        status
    }

    fn read(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let zone = self.read_zone(off, buf.len())?;
        if zone.len() != buf.len() {
            return Err(Error::infeasible("excessive size"));
        }
        buf.copy_from_slice(zone.as_slice());
        Ok(())
    }

    fn read_simple(&self, off: u64, size: usize) -> Vec<u8> {
        match self.read_zone(off, size) {
            Ok(zone) if zone.len() == size => zone.as_slice().to_vec(),
            _ => Vec::new(),
        }
    }

    fn write(&self, off: u64, buf: &[u8]) -> Result<()> {
        let mut zone = self.write_zone(Some(off), buf.len())?;
        zone.fill(buf);
        Ok(())
    }

    fn append(&self, buf: &[u8]) -> Result<u64> {
        let mut zone = self.write_zone(None, buf.len())?;
        zone.fill(buf);
        Ok(zone.offset())
    }

    fn expand(&self, inc_size: u64) -> Result<u64> {
        let zone = self.write_zone(None, inc_size as usize)?;
        Ok(zone.offset())
    }

    fn truncate(&self, new_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        if !inner.writable {
            return Err(Error::precondition("not writable file"));
        }
        let new_map_size = align_up(
            new_size.max(page_size()).max(inner.alloc_init_size),
            page_size(),
        );
        {
            let file = inner.file.as_ref().unwrap();
            file.set_len(new_map_size)
                .map_err(|e| Error::sys("ftruncate", e))?;
        }
        inner.map = MapRegion::Empty;
        let file = inner.file.as_ref().unwrap();
        match map_backing_file(file, new_map_size, new_map_size, true) {
            Ok(map) => {
                inner.map = map;
                inner.map_size = new_map_size;
                inner.file_size = new_size;
                Ok(())
            }
            Err(e) => {
                inner.file = None;
                inner.path.clear();
                inner.file_size = 0;
                inner.map_size = 0;
                Err(e)
            }
        }
    }

    fn truncate_fakely(&self, new_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        if new_size > inner.map_size {
            return Err(Error::infeasible("unable to increase the file size"));
        }
        inner.file_size = new_size;
        Ok(())
    }

    fn synchronize(&self, hard: bool) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        if !inner.writable {
            return Err(Error::precondition("not writable file"));
        }
        let mut status = Ok(());
        inner.map_size = inner.file_size;
        let file_size = inner.file_size;
        let file = inner.file.as_ref().unwrap();
        accumulate(
            &mut status,
            file.set_len(file_size).map_err(|e| Error::sys("ftruncate", e)),
        );
        if hard {
            accumulate(&mut status, inner.map.flush_range(file_size as usize));
            let file = inner.file.as_ref().unwrap();
            accumulate(
                &mut status,
                file.sync_all().map_err(|e| Error::sys("fsync", e)),
            );
        }
        status
    }

    fn size(&self) -> Result<u64> {
        let inner = self.inner.read();
        inner.require_open()?;
        Ok(inner.file_size)
    }

    fn set_allocation_strategy(&self, init_size: u64, inc_factor: f64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.file.is_some() {
            return Err(Error::precondition("already opened file"));
        }
        if init_size == 0 || inc_factor < 1.0 {
            return Err(Error::invalid_argument("invalid allocation strategy"));
        }
        inner.alloc_init_size = init_size;
        inner.alloc_inc_factor = inc_factor;
        Ok(())
    }

    fn copy_properties(&self, other: &dyn StorageFile) -> Result<()> {
        let (init_size, inc_factor) = {
            let inner = self.inner.read();
            (inner.alloc_init_size, inner.alloc_inc_factor)
        };
        other.set_allocation_strategy(init_size, inc_factor)
    }

    fn path(&self) -> Result<PathBuf> {
        let inner = self.inner.read();
        inner.require_open()?;
        if !inner.path_enabled {
            return Err(Error::precondition("disabled path operations"));
        }
        Ok(inner.path.clone())
    }

    fn rename(&self, new_path: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        if !inner.path_enabled {
            return Err(Error::precondition("disabled path operations"));
        }
        std::fs::rename(&inner.path, new_path).map_err(|e| Error::sys("rename", e))?;
        inner.path = new_path.to_path_buf();
        Ok(())
    }

    fn disable_path_operations(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_open()?;
        inner.path_enabled = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.read().file.is_some()
    }

    fn is_writable(&self) -> bool {
        let inner = self.inner.read();
        inner.file.is_some() && inner.writable
    }
}
