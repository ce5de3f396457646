//! # Fine-Grained Memory-Mapped File
//!
//! [`MmapParallelFile`] is the storage variant tuned for concurrent access.
//! The logical and mapped sizes live in atomics, so appenders reserve their
//! slot with a compare-and-swap loop instead of a lock, and the structural
//! lock is held shared by zones and exclusively only for remaps.
//!
//! ## Append Protocol
//!
//! An appending writer loops:
//!
//! 1. load the logical size `old`
//! 2. ensure the mapping covers `old + size` (double-checked grow)
//! 3. CAS the logical size from `old` to `old + size`
//!
//! A successful CAS hands the thread exclusive ownership of the byte range
//! `[old, old + size)`; the zone then pins the mapping in shared mode while
//! the caller fills the range. Offsets are therefore pairwise disjoint and
//! gap-free under any interleaving, and the logical size is monotonic to
//! every observer.
//!
//! ## Grow Discipline
//!
//! `allocate_space` checks the mapped extent without the lock, takes the
//! lock exclusively, re-checks, forces filesystem allocation by writing one
//! byte at the new tail, and remaps. A failed remap closes the handle; the
//! file is then permanently failed and every later call reports
//! `Precondition`.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

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

/// Memory-mapped file with lock-free appends and shared reader/writer zones.
pub struct MmapParallelFile {
    inner: RwLock<Inner>,
    file_size: AtomicU64,
    map_size: AtomicU64,
}

impl Default for MmapParallelFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapParallelFile {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                file: None,
                path: PathBuf::new(),
                path_enabled: true,
                map: MapRegion::Empty,
                writable: false,
                flags: OpenFlags::empty(),
                alloc_init_size: DEFAULT_ALLOC_INIT_SIZE,
                alloc_inc_factor: DEFAULT_ALLOC_INC_FACTOR,
            }),
            file_size: AtomicU64::new(0),
            map_size: AtomicU64::new(0),
        }
    }

    /// Grows the mapping to cover at least `min_size` bytes.
    fn allocate_space(&self, min_size: u64) -> Result<()> {
        if min_size <= self.map_size.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut inner = self.inner.write();
        let map_size = self.map_size.load(Ordering::Relaxed);
        if min_size <= map_size {
            return Ok(());
        }
        inner.require_open()?;
        if !inner.writable {
            return Err(Error::precondition("not writable file"));
        }
        let grown = (map_size as f64 * inner.alloc_inc_factor) as u64;
        let new_map_size = align_up(min_size.max(grown).max(page_size()), page_size());
        let file = inner.file.as_ref().unwrap();
        match map_backing_file(file, new_map_size, map_size, true) {
            Ok(map) => {
                inner.map = map;
                self.map_size.store(new_map_size, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                // The old view may no longer describe the file; fail the
                // handle permanently rather than serve stale pointers.
                inner.map = MapRegion::Empty;
                inner.file = None;
                inner.path.clear();
                self.file_size.store(0, Ordering::Release);
                self.map_size.store(0, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Creates a reader zone over `[off, off + size)`, clamped to the
    /// logical size.
    pub fn read_zone(&self, off: u64, size: usize) -> Result<ReadZone<'_>> {
        let guard = self.inner.read();
        guard.require_open()?;
        let file_size = self.file_size.load(Ordering::Acquire);
        if off > file_size {
            return Err(Error::infeasible("excessive offset"));
        }
        let len = (size as u64).min(file_size - off) as usize;
        let ptr = zone_pointer(&guard, off, len)?;
        Ok(ReadZone {
            _guard: guard,
            ptr,
            off,
            len,
        })
    }

    /// Creates a writer zone. `off` of `None` reserves a slot at the tail;
    /// an explicit offset lifts the logical size to cover the range.
    pub fn write_zone(&self, off: Option<u64>, size: usize) -> Result<WriteZone<'_>> {
        {
            let guard = self.inner.read();
            guard.require_open()?;
            if !guard.writable {
                return Err(Error::precondition("not writable file"));
            }
        }
        let off = match off {
            None => loop {
                let old = self.file_size.load(Ordering::Acquire);
                let end = old + size as u64;
                self.allocate_space(end)?;
                if self
                    .file_size
                    .compare_exchange_weak(old, end, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break old;
                }
            },
            Some(off) => {
                let end = off + size as u64;
                self.allocate_space(end)?;
                loop {
                    let old = self.file_size.load(Ordering::Acquire);
                    if end <= old
                        || self
                            .file_size
                            .compare_exchange_weak(old, end, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        break;
                    }
                }
                off
            }
        };
        let guard = self.inner.read();
        guard.require_open()?;
        if !guard.writable {
            return Err(Error::precondition("not writable file"));
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
    // SAFETY: the range was just checked against the mapping length, and the
    // shared guard held by the zone keeps the mapping alive.
    Ok(unsafe { base.add(off as usize) })
}

/// Scoped window for reading; holds the structural lock shared.
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
        // SAFETY: the pointer and length were validated at construction and
        // the mapping is pinned for the zone's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Scoped window for writing; holds the structural lock shared. The byte
/// range was reserved for this zone at creation, so disjoint zones may be
/// filled from different threads concurrently.
pub struct WriteZone<'a> {
    _guard: RwLockReadGuard<'a, Inner>,
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
        // SAFETY: the destination range belongs to this zone alone and the
        // mapping is pinned for the zone's lifetime.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: same range-ownership argument as `fill`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl StorageFile for MmapParallelFile {
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
        inner.writable = writable;
        inner.flags = flags;
        self.file_size.store(file_len, Ordering::Release);
        self.map_size.store(map_size, Ordering::Release);
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
                file.set_len(self.file_size.load(Ordering::Acquire))
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
        inner.writable = false;
        inner.flags = OpenFlags::empty();
        self.file_size.store(0, Ordering::Release);
        self.map_size.store(0, Ordering::Release);
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
                self.map_size.store(new_map_size, Ordering::Release);
                self.file_size.store(new_size, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                inner.file = None;
                inner.path.clear();
                self.file_size.store(0, Ordering::Release);
                self.map_size.store(0, Ordering::Release);
                Err(e)
            }
        }
    }

    fn truncate_fakely(&self, new_size: u64) -> Result<()> {
        let inner = self.inner.read();
        inner.require_open()?;
        if new_size > self.map_size.load(Ordering::Acquire) {
            return Err(Error::infeasible("unable to increase the file size"));
        }
        self.file_size.store(new_size, Ordering::Release);
        Ok(())
    }

    fn synchronize(&self, hard: bool) -> Result<()> {
        let inner = self.inner.write();
        let file = inner.require_open()?;
        if !inner.writable {
            return Err(Error::precondition("not writable file"));
        }
        let mut status = Ok(());
        let file_size = self.file_size.load(Ordering::Acquire);
        self.map_size.store(file_size, Ordering::Release);
        accumulate(
            &mut status,
            file.set_len(file_size).map_err(|e| Error::sys("ftruncate", e)),
        );
        if hard {
            accumulate(&mut status, inner.map.flush_range(file_size as usize));
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
        Ok(self.file_size.load(Ordering::Acquire))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn scratch_file(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn unopened_operations_fail_precondition() {
        let file = MmapParallelFile::new();
        assert_eq!(file.size().unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(file.close().unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(
            file.append(b"x").unwrap_err().kind(),
            ErrorKind::Precondition
        );
        assert!(!file.is_open());
    }

    #[test]
    fn append_then_read_round_trip() {
        let (_dir, path) = scratch_file("roundtrip.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();

        let off = file.append(b"hello ").unwrap();
        assert_eq!(off, 0);
        let off = file.append(b"world").unwrap();
        assert_eq!(off, 6);
        assert_eq!(file.size().unwrap(), 11);

        let mut buf = [0u8; 11];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        file.close().unwrap();
    }

    #[test]
    fn read_past_end_is_infeasible() {
        let (_dir, path) = scratch_file("short.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            file.read(0, &mut buf).unwrap_err().kind(),
            ErrorKind::Infeasible
        );
        assert_eq!(
            file.read(99, &mut buf[..1]).unwrap_err().kind(),
            ErrorKind::Infeasible
        );
        assert_eq!(file.read_simple(0, 3), b"abc".to_vec());
        assert!(file.read_simple(0, 8).is_empty());
        file.close().unwrap();
    }

    #[test]
    fn close_shrinks_on_disk_length_to_logical_size() {
        let (_dir, path) = scratch_file("shrink.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(&[7u8; 100]).unwrap();
        file.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);

        let reader = MmapParallelFile::new();
        reader.open(&path, false, OpenFlags::empty()).unwrap();
        assert_eq!(reader.size().unwrap(), 100);
        assert_eq!(reader.read_simple(0, 100), vec![7u8; 100]);
        reader.close().unwrap();
    }

    #[test]
    fn write_beyond_tail_extends_logical_size() {
        let (_dir, path) = scratch_file("sparse.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.write(10, b"xyz").unwrap();
        assert_eq!(file.size().unwrap(), 13);
        let mut buf = [0u8; 3];
        file.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"xyz");
        file.close().unwrap();
    }

    #[test]
    fn expand_reserves_without_writing() {
        let (_dir, path) = scratch_file("expand.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(b"ab").unwrap();
        let old = file.expand(64).unwrap();
        assert_eq!(old, 2);
        assert_eq!(file.size().unwrap(), 66);
        file.close().unwrap();
    }

    #[test]
    fn truncate_and_truncate_fakely() {
        let (_dir, path) = scratch_file("trunc.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(&[1u8; 300]).unwrap();

        file.truncate(50).unwrap();
        assert_eq!(file.size().unwrap(), 50);

        file.truncate_fakely(10).unwrap();
        assert_eq!(file.size().unwrap(), 10);
        let huge = u64::MAX / 2;
        assert_eq!(
            file.truncate_fakely(huge).unwrap_err().kind(),
            ErrorKind::Infeasible
        );
        file.close().unwrap();
    }

    #[test]
    fn synchronize_clamps_map_and_disk_length() {
        let (_dir, path) = scratch_file("sync.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(&[9u8; 1234]).unwrap();

        file.synchronize(true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1234);

        // Synchronize twice in a row leaves identical on-disk state.
        file.synchronize(false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1234);

        // The file keeps growing after the clamp.
        file.append(b"tail").unwrap();
        assert_eq!(file.size().unwrap(), 1238);
        file.close().unwrap();
    }

    #[test]
    fn allocation_strategy_rejected_once_open() {
        let (_dir, path) = scratch_file("alloc.tdp");
        let file = MmapParallelFile::new();
        file.set_allocation_strategy(4096, 2.0).unwrap();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        assert_eq!(
            file.set_allocation_strategy(8192, 2.0).unwrap_err().kind(),
            ErrorKind::Precondition
        );
        file.close().unwrap();
    }

    #[test]
    fn rename_and_disable_path_operations() {
        let (_dir, path) = scratch_file("old.tdp");
        let new_path = path.with_file_name("new.tdp");
        let file = MmapParallelFile::new();
        file.open(&path, true, OpenFlags::empty()).unwrap();
        assert_eq!(file.path().unwrap(), path);

        file.rename(&new_path).unwrap();
        assert_eq!(file.path().unwrap(), new_path);
        assert!(new_path.exists());
        assert!(!path.exists());

        file.disable_path_operations().unwrap();
        assert_eq!(file.path().unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(
            file.rename(&path).unwrap_err().kind(),
            ErrorKind::Precondition
        );
        file.close().unwrap();
    }

    #[test]
    fn no_create_fails_on_missing_file() {
        let (_dir, path) = scratch_file("missing.tdp");
        let file = MmapParallelFile::new();
        let err = file
            .open(&path, true, OpenFlags::NO_CREATE)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!file.is_open());
    }

    #[test]
    fn zone_pointers_stay_valid_across_growth() {
        let (_dir, path) = scratch_file("zones.tdp");
        let file = MmapParallelFile::new();
        file.set_allocation_strategy(4096, 2.0).unwrap();
        file.open(&path, true, OpenFlags::empty()).unwrap();

        let payload = vec![0xA5u8; 8192];
        let off = file.append(&payload).unwrap();
        assert_eq!(off, 0);
        let zone = file.read_zone(0, 8192).unwrap();
        assert_eq!(zone.as_slice(), &payload[..]);
        drop(zone);
        file.close().unwrap();
    }
}
