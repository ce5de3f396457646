//! # Storage Module
//!
//! This module provides tidepool's file substrate: growable, memory-mapped
//! byte regions exposing scoped read/write zones with zero-copy access.
//!
//! ## Architecture Overview
//!
//! The storage layer is built around memory-mapped I/O. Instead of copying
//! data between kernel and user space, files are mapped directly into the
//! process address space:
//!
//! - **Zero-copy reads**: zones hand out slices pointing into the mapping
//! - **Minimal syscall overhead**: page faults are handled by the OS
//! - **Efficient caching**: the OS page cache is the only cache
//!
//! ## Two Concurrency Flavors
//!
//! Both variants implement the same [`StorageFile`] contract and differ only
//! in locking discipline:
//!
//! - [`MmapParallelFile`]: atomic logical/mapped sizes plus a shared
//!   structural lock. Appends reserve their slot with a CAS loop, so many
//!   reader and writer zones can address disjoint regions concurrently and
//!   append throughput scales with threads.
//! - [`MmapAtomicFile`]: one reader-writer lock over all state. Writer
//!   zones are exclusive, reader zones shared. Simpler, slower, and free of
//!   any race between resize and zone pointer access.
//!
//! ## Size Bookkeeping
//!
//! Each file tracks two sizes: `file_size`, the logical number of bytes
//! written, and `map_size`, the mapped extent. The mapped extent is always
//! page-aligned while writable and never smaller than the logical size.
//! Closing or synchronizing a writable file truncates the on-disk length
//! back to the logical size.
//!
//! ## Safety Model
//!
//! A mapping may only be replaced (grown, truncated, closed) by a thread
//! holding the structural lock exclusively. Zones hold the lock in shared
//! mode for their whole scope, so a zone's pointer cannot be invalidated
//! while it is alive. The empty mapping is an explicit enum variant; no
//! arithmetic is ever performed on a sentinel pointer.

pub mod atomic;
mod file;
pub mod parallel;

pub use atomic::MmapAtomicFile;
pub use file::{OpenFlags, StorageFile};
pub use parallel::MmapParallelFile;

pub(crate) use file::{
    lock_backing_file, map_backing_file, open_backing_file, unlock_backing_file, MapRegion,
};
