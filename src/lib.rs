//! # Tidepool - Embedded Key-Value Database Manager
//!
//! Tidepool is an embedded database manager pairing an in-memory
//! hash-bucket store with swappable, memory-mapped file back-ends. The
//! implementation prioritizes:
//!
//! - **Uniform record access**: every operation is a record processor
//!   running under one bucket lock, so linearizability is structural
//! - **Zero-copy storage**: mmap-backed files hand out scoped zones
//!   instead of copying through intermediate buffers
//! - **Explicit status values**: no panics, no exceptions; every fallible
//!   call returns a typed error kind
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidepool::{HashDbm, OpenFlags};
//!
//! # fn main() -> tidepool::Result<()> {
//! let dbm = HashDbm::new();
//! dbm.open("data.tdp", true, OpenFlags::empty())?;
//!
//! dbm.set(b"first", b"hello", true)?;
//! dbm.append(b"first", b"world", b" ")?;
//! assert_eq!(dbm.get(b"first")?, b"hello world");
//!
//! dbm.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Tidepool uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   AsyncDatabase (worker pool)        │
//! ├─────────────────────────────────────┤
//! │   HashDbm (buckets + processors)     │
//! ├─────────────────────────────────────┤
//! │   Snapshot Format (header + varint)  │
//! ├─────────────────────────────────────┤
//! │   StorageFile contract               │
//! ├──────────────────┬──────────────────┤
//! │ MmapParallelFile │ MmapAtomicFile   │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! The store is memory-first: records live in bucket chains and the file
//! only sees them at open, synchronize, and close. Both mmap variants
//! implement the same [`StorageFile`] contract; the parallel flavor trades
//! simplicity for lock-free appends, the atomic flavor trades throughput
//! for one coarse lock.
//!
//! ## Module Overview
//!
//! - [`database`]: hash-bucket store, record processors, async adapter
//! - [`storage`]: memory-mapped file variants and the file contract
//! - [`encoding`]: varint framing for the snapshot format
//! - [`error`]: status kinds shared by every component
//! - [`config`]: tunable constants
//!
//! ## Thread Safety
//!
//! [`HashDbm`] and both file types are `Send + Sync` and designed to be
//! shared across threads behind a plain reference or an `Arc`. Iterators
//! and zones are single-thread scoped views.

pub mod config;
pub mod database;
pub mod encoding;
pub mod error;
pub mod storage;

pub use database::{
    AsyncDatabase, FileProcessor, FutureResult, HashDbm, HashIterator, Postprocessor,
    RecordAction, RecordProcessor,
};
pub use error::{Error, ErrorKind, Result};
pub use storage::{MmapAtomicFile, MmapParallelFile, OpenFlags, StorageFile};
