//! # Database Module
//!
//! This module provides tidepool's database layer: the in-memory hash-bucket
//! store, its record-processor protocol, snapshot persistence, and the
//! worker-pool async adapter.
//!
//! ## Record Processing
//!
//! All record access flows through one mechanism. A [`RecordProcessor`] is
//! a two-method capability invoked under the record's bucket lock:
//!
//! ```text
//! key present ──► process_full(key, value)  ──► RecordAction
//! key absent  ──► process_empty(key)        ──► RecordAction
//! ```
//!
//! The returned [`RecordAction`] is applied atomically at the record site:
//! keep it, replace/insert a value, or remove it. Every public operation
//! (`get`, `set`, `append`, `increment`, `compare_exchange`, ...) is a thin
//! processor over this protocol, so per-bucket linearizability falls out of
//! the lock discipline instead of per-operation code.
//!
//! ## Concurrency
//!
//! One reader-writer lock guards structural metadata (bucket array,
//! generation); each bucket carries its own lock. Multi-record operations
//! acquire their bucket locks in canonical order, so deadlock is impossible.
//! Rebuilds swap the bucket array under the exclusive metadata lock and
//! bump the generation, which invalidates open iterators.
//!
//! ## Persistence
//!
//! The store is memory-first. When bound to a [`StorageFile`], close and
//! synchronize serialize the whole dataset to the file in the snapshot
//! format (`snapshot` module); open parses it back.
//!
//! [`StorageFile`]: crate::storage::StorageFile

mod async_db;
mod hash;
mod snapshot;
mod task_queue;

pub use async_db::{AsyncDatabase, FutureResult, Postprocessor};
pub use hash::{HashDbm, HashIterator};
pub use task_queue::TaskQueue;

use std::path::Path;

/// The outcome a processor requests for the record it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// Leave the record as it is (or keep the key absent).
    Keep,
    /// Set the record to this value, inserting if absent.
    Set(Vec<u8>),
    /// Remove the record. A no-op if the key is absent.
    Remove,
}

/// A capability invoked with exclusive access to one record site.
///
/// At most one callback runs for a given record at any time; the engine
/// holds the record's bucket lock for the duration of the call. Key and
/// value slices are only valid during the callback; a processor that needs
/// them afterwards must copy.
pub trait RecordProcessor {
    /// Called when a record with `key` exists.
    fn process_full(&mut self, key: &[u8], value: &[u8]) -> RecordAction;

    /// Called when no record with `key` exists.
    fn process_empty(&mut self, key: &[u8]) -> RecordAction;
}

/// Callback handed the snapshot path while the file is in a synchronized
/// state.
pub trait FileProcessor {
    fn process(&mut self, path: &Path);
}

impl<F: FnMut(&Path)> FileProcessor for F {
    fn process(&mut self, path: &Path) {
        self(path)
    }
}
