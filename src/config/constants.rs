//! # Configuration Constants
//!
//! This module centralizes tidepool's tunable values, grouping interdependent
//! constants together so their relationships stay visible.
//!
//! ## Dependency Notes
//!
//! ```text
//! DEFAULT_NUM_BUCKETS (1,048,583, prime)
//!       │
//!       └─> rebuild sizing: the rebuilt bucket count is the smallest prime
//!           >= max(record_count * 2, DEFAULT_NUM_BUCKETS)
//!
//! DEFAULT_ALLOC_INIT_SIZE (1 MiB)
//!       │
//!       └─> writable mappings are never smaller than this; truncation
//!           realigns to max(new_size, page size, DEFAULT_ALLOC_INIT_SIZE)
//!
//! DEFAULT_TASK_QUEUE_CAPACITY (1024)
//!       │
//!       └─> async submitters block once this many tasks are in flight,
//!           bounding memory held by owned argument copies
//! ```
//!
//! The memory-page size is queried from the OS at first use; mapped extents
//! of writable files are always a multiple of it.

/// Default number of hash buckets. A prime well above typical record counts
/// keeps chains short without rebuilds for small databases.
pub const DEFAULT_NUM_BUCKETS: usize = 1_048_583;

/// Initial mapped extent for writable files (1 MiB).
pub const DEFAULT_ALLOC_INIT_SIZE: u64 = 1 << 20;

/// Growth factor applied to the mapped extent when it must expand.
pub const DEFAULT_ALLOC_INC_FACTOR: f64 = 2.0;

/// Maximum number of queued async tasks before submitters block.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 1024;

/// Maximum key or value length in the snapshot format.
pub const MAX_RECORD_LEN: usize = i32::MAX as usize;

/// Size of the memory page used for mapping alignment.
///
/// Queried once from the OS; falls back to 4096 if `sysconf` reports
/// nothing useful.
pub fn page_size() -> u64 {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf is async-signal-safe and has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 {
            raw as u64
        } else {
            4096
        }
    })
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero; callers pass the OS page size.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
