//! # Hash-Bucket Database
//!
//! [`HashDbm`] is an in-memory key-value store organized as a fixed array of
//! buckets, each holding an insertion-ordered chain of records. All record
//! access funnels through the record-processor protocol, so every public
//! operation inherits the same locking discipline:
//!
//! ## Lock Hierarchy
//!
//! To prevent deadlocks, locks are acquired in a consistent order:
//!
//! ```text
//! 1. Metadata lock (shared for record access, exclusive for rebuild/clear)
//! 2. Bucket locks in ascending bucket-index order
//! ```
//!
//! A single-record operation takes the metadata lock shared and one bucket
//! lock in the mode its `writable` flag dictates. A multi-record operation
//! takes the metadata lock shared and its deduplicated set of bucket locks
//! in ascending index order before any callback runs. Rebuild and clear
//! take the metadata lock exclusively, swap state, and bump the generation
//! counter, failing every iterator opened before the swap.
//!
//! ## Counting
//!
//! The record count is maintained incrementally under bucket locks, so
//! `count()` is exact without a scan.
//!
//! ## Persistence
//!
//! The store runs happily with no file at all. When opened against a path,
//! the snapshot is parsed into memory; close and synchronize write the
//! current dataset back in bucket-major insertion order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::config::{DEFAULT_NUM_BUCKETS, MAX_RECORD_LEN};
use crate::database::snapshot::{encode_record, SnapshotHeader, SnapshotReader};
use crate::database::{FileProcessor, RecordAction, RecordProcessor};
use crate::error::{accumulate, Error, Result};
use crate::storage::{MmapParallelFile, OpenFlags, StorageFile};

/// Chunk size for streaming a snapshot out through the file's append path.
const SAVE_CHUNK_LEN: usize = 64 * 1024;

struct Record {
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Default)]
struct Bucket {
    records: Vec<Record>,
}

impl Bucket {
    fn find(&self, key: &[u8]) -> Option<usize> {
        self.records.iter().position(|r| r.key == key)
    }
}

struct Table {
    buckets: Vec<RwLock<Bucket>>,
    generation: u64,
}

impl Table {
    fn with_buckets(num_buckets: usize) -> Self {
        Self {
            buckets: (0..num_buckets).map(|_| RwLock::new(Bucket::default())).collect(),
            generation: 0,
        }
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        (primary_hash(key) % self.buckets.len() as u64) as usize
    }
}

struct FileBinding {
    file: Box<dyn StorageFile>,
    path: Option<PathBuf>,
    open: bool,
    writable: bool,
}

/// FNV-1a. The snapshot format carries no hash, so the function only needs
/// to be stable within a process.
fn primary_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}

/// On-memory database manager backed by a bucketed hash table.
///
/// All operations are thread-safe; multiple threads can use one `HashDbm`
/// concurrently through a shared reference.
pub struct HashDbm {
    table: RwLock<Table>,
    count: AtomicU64,
    file: Mutex<FileBinding>,
}

impl Default for HashDbm {
    fn default() -> Self {
        Self::new()
    }
}

impl HashDbm {
    /// Creates a store with the default bucket count and a parallel mmap
    /// file for persistence.
    pub fn new() -> Self {
        Self::with_buckets(None)
    }

    /// Creates a store with `num_buckets` buckets (default when `None`).
    pub fn with_buckets(num_buckets: Option<usize>) -> Self {
        Self::with_file(Box::new(MmapParallelFile::new()), num_buckets)
    }

    /// Creates a store that persists through the given file object.
    pub fn with_file(file: Box<dyn StorageFile>, num_buckets: Option<usize>) -> Self {
        let num_buckets = num_buckets.unwrap_or(DEFAULT_NUM_BUCKETS).max(1);
        Self {
            table: RwLock::new(Table::with_buckets(num_buckets)),
            count: AtomicU64::new(0),
            file: Mutex::new(FileBinding {
                file,
                path: None,
                open: false,
                writable: false,
            }),
        }
    }

    fn check_writable(&self, writable: bool) -> Result<()> {
        if writable {
            let binding = self.file.lock();
            if binding.open && !binding.writable {
                return Err(Error::precondition("not writable database"));
            }
        }
        Ok(())
    }

    /// Runs the processor against the record site for `key`, applying the
    /// returned action when `writable` is true. Actions returned from a
    /// read-only call are discarded.
    pub fn process(
        &self,
        key: &[u8],
        proc: &mut dyn RecordProcessor,
        writable: bool,
    ) -> Result<()> {
        if key.len() > MAX_RECORD_LEN {
            return Err(Error::invalid_argument("too long key"));
        }
        self.check_writable(writable)?;
        let table = self.table.read();
        let index = table.bucket_index(key);
        if writable {
            let mut bucket = table.buckets[index].write();
            self.process_in_bucket(&mut bucket, key, proc);
        } else {
            let bucket = table.buckets[index].read();
            match bucket.find(key) {
                Some(pos) => {
                    proc.process_full(key, &bucket.records[pos].value);
                }
                None => {
                    proc.process_empty(key);
                }
            }
        }
        Ok(())
    }

    fn process_in_bucket(&self, bucket: &mut Bucket, key: &[u8], proc: &mut dyn RecordProcessor) {
        match bucket.find(key) {
            Some(pos) => match proc.process_full(key, &bucket.records[pos].value) {
                RecordAction::Keep => {}
                RecordAction::Set(value) => bucket.records[pos].value = value,
                RecordAction::Remove => {
                    bucket.records.remove(pos);
                    self.count.fetch_sub(1, Ordering::Relaxed);
                }
            },
            None => match proc.process_empty(key) {
                RecordAction::Keep | RecordAction::Remove => {}
                RecordAction::Set(value) => {
                    bucket.records.push(Record {
                        key: key.to_vec(),
                        value,
                    });
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    /// Applies several single-key processings atomically with respect to
    /// each other. All affected bucket locks are taken in ascending index
    /// order before the first callback runs.
    pub fn process_multi(
        &self,
        pairs: &mut [(&[u8], &mut dyn RecordProcessor)],
        writable: bool,
    ) -> Result<()> {
        for (key, _) in pairs.iter() {
            if key.len() > MAX_RECORD_LEN {
                return Err(Error::invalid_argument("too long key"));
            }
        }
        self.check_writable(writable)?;
        let table = self.table.read();
        let mut indices: SmallVec<[usize; 8]> = pairs
            .iter()
            .map(|(key, _)| table.bucket_index(key))
            .collect();
        indices.sort_unstable();
        indices.dedup();

        if writable {
            let mut guards: HashMap<usize, RwLockWriteGuard<'_, Bucket>> =
                HashMap::with_capacity(indices.len());
            for &index in &indices {
                guards.insert(index, table.buckets[index].write());
            }
            for (key, proc) in pairs.iter_mut() {
                let index = table.bucket_index(key);
                let bucket = guards.get_mut(&index).unwrap();
                self.process_in_bucket(bucket, key, &mut **proc);
            }
        } else {
            let mut guards = HashMap::with_capacity(indices.len());
            for &index in &indices {
                guards.insert(index, table.buckets[index].read());
            }
            for (key, proc) in pairs.iter_mut() {
                let bucket = &guards[&table.bucket_index(key)];
                match bucket.find(key) {
                    Some(pos) => {
                        proc.process_full(key, &bucket.records[pos].value);
                    }
                    None => {
                        proc.process_empty(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Invokes `process_empty("")` once, then `process_full` for every
    /// record in bucket-major insertion order, then `process_empty("")`
    /// again. Mutations are applied in-line; iteration is stable over
    /// already-visited positions.
    pub fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.check_writable(writable)?;
        let table = self.table.read();
        proc.process_empty(b"");
        for lock in &table.buckets {
            if writable {
                let mut bucket = lock.write();
                let mut pos = 0;
                while pos < bucket.records.len() {
                    let action =
                        proc.process_full(&bucket.records[pos].key, &bucket.records[pos].value);
                    match action {
                        RecordAction::Keep => pos += 1,
                        RecordAction::Set(value) => {
                            bucket.records[pos].value = value;
                            pos += 1;
                        }
                        RecordAction::Remove => {
                            bucket.records.remove(pos);
                            self.count.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
            } else {
                let bucket = lock.read();
                for record in &bucket.records {
                    proc.process_full(&record.key, &record.value);
                }
            }
        }
        proc.process_empty(b"");
        Ok(())
    }

    /// Gets the value of the record for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut proc = GetProc { value: None };
        self.process(key, &mut proc, false)?;
        proc.value
            .ok_or_else(|| Error::not_found("no such record"))
    }

    /// Sets a record. With `overwrite` false, an existing record is kept
    /// and the call fails `Duplication`.
    pub fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        let mut proc = SetProc {
            value: Some(value.to_vec()),
            overwrite,
            existed: false,
        };
        self.process(key, &mut proc, true)?;
        if proc.existed && !overwrite {
            return Err(Error::duplication("record exists"));
        }
        Ok(())
    }

    /// Removes the record for `key`.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut proc = RemoveProc { found: false };
        self.process(key, &mut proc, true)?;
        if !proc.found {
            return Err(Error::not_found("no such record"));
        }
        Ok(())
    }

    /// Appends `value` to the record, inserting the delimiter between the
    /// existing value and the addition. A missing record is created without
    /// the delimiter.
    pub fn append(&self, key: &[u8], value: &[u8], delim: &[u8]) -> Result<()> {
        let mut proc = AppendProc { value, delim };
        self.process(key, &mut proc, true)
    }

    /// Treats the value as an 8-byte big-endian signed counter and adds
    /// `increment` to it, returning the new value. A missing record starts
    /// from `initial`.
    pub fn increment(&self, key: &[u8], increment: i64, initial: i64) -> Result<i64> {
        let mut proc = IncrementProc {
            increment,
            initial,
            current: None,
            malformed: false,
        };
        self.process(key, &mut proc, true)?;
        if proc.malformed {
            return Err(Error::invalid_argument("counter value is not 8 bytes"));
        }
        Ok(proc.current.unwrap_or(initial))
    }

    /// Atomically replaces the value only if the current value equals
    /// `expected`; `None` means absent on both sides, and a `None` desired
    /// value removes the record. Fails `Infeasible` on mismatch.
    pub fn compare_exchange(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        desired: Option<&[u8]>,
    ) -> Result<()> {
        let mut proc = CompareExchangeProc {
            expected,
            desired,
            matched: false,
        };
        self.process(key, &mut proc, true)?;
        if !proc.matched {
            return Err(Error::infeasible("expected value mismatch"));
        }
        Ok(())
    }

    /// Gets several records in one atomic step, in key order.
    pub fn get_multi(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut procs: Vec<GetProc> = keys.iter().map(|_| GetProc { value: None }).collect();
        let mut pairs: Vec<(&[u8], &mut dyn RecordProcessor)> = keys
            .iter()
            .copied()
            .zip(procs.iter_mut().map(|p| p as &mut dyn RecordProcessor))
            .collect();
        self.process_multi(&mut pairs, false)?;
        Ok(procs.into_iter().map(|p| p.value).collect())
    }

    /// Sets several records in one atomic step. With `overwrite` false the
    /// call fails `Duplication` if any key already existed; records for
    /// fresh keys are still inserted.
    pub fn set_multi(&self, records: &[(&[u8], &[u8])], overwrite: bool) -> Result<()> {
        let mut procs: Vec<SetProc> = records
            .iter()
            .map(|(_, value)| SetProc {
                value: Some(value.to_vec()),
                overwrite,
                existed: false,
            })
            .collect();
        let mut pairs: Vec<(&[u8], &mut dyn RecordProcessor)> = records
            .iter()
            .map(|(key, _)| *key)
            .zip(procs.iter_mut().map(|p| p as &mut dyn RecordProcessor))
            .collect();
        self.process_multi(&mut pairs, true)?;
        if !overwrite && procs.iter().any(|p| p.existed) {
            return Err(Error::duplication("record exists"));
        }
        Ok(())
    }

    /// Removes several records in one atomic step. Fails `NotFound` if any
    /// key was absent; the others are still removed.
    pub fn remove_multi(&self, keys: &[&[u8]]) -> Result<()> {
        let mut procs: Vec<RemoveProc> = keys.iter().map(|_| RemoveProc { found: false }).collect();
        let mut pairs: Vec<(&[u8], &mut dyn RecordProcessor)> = keys
            .iter()
            .copied()
            .zip(procs.iter_mut().map(|p| p as &mut dyn RecordProcessor))
            .collect();
        self.process_multi(&mut pairs, true)?;
        if procs.iter().any(|p| !p.found) {
            return Err(Error::not_found("no such record"));
        }
        Ok(())
    }

    /// Appends to several records in one atomic step.
    pub fn append_multi(&self, records: &[(&[u8], &[u8])], delim: &[u8]) -> Result<()> {
        let mut procs: Vec<AppendProc> = records
            .iter()
            .map(|(_, value)| AppendProc { value, delim })
            .collect();
        let mut pairs: Vec<(&[u8], &mut dyn RecordProcessor)> = records
            .iter()
            .map(|(key, _)| *key)
            .zip(procs.iter_mut().map(|p| p as &mut dyn RecordProcessor))
            .collect();
        self.process_multi(&mut pairs, true)
    }

    /// Compares several expectations and applies several updates as one
    /// atomic step: every expectation is checked under the locks before any
    /// write happens, so a mismatch leaves the database untouched.
    pub fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], Option<&[u8]>)],
        desired: &[(&[u8], Option<&[u8]>)],
    ) -> Result<()> {
        self.check_writable(true)?;
        let table = self.table.read();
        let mut indices: SmallVec<[usize; 8]> = expected
            .iter()
            .chain(desired.iter())
            .map(|(key, _)| table.bucket_index(key))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        let mut guards: HashMap<usize, RwLockWriteGuard<'_, Bucket>> =
            HashMap::with_capacity(indices.len());
        for &index in &indices {
            guards.insert(index, table.buckets[index].write());
        }

        for (key, expectation) in expected {
            let bucket = &guards[&table.bucket_index(key)];
            let current = bucket.find(key).map(|pos| bucket.records[pos].value.as_slice());
            if current != *expectation {
                return Err(Error::infeasible("expected value mismatch"));
            }
        }
        for (key, update) in desired {
            let index = table.bucket_index(key);
            let bucket = guards.get_mut(&index).unwrap();
            match (bucket.find(key), update) {
                (Some(pos), Some(value)) => bucket.records[pos].value = value.to_vec(),
                (Some(pos), None) => {
                    bucket.records.remove(pos);
                    self.count.fetch_sub(1, Ordering::Relaxed);
                }
                (None, Some(value)) => {
                    bucket.records.push(Record {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// The exact number of live records.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The number of buckets in the current generation.
    pub fn num_buckets(&self) -> usize {
        self.table.read().buckets.len()
    }

    /// Removes every record and advances the generation.
    pub fn clear(&self) -> Result<()> {
        self.check_writable(true)?;
        let mut table = self.table.write();
        for lock in &mut table.buckets {
            lock.get_mut().records.clear();
        }
        table.generation += 1;
        self.count.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuilds with an implicitly calculated bucket count.
    pub fn rebuild(&self) -> Result<()> {
        self.rebuild_advanced(None)
    }

    /// Rehashes every record into a fresh bucket array. With `None`, the
    /// new count is the smallest prime covering twice the record count (but
    /// never below the default). Iterators opened before the rebuild fail
    /// from then on.
    pub fn rebuild_advanced(&self, num_buckets: Option<usize>) -> Result<()> {
        self.check_writable(true)?;
        let mut table = self.table.write();
        let new_count = match num_buckets {
            Some(0) => return Err(Error::invalid_argument("zero buckets")),
            Some(n) => n,
            None => next_prime((self.count.load(Ordering::Relaxed) as usize * 2).max(DEFAULT_NUM_BUCKETS)),
        };
        let mut new_buckets: Vec<RwLock<Bucket>> =
            (0..new_count).map(|_| RwLock::new(Bucket::default())).collect();
        for lock in std::mem::take(&mut table.buckets) {
            for record in lock.into_inner().records {
                let index = (primary_hash(&record.key) % new_count as u64) as usize;
                new_buckets[index].get_mut().records.push(record);
            }
        }
        table.buckets = new_buckets;
        table.generation += 1;
        Ok(())
    }

    /// True when the table is badly over- or under-sized for its record
    /// count.
    pub fn should_be_rebuilt(&self) -> bool {
        let table = self.table.read();
        let num_buckets = table.buckets.len();
        let count = self.count.load(Ordering::Relaxed) as usize;
        count > num_buckets * 2 || (num_buckets > 8 && count < num_buckets / 8)
    }

    /// Opens a database file. An existing snapshot is parsed into memory; a
    /// missing file is created when `writable` allows it.
    pub fn open(&self, path: impl AsRef<Path>, writable: bool, flags: OpenFlags) -> Result<()> {
        let path = path.as_ref();
        let mut binding = self.file.lock();
        if binding.open {
            return Err(Error::precondition("opened database"));
        }
        binding.file.open(path, writable, flags)?;
        let size = binding.file.size()?;
        if size > 0 {
            let mut data = vec![0u8; size as usize];
            let loaded = binding
                .file
                .read(0, &mut data)
                .and_then(|()| self.load_snapshot(&data));
            if let Err(e) = loaded {
                let mut status = Err(e);
                accumulate(&mut status, binding.file.close());
                return status;
            }
        }
        binding.path = Some(path.to_path_buf());
        binding.open = true;
        binding.writable = writable;
        Ok(())
    }

    fn load_snapshot(&self, data: &[u8]) -> Result<()> {
        let mut reader = SnapshotReader::new(data)?;
        let table = self.table.read();
        while let Some((key, value)) = reader.next_record()? {
            let index = table.bucket_index(key);
            let mut bucket = table.buckets[index].write();
            match bucket.find(key) {
                Some(pos) => bucket.records[pos].value = value.to_vec(),
                None => {
                    bucket.records.push(Record {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Closes the database file. A writable database is synchronized to
    /// the device before the file is released.
    pub fn close(&self) -> Result<()> {
        let mut binding = self.file.lock();
        if !binding.open {
            return Err(Error::precondition("not opened database"));
        }
        let mut status = Ok(());
        if binding.writable {
            accumulate(&mut status, self.save_snapshot(&mut binding, true));
        }
        accumulate(&mut status, binding.file.close());
        binding.open = false;
        binding.writable = false;
        binding.path = None;
        status
    }

    /// Serializes the current dataset to the bound file. With `hard`, the
    /// data is flushed to the device. `file_proc` runs with the snapshot
    /// path while the file is in the synchronized state.
    pub fn synchronize(
        &self,
        hard: bool,
        file_proc: Option<&mut dyn FileProcessor>,
    ) -> Result<()> {
        let mut binding = self.file.lock();
        if !binding.open {
            return Ok(());
        }
        if !binding.writable {
            return Err(Error::precondition("not writable database"));
        }
        self.save_snapshot(&mut binding, hard)?;
        if let (Some(proc), Some(path)) = (file_proc, binding.path.clone()) {
            proc.process(&path);
        }
        Ok(())
    }

    fn save_snapshot(&self, binding: &mut FileBinding, hard: bool) -> Result<()> {
        use zerocopy::IntoBytes;

        binding.file.truncate(0)?;
        let table = self.table.read();
        let bucket_hint = table.buckets.len().min(u32::MAX as usize) as u32;
        let mut buf = SnapshotHeader::new(bucket_hint).as_bytes().to_vec();
        for lock in &table.buckets {
            let bucket = lock.read();
            for record in &bucket.records {
                encode_record(&record.key, &record.value, &mut buf);
            }
            if buf.len() >= SAVE_CHUNK_LEN {
                binding.file.append(&buf)?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            binding.file.append(&buf)?;
        }
        drop(table);
        binding.file.synchronize(hard)
    }

    /// The current size of the database file.
    pub fn file_size(&self) -> Result<u64> {
        let binding = self.file.lock();
        if !binding.open {
            return Err(Error::precondition("not opened database"));
        }
        binding.file.size()
    }

    /// The path of the database file.
    pub fn file_path(&self) -> Result<PathBuf> {
        let binding = self.file.lock();
        match (&binding.path, binding.open) {
            (Some(path), true) => Ok(path.clone()),
            _ => Err(Error::precondition("not opened database")),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().open
    }

    pub fn is_writable(&self) -> bool {
        let binding = self.file.lock();
        binding.open && binding.writable
    }

    /// On-memory databases never enter an unhealthy state.
    pub fn is_healthy(&self) -> bool {
        true
    }

    /// Ordered operations are not supported.
    pub fn is_ordered(&self) -> bool {
        false
    }

    /// Property name/value pairs describing the database.
    pub fn inspect(&self) -> Vec<(String, String)> {
        let binding = self.file.lock();
        let path = binding
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        vec![
            ("class".to_string(), "HashDBM".to_string()),
            ("num_buckets".to_string(), self.num_buckets().to_string()),
            ("num_records".to_string(), self.count().to_string()),
            ("path".to_string(), path),
            ("open".to_string(), binding.open.to_string()),
            ("writable".to_string(), binding.writable.to_string()),
            ("healthy".to_string(), "true".to_string()),
        ]
    }

    /// Makes an iterator over the records. The iterator initially points
    /// at no record; call `first` or `jump` to anchor it.
    pub fn iterator(&self) -> HashIterator<'_> {
        HashIterator {
            dbm: self,
            generation: 0,
            bucket_index: 0,
            record_index: 0,
            anchored: false,
        }
    }
}

impl Drop for HashDbm {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

/// Iterator over the records of a [`HashDbm`].
///
/// The cursor is `(generation, bucket_index, position_in_chain)`. When the
/// database is cleared or rebuilt the generation moves on and every
/// operation on this iterator fails `NotFound`. One iterator must not be
/// shared between threads.
pub struct HashIterator<'a> {
    dbm: &'a HashDbm,
    generation: u64,
    bucket_index: usize,
    record_index: usize,
    anchored: bool,
}

impl HashIterator<'_> {
    /// Anchors the iterator at the first record. Succeeds even on an empty
    /// database.
    pub fn first(&mut self) -> Result<()> {
        let table = self.dbm.table.read();
        self.generation = table.generation;
        self.bucket_index = 0;
        self.record_index = 0;
        self.anchored = true;
        Ok(())
    }

    /// Anchors the iterator at the record for `key`, failing `NotFound`
    /// when absent.
    pub fn jump(&mut self, key: &[u8]) -> Result<()> {
        let table = self.dbm.table.read();
        let index = table.bucket_index(key);
        let bucket = table.buckets[index].read();
        match bucket.find(key) {
            Some(pos) => {
                self.generation = table.generation;
                self.bucket_index = index;
                self.record_index = pos;
                self.anchored = true;
                Ok(())
            }
            None => Err(Error::not_found("no such record")),
        }
    }

    /// Not supported: this database is unordered.
    pub fn last(&mut self) -> Result<()> {
        Err(Error::not_implemented())
    }

    /// Not supported: this database is unordered.
    pub fn previous(&mut self) -> Result<()> {
        Err(Error::not_implemented())
    }

    /// Not supported: this database is unordered.
    pub fn jump_lower(&mut self, _key: &[u8], _inclusive: bool) -> Result<()> {
        Err(Error::not_implemented())
    }

    /// Not supported: this database is unordered.
    pub fn jump_upper(&mut self, _key: &[u8], _inclusive: bool) -> Result<()> {
        Err(Error::not_implemented())
    }

    /// Moves past the current record. Fails `NotFound` when the iterator
    /// has no current record; running off the end does not fail.
    pub fn next(&mut self) -> Result<()> {
        let table = self.dbm.table.read();
        self.check_generation(&table)?;
        if self.normalize(&table).is_none() {
            return Err(Error::not_found("no current record"));
        }
        self.record_index += 1;
        Ok(())
    }

    /// Gets the current record's key and value.
    pub fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let table = self.dbm.table.read();
        self.check_generation(&table)?;
        let (bucket_index, record_index) = self
            .normalize(&table)
            .ok_or_else(|| Error::not_found("no current record"))?;
        let bucket = table.buckets[bucket_index].read();
        match bucket.records.get(record_index) {
            Some(record) => Ok((record.key.clone(), record.value.clone())),
            None => Err(Error::not_found("no current record")),
        }
    }

    /// Processes the current record. A `Remove` action leaves the iterator
    /// on the record that slid into the vacated slot.
    pub fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.dbm.check_writable(writable)?;
        let table = self.dbm.table.read();
        self.check_generation(&table)?;
        loop {
            let (bucket_index, record_index) = self
                .normalize(&table)
                .ok_or_else(|| Error::not_found("no current record"))?;
            if writable {
                let mut bucket = table.buckets[bucket_index].write();
                let Some(record) = bucket.records.get(record_index) else {
                    continue;
                };
                let key = record.key.clone();
                match proc.process_full(&key, &record.value) {
                    RecordAction::Keep => {}
                    RecordAction::Set(value) => bucket.records[record_index].value = value,
                    RecordAction::Remove => {
                        bucket.records.remove(record_index);
                        self.dbm.count.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            } else {
                let bucket = table.buckets[bucket_index].read();
                let Some(record) = bucket.records.get(record_index) else {
                    continue;
                };
                proc.process_full(&record.key, &record.value);
            }
            return Ok(());
        }
    }

    fn check_generation(&self, table: &Table) -> Result<()> {
        if !self.anchored || self.generation != table.generation {
            return Err(Error::not_found("iterator is invalidated"));
        }
        Ok(())
    }

    /// Slides the cursor forward to the first occupied position at or after
    /// it, updating the stored indices.
    fn normalize(&mut self, table: &Table) -> Option<(usize, usize)> {
        while self.bucket_index < table.buckets.len() {
            let bucket = table.buckets[self.bucket_index].read();
            if self.record_index < bucket.records.len() {
                return Some((self.bucket_index, self.record_index));
            }
            self.bucket_index += 1;
            self.record_index = 0;
        }
        None
    }
}

struct GetProc {
    value: Option<Vec<u8>>,
}

impl RecordProcessor for GetProc {
    fn process_full(&mut self, _key: &[u8], value: &[u8]) -> RecordAction {
        self.value = Some(value.to_vec());
        RecordAction::Keep
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        RecordAction::Keep
    }
}

struct SetProc {
    value: Option<Vec<u8>>,
    overwrite: bool,
    existed: bool,
}

impl RecordProcessor for SetProc {
    fn process_full(&mut self, _key: &[u8], _value: &[u8]) -> RecordAction {
        self.existed = true;
        if self.overwrite {
            RecordAction::Set(self.value.take().unwrap_or_default())
        } else {
            RecordAction::Keep
        }
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        RecordAction::Set(self.value.take().unwrap_or_default())
    }
}

struct RemoveProc {
    found: bool,
}

impl RecordProcessor for RemoveProc {
    fn process_full(&mut self, _key: &[u8], _value: &[u8]) -> RecordAction {
        self.found = true;
        RecordAction::Remove
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        RecordAction::Keep
    }
}

struct AppendProc<'a> {
    value: &'a [u8],
    delim: &'a [u8],
}

impl RecordProcessor for AppendProc<'_> {
    fn process_full(&mut self, _key: &[u8], value: &[u8]) -> RecordAction {
        let mut joined = Vec::with_capacity(value.len() + self.delim.len() + self.value.len());
        joined.extend_from_slice(value);
        joined.extend_from_slice(self.delim);
        joined.extend_from_slice(self.value);
        RecordAction::Set(joined)
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        RecordAction::Set(self.value.to_vec())
    }
}

struct IncrementProc {
    increment: i64,
    initial: i64,
    current: Option<i64>,
    malformed: bool,
}

impl RecordProcessor for IncrementProc {
    fn process_full(&mut self, _key: &[u8], value: &[u8]) -> RecordAction {
        let Ok(bytes) = <[u8; 8]>::try_from(value) else {
            self.malformed = true;
            return RecordAction::Keep;
        };
        let next = i64::from_be_bytes(bytes).wrapping_add(self.increment);
        self.current = Some(next);
        RecordAction::Set(next.to_be_bytes().to_vec())
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        let next = self.initial.wrapping_add(self.increment);
        self.current = Some(next);
        RecordAction::Set(next.to_be_bytes().to_vec())
    }
}

struct CompareExchangeProc<'a> {
    expected: Option<&'a [u8]>,
    desired: Option<&'a [u8]>,
    matched: bool,
}

impl RecordProcessor for CompareExchangeProc<'_> {
    fn process_full(&mut self, _key: &[u8], value: &[u8]) -> RecordAction {
        if self.expected != Some(value) {
            return RecordAction::Keep;
        }
        self.matched = true;
        match self.desired {
            Some(desired) => RecordAction::Set(desired.to_vec()),
            None => RecordAction::Remove,
        }
    }

    fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
        if self.expected.is_some() {
            return RecordAction::Keep;
        }
        self.matched = true;
        match self.desired {
            Some(desired) => RecordAction::Set(desired.to_vec()),
            None => RecordAction::Keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn small() -> HashDbm {
        HashDbm::with_buckets(Some(7))
    }

    #[test]
    fn set_get_remove_maintain_count() {
        let dbm = small();
        dbm.set(b"one", b"1", true).unwrap();
        dbm.set(b"two", b"2", true).unwrap();
        dbm.set(b"one", b"uno", true).unwrap();
        assert_eq!(dbm.count(), 2);
        assert_eq!(dbm.get(b"one").unwrap(), b"uno");

        dbm.remove(b"one").unwrap();
        assert_eq!(dbm.count(), 1);
        assert_eq!(dbm.get(b"one").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(dbm.remove(b"one").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn set_without_overwrite_reports_duplication() {
        let dbm = small();
        dbm.set(b"k", b"a", false).unwrap();
        let err = dbm.set(b"k", b"b", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplication);
        assert_eq!(dbm.get(b"k").unwrap(), b"a");
    }

    #[test]
    fn append_inserts_delimiter_only_between() {
        let dbm = small();
        dbm.append(b"log", b"first", b"|").unwrap();
        dbm.append(b"log", b"second", b"|").unwrap();
        assert_eq!(dbm.get(b"log").unwrap(), b"first|second");
    }

    #[test]
    fn increment_big_endian_counter() {
        let dbm = small();
        assert_eq!(dbm.increment(b"n", 3, 0).unwrap(), 3);
        assert_eq!(dbm.increment(b"n", 3, 0).unwrap(), 6);
        assert_eq!(
            dbm.get(b"n").unwrap(),
            vec![0, 0, 0, 0, 0, 0, 0, 6]
        );

        dbm.set(b"bad", b"xyz", true).unwrap();
        let err = dbm.increment(b"bad", 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn process_multi_is_atomic_over_buckets() {
        let dbm = small();
        dbm.set_multi(&[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2"), (b"c", b"3")], true)
            .unwrap();
        assert_eq!(dbm.count(), 3);

        let values = dbm.get_multi(&[b"a", b"missing", b"c"]).unwrap();
        assert_eq!(
            values,
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
        );

        dbm.remove_multi(&[b"a", b"b"]).unwrap();
        assert_eq!(dbm.count(), 1);
    }

    #[test]
    fn compare_exchange_multi_checks_before_writing() {
        let dbm = small();
        dbm.set(b"x", b"1", true).unwrap();

        let err = dbm
            .compare_exchange_multi(
                &[(b"x".as_slice(), Some(b"1".as_slice())), (b"y", Some(b"2"))],
                &[(b"x".as_slice(), Some(b"10".as_slice()))],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infeasible);
        assert_eq!(dbm.get(b"x").unwrap(), b"1");

        dbm.compare_exchange_multi(
            &[(b"x".as_slice(), Some(b"1".as_slice())), (b"y", None)],
            &[(b"x".as_slice(), None), (b"y", Some(b"2".as_slice()))],
        )
        .unwrap();
        assert_eq!(dbm.get(b"x").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(dbm.get(b"y").unwrap(), b"2");
    }

    #[test]
    fn process_each_visits_everything_and_applies_removals() {
        let dbm = small();
        for i in 0..20u8 {
            dbm.set(&[i], &[i], true).unwrap();
        }

        struct Sweep {
            seen: usize,
            empty_calls: usize,
        }
        impl RecordProcessor for Sweep {
            fn process_full(&mut self, key: &[u8], _value: &[u8]) -> RecordAction {
                self.seen += 1;
                if key[0] % 2 == 0 {
                    RecordAction::Remove
                } else {
                    RecordAction::Keep
                }
            }
            fn process_empty(&mut self, _key: &[u8]) -> RecordAction {
                self.empty_calls += 1;
                RecordAction::Keep
            }
        }

        let mut sweep = Sweep { seen: 0, empty_calls: 0 };
        dbm.process_each(&mut sweep, true).unwrap();
        assert_eq!(sweep.seen, 20);
        assert_eq!(sweep.empty_calls, 2);
        assert_eq!(dbm.count(), 10);
    }

    #[test]
    fn rebuild_preserves_contents_and_fails_iterators() {
        let dbm = small();
        for i in 0..50u32 {
            dbm.set(&i.to_be_bytes(), &i.to_le_bytes(), true).unwrap();
        }
        let mut iter = dbm.iterator();
        iter.first().unwrap();

        dbm.rebuild_advanced(Some(101)).unwrap();
        assert_eq!(dbm.num_buckets(), 101);
        assert_eq!(dbm.count(), 50);
        for i in 0..50u32 {
            assert_eq!(dbm.get(&i.to_be_bytes()).unwrap(), i.to_le_bytes());
        }
        assert_eq!(iter.next().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn implicit_rebuild_picks_a_prime() {
        assert!(is_prime(DEFAULT_NUM_BUCKETS));
        assert_eq!(next_prime(8), 11);
        let above_default = next_prime(DEFAULT_NUM_BUCKETS + 1);
        assert!(above_default > DEFAULT_NUM_BUCKETS);
        assert!(is_prime(above_default));
    }

    #[test]
    fn should_be_rebuilt_tracks_load_factor() {
        let dbm = HashDbm::with_buckets(Some(16));
        assert!(!dbm.should_be_rebuilt());
        for i in 0..33u8 {
            dbm.set(&[i], b"", true).unwrap();
        }
        assert!(dbm.should_be_rebuilt());

        let sparse = HashDbm::with_buckets(Some(1000));
        sparse.set(b"only", b"one", true).unwrap();
        assert!(sparse.should_be_rebuilt());
    }

    #[test]
    fn iterator_walks_all_records_once() {
        let dbm = small();
        for i in 0..10u8 {
            dbm.set(&[i], &[i], true).unwrap();
        }
        let mut iter = dbm.iterator();
        assert_eq!(iter.get().unwrap_err().kind(), ErrorKind::NotFound);
        iter.first().unwrap();
        let mut seen = Vec::new();
        while let Ok((key, value)) = iter.get() {
            assert_eq!(key, value);
            seen.push(key[0]);
            iter.next().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn iterator_remove_slides_to_next_record() {
        let dbm = HashDbm::with_buckets(Some(1));
        dbm.set(b"a", b"1", true).unwrap();
        dbm.set(b"b", b"2", true).unwrap();
        dbm.set(b"c", b"3", true).unwrap();

        let mut iter = dbm.iterator();
        iter.jump(b"b").unwrap();
        let mut remover = RemoveProc { found: false };
        iter.process(&mut remover, true).unwrap();
        assert_eq!(dbm.count(), 2);
        let (key, _) = iter.get().unwrap();
        assert_eq!(key, b"c");
    }

    #[test]
    fn iterator_not_implemented_surface() {
        let dbm = small();
        let mut iter = dbm.iterator();
        assert_eq!(iter.last().unwrap_err().kind(), ErrorKind::NotImplemented);
        assert_eq!(
            iter.previous().unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
        assert_eq!(
            iter.jump_lower(b"k", true).unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
        assert_eq!(
            iter.jump_upper(b"k", false).unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
        assert!(!dbm.is_ordered());
        assert!(dbm.is_healthy());
    }

    #[test]
    fn clear_invalidates_iterators_and_resets_count() {
        let dbm = small();
        dbm.set(b"k", b"v", true).unwrap();
        let mut iter = dbm.iterator();
        iter.first().unwrap();

        dbm.clear().unwrap();
        assert_eq!(dbm.count(), 0);
        assert_eq!(iter.get().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn inspect_reports_the_contract_fields() {
        let dbm = HashDbm::with_buckets(Some(7));
        dbm.set(b"k", b"v", true).unwrap();
        let props: HashMap<String, String> = dbm.inspect().into_iter().collect();
        assert_eq!(props["class"], "HashDBM");
        assert_eq!(props["num_buckets"], "7");
        assert_eq!(props["num_records"], "1");
        assert_eq!(props["open"], "false");
        assert_eq!(props["writable"], "false");
        assert_eq!(props["healthy"], "true");
    }
}
