//! # Memory-Mapped File Integration Tests
//!
//! Concurrency and durability scenarios for the two storage variants:
//!
//! 1. **Append monotonicity**: concurrent appenders receive pairwise
//!    disjoint offsets whose union covers the final extent without gaps
//! 2. **Per-thread ordering**: one thread's appends land at increasing
//!    offsets in submission order
//! 3. **Durability**: contents survive close and reopen through both
//!    variants, and synchronize leaves the on-disk length exact

use std::sync::{Arc, Barrier};
use std::thread;

use tidepool::{ErrorKind, MmapAtomicFile, MmapParallelFile, OpenFlags, StorageFile};

const THREADS: usize = 8;
const APPENDS_PER_THREAD: usize = 128;
const CHUNK: usize = 1024;

fn chunk_payload(thread_id: usize, seq: usize) -> Vec<u8> {
    let mut payload = vec![0u8; CHUNK];
    payload[0] = thread_id as u8;
    payload[1] = (seq >> 8) as u8;
    payload[2] = (seq & 0xFF) as u8;
    for (i, byte) in payload.iter_mut().enumerate().skip(3) {
        *byte = (thread_id * 31 + seq * 7 + i) as u8;
    }
    payload
}

fn concurrent_append_scenario(file: Arc<dyn StorageFile>) {
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let file = Arc::clone(&file);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut offsets = Vec::with_capacity(APPENDS_PER_THREAD);
                for seq in 0..APPENDS_PER_THREAD {
                    let off = file.append(&chunk_payload(thread_id, seq)).unwrap();
                    offsets.push(off);
                }
                offsets
            })
        })
        .collect();

    let mut all_offsets: Vec<(u64, usize, usize)> = Vec::new();
    for (thread_id, handle) in handles.into_iter().enumerate() {
        let offsets = handle.join().unwrap();
        // Submission order within a thread lands at increasing offsets.
        for pair in offsets.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for (seq, off) in offsets.into_iter().enumerate() {
            all_offsets.push((off, thread_id, seq));
        }
    }

    let total = (THREADS * APPENDS_PER_THREAD * CHUNK) as u64;
    assert_eq!(file.size().unwrap(), total);
    assert_eq!(total, 1_048_576);

    // Offsets are pairwise disjoint and cover [0, total) without gaps.
    all_offsets.sort_unstable();
    for (rank, (off, _, _)) in all_offsets.iter().enumerate() {
        assert_eq!(*off, (rank * CHUNK) as u64);
    }

    // Every chunk read back matches the payload its thread submitted.
    for (off, thread_id, seq) in &all_offsets {
        let mut buf = vec![0u8; CHUNK];
        file.read(*off, &mut buf).unwrap();
        assert_eq!(buf, chunk_payload(*thread_id, *seq));
    }
}

#[test]
fn parallel_variant_concurrent_appends_cover_one_mebibyte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parallel.tdp");
    let file = Arc::new(MmapParallelFile::new());
    file.open(&path, true, OpenFlags::empty()).unwrap();

    concurrent_append_scenario(Arc::clone(&file) as Arc<dyn StorageFile>);

    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_048_576);
}

#[test]
fn atomic_variant_concurrent_appends_cover_one_mebibyte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atomic.tdp");
    let file = Arc::new(MmapAtomicFile::new());
    file.open(&path, true, OpenFlags::empty()).unwrap();

    concurrent_append_scenario(Arc::clone(&file) as Arc<dyn StorageFile>);

    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_048_576);
}

#[test]
fn concurrent_readers_see_stable_zones_during_growth() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readers.tdp");
    let file = Arc::new(MmapParallelFile::new());
    file.set_allocation_strategy(4096, 2.0).unwrap();
    file.open(&path, true, OpenFlags::empty()).unwrap();
    file.append(&vec![0x5Au8; 4096]).unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let file = Arc::clone(&file);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut buf = vec![0u8; 4096];
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    file.read(0, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == 0x5A));
                }
            })
        })
        .collect();

    // Force repeated remaps underneath the readers.
    for _ in 0..64 {
        file.append(&vec![0xC3u8; 8192]).unwrap();
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }
    file.close().unwrap();
}

#[test]
fn contents_survive_reopen_across_variants() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cross.tdp");

    let writer = MmapParallelFile::new();
    writer.open(&path, true, OpenFlags::empty()).unwrap();
    writer.append(b"written by the parallel variant").unwrap();
    writer.close().unwrap();

    let reader = MmapAtomicFile::new();
    reader.open(&path, false, OpenFlags::empty()).unwrap();
    assert_eq!(
        reader.read_simple(0, 31),
        b"written by the parallel variant".to_vec()
    );
    reader.close().unwrap();
}

#[test]
fn no_wait_lock_contention_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.tdp");

    let holder = MmapParallelFile::new();
    holder.open(&path, true, OpenFlags::empty()).unwrap();

    let contender = MmapParallelFile::new();
    let err = contender
        .open(&path, true, OpenFlags::NO_WAIT)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::System);

    // Opting out of locking bypasses the contention entirely.
    let unlocked = MmapParallelFile::new();
    unlocked
        .open(&path, false, OpenFlags::NO_LOCK)
        .unwrap();
    unlocked.close().unwrap();

    holder.close().unwrap();
}

#[test]
fn synchronize_truncates_disk_to_logical_size_for_both_variants() {
    let dir = tempfile::tempdir().unwrap();
    for (name, file) in [
        ("p.tdp", Box::new(MmapParallelFile::new()) as Box<dyn StorageFile>),
        ("a.tdp", Box::new(MmapAtomicFile::new()) as Box<dyn StorageFile>),
    ] {
        let path = dir.path().join(name);
        file.open(&path, true, OpenFlags::empty()).unwrap();
        file.append(&vec![1u8; 777]).unwrap();

        // The writable mapping preallocates beyond the logical size.
        assert!(std::fs::metadata(&path).unwrap().len() >= 777);
        file.synchronize(true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 777);

        file.synchronize(false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 777);

        file.append(b"x").unwrap();
        assert_eq!(file.size().unwrap(), 778);
        file.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 778);
    }
}

#[test]
fn expand_reserves_a_gap_that_reads_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gap.tdp");
    let file = MmapParallelFile::new();
    file.open(&path, true, OpenFlags::empty()).unwrap();

    file.append(b"head").unwrap();
    let gap_at = file.expand(100).unwrap();
    assert_eq!(gap_at, 4);
    let tail_at = file.append(b"tail").unwrap();
    assert_eq!(tail_at, 104);

    let mut gap = vec![0xFFu8; 100];
    file.read(gap_at, &mut gap).unwrap();
    assert!(gap.iter().all(|&b| b == 0));
    file.close().unwrap();
}
