//! # Asynchronous Database Adapter
//!
//! [`AsyncDatabase`] wraps a shared [`HashDbm`] with a worker pool and
//! returns [`FutureResult`] handles to eventual results. Arguments are
//! copied into owned buffers at submission time, so callers keep no
//! obligations after an operation is queued; workers rebuild borrowed views
//! against the owned copies before running the underlying call.
//!
//! ## Completion Contract
//!
//! - Tasks on one queue run in FIFO submission order. With several
//!   workers there is no cross-operation ordering guarantee; a caller that
//!   needs one waits on the earlier handle before submitting the next.
//! - After the underlying call returns, the common postprocessor (if any)
//!   observes `(operation_name, status)`, and only then is the handle
//!   fulfilled.
//! - Tasks are not cancelable once submitted. Shutdown drains the queue up
//!   to a deadline; tasks dropped past it fulfill their handles with
//!   `Cancelled`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::DEFAULT_TASK_QUEUE_CAPACITY;
use crate::database::task_queue::TaskQueue;
use crate::database::{FileProcessor, HashDbm};
use crate::error::{Error, Result};

/// Hook observing every adapter operation after it completes.
pub trait Postprocessor: Send {
    fn postprocess(&mut self, operation: &str, status: &Result<()>);
}

impl<F: FnMut(&str, &Result<()>) + Send> Postprocessor for F {
    fn postprocess(&mut self, operation: &str, status: &Result<()>) {
        self(operation, status)
    }
}

struct HandleState<T> {
    slot: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Handle to the eventual result of a queued operation.
pub struct FutureResult<T> {
    state: Arc<HandleState<T>>,
}

impl<T> FutureResult<T> {
    /// Blocks until the result is available and takes it.
    pub fn get(self) -> Result<T> {
        let mut slot = self.state.slot.lock();
        while slot.is_none() {
            self.state.ready.wait(&mut slot);
        }
        slot.take().unwrap()
    }

    /// Waits up to `timeout` for the result, reporting readiness.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut slot = self.state.slot.lock();
        if slot.is_some() {
            return true;
        }
        self.state.ready.wait_for(&mut slot, timeout);
        slot.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state.slot.lock().is_some()
    }
}

/// Fulfillment side of a [`FutureResult`]. Dropping it unfulfilled (the
/// task was discarded at shutdown) reports `Cancelled` to the waiter.
struct Promise<T> {
    state: Arc<HandleState<T>>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    fn fulfill(mut self, value: Result<T>) {
        *self.state.slot.lock() = Some(value);
        self.state.ready.notify_all();
        self.fulfilled = true;
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            *self.state.slot.lock() = Some(Err(Error::cancelled("task dropped before execution")));
            self.state.ready.notify_all();
        }
    }
}

fn future_pair<T>() -> (FutureResult<T>, Promise<T>) {
    let state = Arc::new(HandleState {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        FutureResult {
            state: Arc::clone(&state),
        },
        Promise {
            state,
            fulfilled: false,
        },
    )
}

/// Worker-pool adapter offering the database surface as future-returning
/// operations.
pub struct AsyncDatabase {
    dbm: Arc<HashDbm>,
    queue: TaskQueue,
    postproc: Arc<Mutex<Option<Box<dyn Postprocessor>>>>,
}

impl std::fmt::Debug for AsyncDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDatabase").finish_non_exhaustive()
    }
}

impl AsyncDatabase {
    /// Wraps `dbm` with `num_worker_threads` workers.
    pub fn new(dbm: Arc<HashDbm>, num_worker_threads: usize) -> Result<Self> {
        if num_worker_threads == 0 {
            return Err(Error::invalid_argument("worker thread count must be positive"));
        }
        Ok(Self {
            dbm,
            queue: TaskQueue::new(num_worker_threads, DEFAULT_TASK_QUEUE_CAPACITY),
            postproc: Arc::new(Mutex::new(None)),
        })
    }

    /// The wrapped database.
    pub fn database(&self) -> &Arc<HashDbm> {
        &self.dbm
    }

    /// Installs the hook run after every operation; `None` removes it.
    pub fn set_common_postprocessor(&self, proc: Option<Box<dyn Postprocessor>>) {
        *self.postproc.lock() = proc;
    }

    fn submit<T, F>(&self, operation: &'static str, op: F) -> FutureResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&HashDbm) -> Result<T> + Send + 'static,
    {
        let (future, promise) = future_pair();
        let dbm = Arc::clone(&self.dbm);
        let postproc = Arc::clone(&self.postproc);
        self.queue.add(Box::new(move || {
            let result = op(&dbm);
            if let Some(proc) = postproc.lock().as_mut() {
                let status = result.as_ref().map(|_| ()).map_err(Clone::clone);
                proc.postprocess(operation, &status);
            }
            promise.fulfill(result);
        }));
        future
    }

    pub fn get(&self, key: &[u8]) -> FutureResult<Vec<u8>> {
        let key = key.to_vec();
        self.submit("Get", move |dbm| dbm.get(&key))
    }

    pub fn get_multi(&self, keys: &[&[u8]]) -> FutureResult<Vec<Option<Vec<u8>>>> {
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        self.submit("GetMulti", move |dbm| {
            let views: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
            dbm.get_multi(&views)
        })
    }

    pub fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> FutureResult<()> {
        let key = key.to_vec();
        let value = value.to_vec();
        self.submit("Set", move |dbm| dbm.set(&key, &value, overwrite))
    }

    pub fn set_multi(&self, records: &[(&[u8], &[u8])], overwrite: bool) -> FutureResult<()> {
        let records: Vec<(Vec<u8>, Vec<u8>)> = records
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        self.submit("SetMulti", move |dbm| {
            let views: Vec<(&[u8], &[u8])> = records
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            dbm.set_multi(&views, overwrite)
        })
    }

    pub fn remove(&self, key: &[u8]) -> FutureResult<()> {
        let key = key.to_vec();
        self.submit("Remove", move |dbm| dbm.remove(&key))
    }

    pub fn remove_multi(&self, keys: &[&[u8]]) -> FutureResult<()> {
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        self.submit("RemoveMulti", move |dbm| {
            let views: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
            dbm.remove_multi(&views)
        })
    }

    pub fn append(&self, key: &[u8], value: &[u8], delim: &[u8]) -> FutureResult<()> {
        let key = key.to_vec();
        let value = value.to_vec();
        let delim = delim.to_vec();
        self.submit("Append", move |dbm| dbm.append(&key, &value, &delim))
    }

    pub fn append_multi(&self, records: &[(&[u8], &[u8])], delim: &[u8]) -> FutureResult<()> {
        let records: Vec<(Vec<u8>, Vec<u8>)> = records
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        let delim = delim.to_vec();
        self.submit("AppendMulti", move |dbm| {
            let views: Vec<(&[u8], &[u8])> = records
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            dbm.append_multi(&views, &delim)
        })
    }

    pub fn compare_exchange(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        desired: Option<&[u8]>,
    ) -> FutureResult<()> {
        let key = key.to_vec();
        let expected = expected.map(|v| v.to_vec());
        let desired = desired.map(|v| v.to_vec());
        self.submit("CompareExchange", move |dbm| {
            dbm.compare_exchange(&key, expected.as_deref(), desired.as_deref())
        })
    }

    pub fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], Option<&[u8]>)],
        desired: &[(&[u8], Option<&[u8]>)],
    ) -> FutureResult<()> {
        let expected: Vec<(Vec<u8>, Option<Vec<u8>>)> = expected
            .iter()
            .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
            .collect();
        let desired: Vec<(Vec<u8>, Option<Vec<u8>>)> = desired
            .iter()
            .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
            .collect();
        self.submit("CompareExchangeMulti", move |dbm| {
            let expected_views: Vec<(&[u8], Option<&[u8]>)> = expected
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_deref()))
                .collect();
            let desired_views: Vec<(&[u8], Option<&[u8]>)> = desired
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_deref()))
                .collect();
            dbm.compare_exchange_multi(&expected_views, &desired_views)
        })
    }

    pub fn increment(&self, key: &[u8], increment: i64, initial: i64) -> FutureResult<i64> {
        let key = key.to_vec();
        self.submit("Increment", move |dbm| dbm.increment(&key, increment, initial))
    }

    pub fn clear(&self) -> FutureResult<()> {
        self.submit("Clear", |dbm| dbm.clear())
    }

    pub fn rebuild(&self) -> FutureResult<()> {
        self.submit("Rebuild", |dbm| dbm.rebuild())
    }

    pub fn synchronize(
        &self,
        hard: bool,
        mut file_proc: Option<Box<dyn FileProcessor + Send>>,
    ) -> FutureResult<()> {
        self.submit("Synchronize", move |dbm| {
            dbm.synchronize(
                hard,
                file_proc.as_mut().map(|p| p.as_mut() as &mut dyn FileProcessor),
            )
        })
    }

    /// Stops accepting work and drains in-flight tasks for at most
    /// `max_wait`; handles of discarded tasks report `Cancelled`.
    pub fn shutdown(&self, max_wait: Duration) {
        self.queue.stop(max_wait);
    }
}
