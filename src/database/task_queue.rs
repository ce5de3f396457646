//! # Bounded Worker Queue
//!
//! A fixed pool of worker threads draining a bounded queue of boxed tasks.
//! Submitters block while the queue is full, which bounds the memory held
//! by owned argument copies. Internal synchronization is a parking_lot
//! `Mutex` with three `Condvar`s:
//!
//! ```text
//! submitters ──► task_ready  ──► workers
//! workers    ──► space_ready ──► submitters blocked on a full queue
//! workers    ──► drained     ──► stop() waiting for in-flight work
//! ```
//!
//! ## Shutdown
//!
//! `stop(max_wait)` waits for the queue to drain up to the deadline, then
//! stops accepting work, discards whatever is still queued, and joins the
//! workers. Discarded tasks are dropped unexecuted; the async adapter
//! layers a promise over each task whose drop reports `Cancelled` to the
//! caller, so nothing blocks forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    capacity: usize,
    running: bool,
    active_workers: usize,
}

struct Shared {
    state: Mutex<State>,
    task_ready: Condvar,
    space_ready: Condvar,
    drained: Condvar,
}

/// Bounded multi-producer task queue served by worker threads.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Starts `num_threads` workers over a queue bounded at `capacity`
    /// pending tasks.
    pub fn new(num_threads: usize, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                running: true,
                active_workers: 0,
            }),
            task_ready: Condvar::new(),
            space_ready: Condvar::new(),
            drained: Condvar::new(),
        });
        let workers = (0..num_threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task, blocking while the queue is full. A task submitted
    /// after shutdown is dropped unexecuted.
    pub fn add(&self, task: Task) {
        let mut state = self.shared.state.lock();
        while state.running && state.tasks.len() >= state.capacity {
            self.shared.space_ready.wait(&mut state);
        }
        if !state.running {
            return;
        }
        state.tasks.push_back(task);
        self.shared.task_ready.notify_one();
    }

    /// Number of tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Drains the queue for at most `max_wait`, then stops the workers and
    /// discards anything still queued.
    pub fn stop(&self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        {
            let mut state = self.shared.state.lock();
            while state.running && !(state.tasks.is_empty() && state.active_workers == 0) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if self
                    .shared
                    .drained
                    .wait_for(&mut state, remaining)
                    .timed_out()
                {
                    break;
                }
            }
            state.running = false;
            state.tasks.clear();
        }
        self.shared.task_ready.notify_all();
        self.shared.space_ready.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(u32::MAX as u64));
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    state.active_workers += 1;
                    shared.space_ready.notify_one();
                    break task;
                }
                if !state.running {
                    return;
                }
                shared.task_ready.wait(&mut state);
            }
        };
        task();
        let mut state = shared.state.lock();
        state.active_workers -= 1;
        if state.tasks.is_empty() && state.active_workers == 0 {
            shared.drained.notify_all();
        }
    }
}
