//! The worker pool.
//!
//! Fixed-size pool of OS threads, each with its own bounded inbox
//! (`crossbeam_channel::bounded`, capacity 64). FIFO within a worker;
//! deliberately **no** work-stealing between workers — a tick's dispatch
//! decisions, not idle workers, decide which worker runs which task. A
//! worker's job is run inside `catch_unwind` so a panicking task becomes a
//! `WorkerFault` log event rather than taking down the pool.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::DispatchError;
use crate::trace::trace_event;

const INBOX_CAPACITY: usize = 64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A failed dispatch, carrying the job back so the caller can retry it.
pub struct DispatchFailure {
    pub reason: DispatchError,
    pub job: Job,
}

impl fmt::Debug for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchFailure")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// A fixed pool of worker threads, each draining its own bounded inbox.
pub struct WorkerPool {
    inboxes: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `worker_count` threads, each with an inbox of capacity 64.
    ///
    /// # Panics
    /// Panics if `worker_count` is zero.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "a worker pool needs at least one worker");

        let mut inboxes = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(INBOX_CAPACITY);
            let handle = std::thread::Builder::new()
                .name(format!("taskloom-worker-{index}"))
                .spawn(move || worker_loop(index, rx))
                .expect("failed to spawn worker thread");
            inboxes.push(tx);
            handles.push(handle);
        }

        Self {
            inboxes,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    /// The number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.inboxes.len()
    }

    /// Submits `job` to the next worker in round-robin order.
    ///
    /// # Errors
    /// On failure, returns the job back alongside the reason: `Full` means
    /// the caller (the scheduler's tick loop) should retry on a later tick
    /// rather than block; `ShuttingDown` means the pool is gone and the job
    /// should be dropped.
    pub fn dispatch(&self, job: Job) -> Result<(), DispatchFailure> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.inboxes.len();
        self.dispatch_to(index, job)
    }

    /// Submits `job` to a specific worker by index, e.g. to keep a chain's
    /// continuations on the same worker.
    ///
    /// # Panics
    /// Panics if `worker_index >= self.worker_count()`.
    pub fn dispatch_to(&self, worker_index: usize, job: Job) -> Result<(), DispatchFailure> {
        match self.inboxes[worker_index].try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(DispatchFailure {
                reason: DispatchError::Full,
                job,
            }),
            Err(TrySendError::Disconnected(job)) => Err(DispatchFailure {
                reason: DispatchError::ShuttingDown,
                job,
            }),
        }
    }

    /// Closes every inbox and joins every worker thread. Jobs already
    /// queued are still run; no new jobs may be dispatched once this
    /// returns.
    pub fn shutdown(mut self) {
        self.inboxes.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, inbox: Receiver<Job>) {
    while let Ok(job) = inbox.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            trace_event!(
                error,
                "worker_fault",
                crate::trace::TaskTraceInfo::default(),
                worker = index
            );
        }
    }
}
