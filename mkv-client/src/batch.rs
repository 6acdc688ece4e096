//! # Bounded Worker Pool
//!
//! Purpose: Execute independent jobs on a fixed set of OS threads so batch
//! operations overlap their network round-trips.
//!
//! ## Design Principles
//! 1. **Start Once**: Worker threads spawn at most once per pool, no matter
//!    how many callers race to start it.
//! 2. **Drain Before Death**: Stopping closes the intake but lets workers
//!    finish every job already queued.
//! 3. **Reject, Never Block**: Enqueueing after stop fails immediately with
//!    a typed error instead of hanging.

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use mkv_common::{Error, Result};

/// How long an idle worker waits for a job before re-checking the channel.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// A unit of work for the pool. Jobs carry their own completion signalling
/// (typically a channel sender) since the pool does not return values.
pub trait Job: Send + 'static {
    fn run(self);
}

struct WorkerState<J> {
    started: bool,
    tx: Option<Sender<J>>,
    handles: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of worker threads consuming jobs from a shared queue.
pub struct WorkerPool<J: Job> {
    size: usize,
    state: Mutex<WorkerState<J>>,
    rx: Receiver<J>,
}

impl<J: Job> WorkerPool<J> {
    /// Creates a pool of `size` workers. Threads spawn lazily on
    /// [`start`](WorkerPool::start).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded();
        WorkerPool {
            size,
            state: Mutex::new(WorkerState { started: false, tx: Some(tx), handles: Vec::new() }),
            rx,
        }
    }

    /// Worker count matching the machine's available parallelism.
    pub fn default_size() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    /// Spawns the worker threads. Only the first call does anything; racing
    /// callers serialize on the state lock and observe `started`.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if state.started {
            return;
        }
        state.started = true;
        debug!(workers = self.size, "starting worker pool");
        for index in 0..self.size {
            let rx = self.rx.clone();
            let handle = thread::Builder::new()
                .name(format!("mkv-worker-{index}"))
                .spawn(move || worker_loop(rx))
                .unwrap_or_else(|err| panic!("failed to spawn worker thread: {err}"));
            state.handles.push(handle);
        }
    }

    /// Queues a job for the workers. Fails once the pool has been stopped.
    pub fn enqueue(&self, job: J) -> Result<()> {
        let state = lock(&self.state);
        match &state.tx {
            Some(tx) => {
                // the receiver lives on self, send cannot fail here
                let _ = tx.send(job);
                Ok(())
            }
            None => Err(Error::WorkerPoolStopped),
        }
    }

    /// Stops the pool: closes the intake, lets workers drain the queue, and
    /// joins them. A never-started pool stops trivially; enqueueing after
    /// stop fails either way.
    pub fn stop(&self) {
        let (tx, handles) = {
            let mut state = lock(&self.state);
            // a stopped pool must also refuse a later start
            state.started = true;
            (state.tx.take(), std::mem::take(&mut state.handles))
        };
        // dropping the sole sender lets workers drain, then disconnect
        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of worker threads this pool runs when started.
    pub fn worker_count(&self) -> usize {
        self.size
    }
}

fn worker_loop<J: Job>(rx: Receiver<J>) {
    loop {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(job) => job.run(),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                trace!("worker queue closed, exiting");
                break;
            }
        }
    }
}

fn lock<J>(state: &Mutex<WorkerState<J>>) -> MutexGuard<'_, WorkerState<J>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingJob {
        counter: Arc<AtomicUsize>,
        done: Sender<usize>,
    }

    impl Job for CountingJob {
        fn run(self) {
            let seen = self.counter.fetch_add(1, Ordering::SeqCst);
            let _ = self.done.send(seen);
        }
    }

    #[test]
    fn test_runs_queued_jobs() {
        let pool = WorkerPool::new(4);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();
        for _ in 0..32 {
            pool.enqueue(CountingJob { counter: Arc::clone(&counter), done: done_tx.clone() })
                .expect("enqueue");
        }
        for _ in 0..32 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("job completion");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        pool.stop();
    }

    #[test]
    fn test_start_is_idempotent_under_races() {
        let pool: Arc<WorkerPool<CountingJob>> = Arc::new(WorkerPool::new(3));
        let mut starters = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            starters.push(thread::spawn(move || pool.start()));
        }
        for starter in starters {
            starter.join().expect("join");
        }
        let state = lock(&pool.state);
        assert_eq!(state.handles.len(), 3, "exactly one start must win");
        drop(state);
        pool.stop();
    }

    #[test]
    fn test_stop_drains_queued_jobs() {
        let pool = WorkerPool::new(1);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, _done_rx) = unbounded();
        for _ in 0..16 {
            pool.enqueue(CountingJob { counter: Arc::clone(&counter), done: done_tx.clone() })
                .expect("enqueue");
        }
        pool.stop();
        // stop joins the workers, so every queued job already ran
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let pool = WorkerPool::new(2);
        pool.start();
        pool.stop();
        let (done_tx, _done_rx) = unbounded();
        let result = pool.enqueue(CountingJob {
            counter: Arc::new(AtomicUsize::new(0)),
            done: done_tx,
        });
        assert!(matches!(result.unwrap_err(), Error::WorkerPoolStopped));
    }

    #[test]
    fn test_stop_without_start_is_safe() {
        let pool: WorkerPool<CountingJob> = WorkerPool::new(2);
        pool.stop();
        // start after stop must not spawn anything
        pool.start();
        let state = lock(&pool.state);
        assert!(state.handles.is_empty());
    }

    #[test]
    fn test_zero_size_is_clamped_to_one() {
        let pool: WorkerPool<CountingJob> = WorkerPool::new(0);
        assert_eq!(pool.worker_count(), 1);
    }
}
