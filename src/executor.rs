//! Admission-controlled worker pool
//!
//! A fixed set of worker threads pulls jobs from a crossbeam channel. In
//! front of the channel sits a fair counting permit store sized to the
//! pool's maximum concurrency:
//!
//! ```text
//!  submit() ──► acquire permit ──► channel ──► worker N ──► job ──► TaskGuard drop
//!     ▲          (blocks caller)                                   │
//!     └──────────────────────── release permit ◄───────────────────┘
//! ```
//!
//! A fast producer calling `submit` is slowed to the pool's pace instead of
//! having its work rejected, so it needs no retry logic of its own.

use crate::error::{ExecutorError, ExecutorResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of waiting for permits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Acquired,
    TimedOut,
    Closed,
}

#[derive(Debug, Default)]
struct PermitState {
    available: usize,
    total: usize,
    next_ticket: u64,
    /// Tickets of blocked acquirers, served strictly in arrival order
    waiters: VecDeque<u64>,
    closed: bool,
}

/// Fair counting semaphore
#[derive(Debug)]
struct Permits {
    state: Mutex<PermitState>,
    cond: Condvar,
}

impl Permits {
    fn new(total: usize) -> Self {
        Self {
            state: Mutex::new(PermitState {
                available: total,
                total,
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, count: usize, deadline: Option<Instant>) -> Acquire {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if state.closed {
                state.waiters.retain(|t| *t != ticket);
                self.cond.notify_all();
                return Acquire::Closed;
            }

            if state.waiters.front() == Some(&ticket) && state.available >= count {
                state.waiters.pop_front();
                state.available -= count;
                // Let the next ticket in line re-check
                self.cond.notify_all();
                return Acquire::Acquired;
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    state.waiters.retain(|t| *t != ticket);
                    self.cond.notify_all();
                    return Acquire::TimedOut;
                }
                Some(deadline) => {
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn release(&self, count: usize) {
        let mut state = self.state.lock();
        state.available += count;
        self.cond.notify_all();
    }

    fn grow(&self, count: usize) {
        let mut state = self.state.lock();
        state.total += count;
        state.available += count;
        self.cond.notify_all();
    }

    /// Retire `count` permits, waiting for in-flight holders to return them
    fn shrink(&self, count: usize, deadline: Option<Instant>) -> Acquire {
        let outcome = self.acquire(count, deadline);
        if outcome == Acquire::Acquired {
            self.state.lock().total -= count;
        }
        outcome
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    fn total(&self) -> usize {
        self.state.lock().total
    }

    fn available(&self) -> usize {
        self.state.lock().available
    }
}

#[derive(Debug, Default)]
struct PoolState {
    in_flight: usize,
    live_workers: usize,
}

/// Pool bookkeeping shared with worker threads
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
    stats: ExecutorStats,
}

impl Shared {
    fn start_task(&self) {
        self.state.lock().in_flight += 1;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_task(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.cond.notify_all();
        }
    }

    fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.live_workers -= 1;
        if state.live_workers == 0 {
            self.cond.notify_all();
        }
    }
}

/// Statistics collected by the executor
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Tasks admitted into the pool
    pub submitted: AtomicU64,

    /// Tasks that ran to completion (including panics)
    pub completed: AtomicU64,

    /// Tasks that panicked
    pub panicked: AtomicU64,
}

impl ExecutorStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

/// RAII guard returning a permit when a task finishes, however it finishes
struct TaskGuard<'a> {
    permits: &'a Permits,
    shared: &'a Shared,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.permits.release(1);
        self.shared.finish_task();
    }
}

/// Fixed-size worker pool that blocks submitters when saturated
pub struct BoundedExecutor {
    name: String,
    permits: Arc<Permits>,
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes concurrent resize calls
    resize_lock: Mutex<()>,
    max_wait: Option<Duration>,
    shutdown: AtomicBool,
}

impl BoundedExecutor {
    /// Create a pool of `max_concurrency` workers whose submitters block
    /// indefinitely for a permit
    pub fn new(name: &str, max_concurrency: usize) -> ExecutorResult<Self> {
        Self::with_max_wait(name, max_concurrency, None)
    }

    /// Create a pool whose submitters give up after `max_wait`
    pub fn with_max_wait(
        name: &str,
        max_concurrency: usize,
        max_wait: Option<Duration>,
    ) -> ExecutorResult<Self> {
        if max_concurrency == 0 {
            return Err(ExecutorError::InvalidSize { size: 0 });
        }

        let (sender, receiver) = unbounded();
        let executor = Self {
            name: name.to_string(),
            permits: Arc::new(Permits::new(max_concurrency)),
            shared: Arc::new(Shared::default()),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::with_capacity(max_concurrency)),
            resize_lock: Mutex::new(()),
            max_wait,
            shutdown: AtomicBool::new(false),
        };

        executor.spawn_workers(max_concurrency)?;
        info!(pool = %executor.name, workers = max_concurrency, "Executor started");
        Ok(executor)
    }

    fn spawn_workers(&self, target: usize) -> ExecutorResult<()> {
        let mut workers = self.workers.lock();

        while workers.len() < target {
            let id = workers.len();
            let receiver = self.receiver.clone();
            let permits = Arc::clone(&self.permits);
            let shared = Arc::clone(&self.shared);
            let pool = self.name.clone();

            shared.state.lock().live_workers += 1;
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || worker_loop(&pool, id, receiver, &permits, &shared))
                .map_err(|e| {
                    self.shared.worker_exited();
                    ExecutorError::SpawnFailed {
                        id,
                        reason: e.to_string(),
                    }
                })?;

            workers.push(handle);
        }

        Ok(())
    }

    /// Submit a task, blocking until a permit is free
    ///
    /// Fails with [`ExecutorError::AdmissionTimeout`] if the configured max
    /// wait elapses, or [`ExecutorError::Shutdown`] if the pool is (or
    /// becomes) shut down while waiting.
    pub fn submit<F>(&self, task: F) -> ExecutorResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown);
        }

        let deadline = self.max_wait.map(|wait| Instant::now() + wait);
        match self.permits.acquire(1, deadline) {
            Acquire::Acquired => {}
            Acquire::TimedOut => {
                return Err(ExecutorError::AdmissionTimeout {
                    waited: self.max_wait.unwrap_or_default(),
                })
            }
            Acquire::Closed => return Err(ExecutorError::Shutdown),
        }

        self.shared.start_task();

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        };

        if !sent {
            // Pool rejected the task after admission; hand the permit back
            self.permits.release(1);
            self.shared.finish_task();
            return Err(ExecutorError::Shutdown);
        }

        Ok(())
    }

    /// Change the maximum concurrency
    ///
    /// Growing takes effect immediately. Shrinking waits (up to `timeout`)
    /// for enough in-flight tasks to finish and fails if they do not.
    pub fn resize(&self, max_concurrency: usize, timeout: Option<Duration>) -> ExecutorResult<()> {
        if max_concurrency == 0 {
            return Err(ExecutorError::InvalidSize { size: 0 });
        }

        let _guard = self.resize_lock.lock();
        let current = self.permits.total();

        if max_concurrency > current {
            self.spawn_workers(max_concurrency)?;
            self.permits.grow(max_concurrency - current);
        } else if max_concurrency < current {
            let deadline = timeout.map(|t| Instant::now() + t);
            match self.permits.shrink(current - max_concurrency, deadline) {
                Acquire::Acquired => {}
                Acquire::TimedOut => {
                    return Err(ExecutorError::ResizeFailed {
                        requested: max_concurrency,
                        reason: format!("in-flight tasks did not finish within {:?}", timeout.unwrap_or_default()),
                    })
                }
                Acquire::Closed => {
                    return Err(ExecutorError::ResizeFailed {
                        requested: max_concurrency,
                        reason: "executor is shut down".into(),
                    })
                }
            }
        }

        debug!(pool = %self.name, from = current, to = max_concurrency, "Executor resized");
        Ok(())
    }

    /// Block until no task is in flight
    pub fn await_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Block until no task is in flight or the timeout elapses
    ///
    /// Returns `true` if the pool went idle.
    pub fn await_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight == 0;
            }
        }
        true
    }

    /// Stop accepting tasks; already-admitted tasks still run
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        self.sender.lock().take();
        debug!(pool = %self.name, "Executor shutting down");
    }

    /// Wait for all workers to exit after [`shutdown`](Self::shutdown)
    ///
    /// Returns `true` if every worker exited within the timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.shared.state.lock();
            while state.live_workers > 0 {
                if self.shared.cond.wait_until(&mut state, deadline).timed_out()
                    && state.live_workers > 0
                {
                    return false;
                }
            }
        }

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.name, "Executor worker failed to join cleanly");
            }
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Current maximum concurrency
    pub fn max_concurrency(&self) -> usize {
        self.permits.total()
    }

    /// Permits not held by any task
    pub fn available_permits(&self) -> usize {
        self.permits.available()
    }

    /// Tasks admitted but not yet finished
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.shared.stats
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop: run jobs until the channel closes
fn worker_loop(pool: &str, id: usize, receiver: Receiver<Job>, permits: &Permits, shared: &Shared) {
    debug!(pool = %pool, worker = id, "Executor worker started");

    while let Ok(job) = receiver.recv() {
        let _guard = TaskGuard { permits, shared };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            shared.stats.panicked.fetch_add(1, Ordering::Relaxed);
            error!(pool = %pool, worker = id, "Task panicked: {}", panic_message(&panic));
        }
    }

    shared.worker_exited();
    debug!(pool = %pool, worker = id, "Executor worker finished");
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            BoundedExecutor::new("test", 0),
            Err(ExecutorError::InvalidSize { size: 0 })
        ));
    }

    #[test]
    fn test_runs_all_tasks() {
        let executor = BoundedExecutor::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            executor
                .submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        executor.await_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(executor.stats().completed(), 100);
        assert_eq!(executor.available_permits(), 4);
    }

    #[test]
    fn test_submit_blocks_when_saturated() {
        let executor = Arc::new(BoundedExecutor::new("test", 1).unwrap());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        executor
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();

        let admitted = Arc::new(AtomicBool::new(false));
        let handle = {
            let executor = Arc::clone(&executor);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                executor.submit(|| {}).unwrap();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        executor.await_idle();
    }

    #[test]
    fn test_admission_timeout() {
        let executor =
            BoundedExecutor::with_max_wait("test", 1, Some(Duration::from_millis(20))).unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        executor
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();

        let result = executor.submit(|| {});
        assert!(matches!(result, Err(ExecutorError::AdmissionTimeout { .. })));

        release_tx.send(()).unwrap();
        executor.await_idle();
    }

    #[test]
    fn test_panicking_task_releases_permit() {
        let executor = BoundedExecutor::new("test", 1).unwrap();
        executor.submit(|| panic!("boom")).unwrap();
        executor.await_idle();

        assert_eq!(executor.stats().panicked(), 1);
        assert_eq!(executor.available_permits(), 1);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        executor.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();
        executor.await_idle();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let executor = BoundedExecutor::new("test", 2).unwrap();
        executor.shutdown();
        assert_eq!(executor.submit(|| {}), Err(ExecutorError::Shutdown));
        assert!(executor.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let executor = BoundedExecutor::new("test", 2).unwrap();

        executor.resize(4, None).unwrap();
        assert_eq!(executor.max_concurrency(), 4);
        assert_eq!(executor.available_permits(), 4);

        executor.resize(1, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(executor.max_concurrency(), 1);
        assert_eq!(executor.available_permits(), 1);
    }

    #[test]
    fn test_shrink_times_out_while_busy() {
        let executor = BoundedExecutor::new("test", 2).unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let release_rx2 = release_rx.clone();

        executor
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        executor
            .submit(move || {
                let _ = release_rx2.recv();
            })
            .unwrap();

        let result = executor.resize(1, Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(ExecutorError::ResizeFailed { requested: 1, .. })));
        assert_eq!(executor.max_concurrency(), 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        executor.await_idle();
    }

    #[test]
    fn test_await_idle_timeout() {
        let executor = BoundedExecutor::new("test", 1).unwrap();
        assert!(executor.await_idle_timeout(Duration::from_millis(10)));

        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        executor
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        assert!(!executor.await_idle_timeout(Duration::from_millis(20)));

        release_tx.send(()).unwrap();
        assert!(executor.await_idle_timeout(Duration::from_secs(5)));
    }
}
