//! Consumer-side polling loop over a document queue
//!
//! One drainer serves both co-located pipelines ("keep draining until the
//! scanner seals the latch") and sweeps ("take whatever is queued right
//! now"). Which one depends on how `poll` is configured, in precedence
//! order:
//!
//! 1. A latch is set: poll without blocking; when empty, wait on the latch
//!    and poll again. Stop once the latch is sealed and the queue is empty.
//! 2. No poll timeout: block until an item arrives.
//! 3. A positive poll timeout: wait up to that long.
//! 4. Otherwise: poll without blocking.

use crate::document::Document;
use crate::error::{LatchError, PipelineError, Result};
use crate::latch::SealableLatch;
use crate::queue::DocumentQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Slice in which blocking waits re-check the shutdown flag
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive recoverable queue failures tolerated before giving up
const MAX_POLL_RETRIES: u32 = 5;

/// Base delay between retries, doubled each attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Pulls documents off a queue and hands them to a callback
pub struct QueueDrainer {
    queue: Arc<dyn DocumentQueue>,
    latch: Option<Arc<dyn SealableLatch>>,
    poll_timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
}

impl QueueDrainer {
    /// A drainer that blocks for items indefinitely
    pub fn new(queue: Arc<dyn DocumentQueue>) -> Self {
        Self {
            queue,
            latch: None,
            poll_timeout: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait on `latch` when the queue runs dry; takes precedence over the
    /// poll timeout
    pub fn with_latch(mut self, latch: Arc<dyn SealableLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    /// `Some(ZERO)` never blocks, `None` blocks until an item arrives
    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drain until `poll` comes back empty; returns the number consumed
    pub fn drain<F>(&self, consumer: F) -> Result<u64>
    where
        F: FnMut(Document),
    {
        self.drain_inner(None, consumer)
    }

    /// Drain until empty or until `poison` is dequeued (not consumed)
    pub fn drain_until<F>(&self, poison: &Document, consumer: F) -> Result<u64>
    where
        F: FnMut(Document),
    {
        self.drain_inner(Some(poison), consumer)
    }

    fn drain_inner<F>(&self, poison: Option<&Document>, mut consumer: F) -> Result<u64>
    where
        F: FnMut(Document),
    {
        let mut drained = 0u64;

        loop {
            if self.is_shutdown() {
                info!(queue = %self.queue.name(), drained, "Drain interrupted by shutdown");
                break;
            }

            let doc = match self.poll_retrying()? {
                Some(doc) => doc,
                None => break,
            };

            if poison.is_some_and(|p| *p == doc) {
                debug!(queue = %self.queue.name(), "Poison pill received");
                break;
            }

            consumer(doc);
            drained += 1;
        }

        info!(queue = %self.queue.name(), drained, "Drain finished");
        Ok(drained)
    }

    /// `poll`, retrying recoverable queue failures with backoff
    fn poll_retrying(&self) -> Result<Option<Document>> {
        let mut attempt = 0;
        loop {
            match self.poll() {
                Err(PipelineError::Queue(e)) if e.is_recoverable() && attempt < MAX_POLL_RETRIES => {
                    attempt += 1;
                    warn!(queue = %self.queue.name(), attempt, error = %e, "Queue poll failed, retrying");
                    thread::sleep(RETRY_BACKOFF * 2u32.pow(attempt - 1));
                    if self.is_shutdown() {
                        return Ok(None);
                    }
                }
                other => return other,
            }
        }
    }

    /// Next document according to the configured precedence
    pub fn poll(&self) -> Result<Option<Document>> {
        if let Some(latch) = &self.latch {
            return self.poll_with_latch(latch.as_ref());
        }

        match self.poll_timeout {
            None => self.poll_blocking(),
            Some(timeout) if !timeout.is_zero() => Ok(self.queue.poll_timeout(timeout)?),
            Some(_) => Ok(self.queue.poll()?),
        }
    }

    fn poll_with_latch(&self, latch: &dyn SealableLatch) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.queue.poll()? {
                return Ok(Some(doc));
            }
            if self.is_shutdown() {
                return Ok(None);
            }

            match latch.wait_timeout(SHUTDOWN_CHECK_INTERVAL) {
                Ok(_) => continue,
                // Producer is done; whatever is left now is all there is
                Err(LatchError::Sealed) => return Ok(self.queue.poll()?),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `take` in slices so shutdown is observed
    fn poll_blocking(&self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.queue.poll_timeout(SHUTDOWN_CHECK_INTERVAL)? {
                return Ok(Some(doc));
            }
            if self.is_shutdown() {
                return Ok(None);
            }
        }
    }

    /// Run [`drain`](Self::drain) on a dedicated thread
    pub fn spawn<F>(self: Arc<Self>, consumer: F) -> std::io::Result<JoinHandle<Result<u64>>>
    where
        F: FnMut(Document) + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("drainer-{}", self.queue.name()))
            .spawn(move || self.drain(consumer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFactory;
    use crate::latch::LocalLatch;
    use crate::queue::MemoryQueue;
    use std::time::Instant;

    fn filled(paths: &[&str]) -> (Arc<MemoryQueue>, DocumentFactory) {
        let factory = DocumentFactory::default();
        let queue = Arc::new(MemoryQueue::new("test", 0));
        for path in paths {
            queue.put(&factory.create(*path, None)).unwrap();
        }
        (queue, factory)
    }

    #[test]
    fn test_nonblocking_drain() {
        let (queue, _) = filled(&["/a", "/b", "/c"]);
        let drainer = QueueDrainer::new(queue).with_poll_timeout(Some(Duration::ZERO));

        let mut seen = Vec::new();
        let drained = drainer.drain(|doc| seen.push(doc)).unwrap();
        assert_eq!(drained, 3);
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_timeout_drain_stops_when_idle() {
        let (queue, _) = filled(&["/a"]);
        let drainer = QueueDrainer::new(queue).with_poll_timeout(Some(Duration::from_millis(20)));

        let start = Instant::now();
        assert_eq!(drainer.drain(|_| {}).unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_poison_pill_stops_drain() {
        let (queue, factory) = filled(&["/a", "/stop", "/b"]);
        let drainer = QueueDrainer::new(queue.clone()).with_poll_timeout(Some(Duration::ZERO));

        let poison = factory.create("/stop", None);
        assert_eq!(drainer.drain_until(&poison, |_| {}).unwrap(), 1);
        assert_eq!(queue.size().unwrap(), 1);
    }

    #[test]
    fn test_latch_drain_follows_producer() {
        let factory = DocumentFactory::default();
        let queue = Arc::new(MemoryQueue::new("test", 0));
        let latch = Arc::new(LocalLatch::new());

        let drainer = Arc::new(QueueDrainer::new(queue.clone()).with_latch(latch.clone()));
        let handle = drainer.spawn(|_| {}).unwrap();

        for i in 0..5 {
            queue.put(&factory.create(format!("/doc{i}"), None)).unwrap();
            latch.signal().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        latch.seal().unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), 5);
    }

    #[test]
    fn test_shutdown_stops_blocking_drain() {
        let queue = Arc::new(MemoryQueue::new("test", 0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let drainer = Arc::new(QueueDrainer::new(queue).with_shutdown(shutdown.clone()));

        let handle = drainer.spawn(|_| {}).unwrap();
        thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);

        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }
}
