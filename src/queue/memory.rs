//! In-process bounded document queue

use super::{DocumentQueue, QueueStats};
use crate::document::Document;
use crate::error::{QueueError, QueueResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// How long a blocking call is willing to wait
#[derive(Clone, Copy)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

impl Wait {
    fn timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Wait::Never
        } else {
            Wait::Until(Instant::now() + timeout)
        }
    }
}

struct Inner {
    items: VecDeque<Document>,
    closed: bool,
}

/// Bounded FIFO held in memory
///
/// A capacity of 0 makes the queue effectively unbounded.
pub struct MemoryQueue {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    stats: QueueStats,
}

impl MemoryQueue {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_full(&self, inner: &Inner) -> bool {
        self.capacity > 0 && inner.items.len() >= self.capacity
    }

    fn check_open(&self, inner: &Inner) -> QueueResult<()> {
        if inner.closed {
            Err(QueueError::Closed {
                name: self.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Block on `cond` until woken or the deadline passes
    ///
    /// Returns `false` once the wait is exhausted.
    fn block(cond: &Condvar, inner: &mut MutexGuard<'_, Inner>, wait: Wait) -> bool {
        match wait {
            Wait::Never => false,
            Wait::Forever => {
                cond.wait(inner);
                true
            }
            Wait::Until(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                cond.wait_until(inner, deadline);
                true
            }
        }
    }

    fn push(&self, doc: &Document, wait: Wait) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        loop {
            self.check_open(&inner)?;
            if !self.is_full(&inner) {
                inner.items.push_back(doc.clone());
                self.stats.record_enqueue();
                self.not_empty.notify_one();
                return Ok(true);
            }
            if !Self::block(&self.not_full, &mut inner, wait) {
                self.stats.record_full();
                return Ok(false);
            }
        }
    }

    fn pop(&self, wait: Wait) -> QueueResult<Option<Document>> {
        let mut inner = self.inner.lock();
        loop {
            self.check_open(&inner)?;
            if let Some(doc) = inner.items.pop_front() {
                self.stats.record_dequeue();
                self.not_full.notify_one();
                return Ok(Some(doc));
            }
            if !Self::block(&self.not_empty, &mut inner, wait) {
                return Ok(None);
            }
        }
    }
}

impl DocumentQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, doc: &Document) -> QueueResult<()> {
        self.push(doc, Wait::Forever).map(|_| ())
    }

    fn offer(&self, doc: &Document) -> QueueResult<bool> {
        self.push(doc, Wait::Never)
    }

    fn offer_timeout(&self, doc: &Document, timeout: Duration) -> QueueResult<bool> {
        self.push(doc, Wait::timeout(timeout))
    }

    fn take(&self) -> QueueResult<Document> {
        loop {
            if let Some(doc) = self.pop(Wait::Forever)? {
                return Ok(doc);
            }
        }
    }

    fn poll(&self) -> QueueResult<Option<Document>> {
        self.pop(Wait::Never)
    }

    fn poll_timeout(&self, timeout: Duration) -> QueueResult<Option<Document>> {
        self.pop(Wait::timeout(timeout))
    }

    fn size(&self) -> QueueResult<usize> {
        Ok(self.inner.lock().items.len())
    }

    fn contains(&self, doc: &Document) -> QueueResult<bool> {
        Ok(self.inner.lock().items.iter().any(|d| d == doc))
    }

    fn remove_duplicates(&self) -> QueueResult<usize> {
        let mut inner = self.inner.lock();
        let before = inner.items.len();

        let mut seen = HashSet::with_capacity(before);
        inner
            .items
            .retain(|doc| seen.insert(doc.identity().into_owned()));

        let removed = before - inner.items.len();
        if removed > 0 {
            self.not_full.notify_all();
        }
        Ok(removed)
    }

    fn remove(&self, doc: &Document, occurrences: usize) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        let before = inner.items.len();

        let mut remaining = if occurrences == 0 { usize::MAX } else { occurrences };
        inner.items.retain(|d| {
            if remaining > 0 && d == doc {
                remaining -= 1;
                false
            } else {
                true
            }
        });

        let removed = before != inner.items.len();
        if removed {
            self.not_full.notify_all();
        }
        Ok(removed)
    }

    fn close(&self) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        Ok(())
    }

    fn stats(&self) -> &QueueStats {
        &self.stats
    }
}
