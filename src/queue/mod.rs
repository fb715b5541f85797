//! Bounded FIFO document queues with interchangeable backends
//!
//! Scanner and consumers only ever see [`DocumentQueue`]; which backend sits
//! behind it is decided by [`QueueOptions`]:
//!
//! - [`MemoryQueue`]: in-process ring buffer, for a co-located scan + spew
//! - [`SqlQueue`]: a SQLite table, shared by processes on one host
//! - [`RedisQueue`]: a Redis list, shared by processes on many hosts
//!
//! Blocking operations (`put`, `take`, and the timeout variants) suspend the
//! caller; the non-blocking ones (`offer`, `poll`) never do.

mod memory;
mod redis_queue;
mod sql_queue;

pub use memory::MemoryQueue;
pub use redis_queue::{RedisQueue, RedisQueueConfig, DEFAULT_REDIS_URL};
pub use sql_queue::{SqlQueue, SqlQueueConfig, DEFAULT_TABLE as DEFAULT_QUEUE_TABLE};

use crate::document::{Document, DocumentFactory};
use crate::error::{ConfigError, QueueError, QueueResult};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default queue name
pub const DEFAULT_QUEUE_NAME: &str = "docsweep";

/// Default capacity of a bounded queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Interval at which polling backends re-check for space or items
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Statistics for a queue instance
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Documents enqueued through this instance
    pub enqueued: AtomicU64,

    /// Documents dequeued through this instance
    pub dequeued: AtomicU64,

    /// Offers refused because the queue was full
    pub full_events: AtomicU64,
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn full_count(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }

    pub(crate) fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeue(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full(&self) {
        self.full_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Blocking FIFO of documents
pub trait DocumentQueue: Send + Sync {
    /// Queue name (backend key or table partition)
    fn name(&self) -> &str;

    /// Enqueue, blocking while the queue is full
    fn put(&self, doc: &Document) -> QueueResult<()>;

    /// Enqueue if there is room; returns `false` when full
    fn offer(&self, doc: &Document) -> QueueResult<bool>;

    /// Enqueue, waiting up to `timeout` for room
    fn offer_timeout(&self, doc: &Document, timeout: Duration) -> QueueResult<bool>;

    /// Dequeue, blocking while the queue is empty
    fn take(&self) -> QueueResult<Document>;

    /// Dequeue if an item is present
    fn poll(&self) -> QueueResult<Option<Document>>;

    /// Dequeue, waiting up to `timeout` for an item
    fn poll_timeout(&self, timeout: Duration) -> QueueResult<Option<Document>>;

    /// Number of queued documents
    fn size(&self) -> QueueResult<usize>;

    fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.size()? == 0)
    }

    fn contains(&self, doc: &Document) -> QueueResult<bool>;

    /// Keep only the first occurrence of each document, preserving order
    ///
    /// Returns the number of occurrences removed.
    fn remove_duplicates(&self) -> QueueResult<usize>;

    /// Remove up to `occurrences` copies of `doc` (0 removes all)
    ///
    /// Returns whether anything was removed.
    fn remove(&self, doc: &Document, occurrences: usize) -> QueueResult<bool>;

    /// Release backend resources; idempotent
    fn close(&self) -> QueueResult<()>;

    fn stats(&self) -> &QueueStats;
}

/// A queue whose backing collection outlives the process
pub trait DistributedQueue: DocumentQueue {
    /// Drop the whole backing collection
    fn delete(&self) -> QueueResult<()>;
}

/// Queue backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueType {
    #[default]
    Memory,
    Sql,
    Redis,
}

impl FromStr for QueueType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(QueueType::Memory),
            "sql" | "sqlite" => Ok(QueueType::Sql),
            "redis" => Ok(QueueType::Redis),
            _ => Err(ConfigError::InvalidQueueType(s.to_string())),
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Memory => write!(f, "memory"),
            QueueType::Sql => write!(f, "sql"),
            QueueType::Redis => write!(f, "redis"),
        }
    }
}

/// Queue backend configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub queue_type: QueueType,
    pub name: String,
    /// Maximum queued documents; 0 means unbounded
    pub capacity: usize,
    pub sql_path: Option<PathBuf>,
    pub sql_table: String,
    pub redis_url: String,
    pub poll_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue_type: QueueType::Memory,
            name: DEFAULT_QUEUE_NAME.to_string(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            sql_path: None,
            sql_table: sql_queue::DEFAULT_TABLE.to_string(),
            redis_url: redis_queue::DEFAULT_REDIS_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Open the configured queue backend
pub fn open_queue(options: &QueueOptions, factory: &DocumentFactory) -> QueueResult<Arc<dyn DocumentQueue>> {
    match options.queue_type {
        QueueType::Memory => Ok(Arc::new(MemoryQueue::new(&options.name, options.capacity))),
        QueueType::Sql => Ok(Arc::new(SqlQueue::open(
            sql_config(options)?,
            factory.clone(),
        )?)),
        QueueType::Redis => Ok(Arc::new(RedisQueue::open(
            redis_config(options),
            factory.clone(),
        )?)),
    }
}

/// Open the configured backend for maintenance (`delete`)
pub fn open_distributed(
    options: &QueueOptions,
    factory: &DocumentFactory,
) -> QueueResult<Box<dyn DistributedQueue>> {
    match options.queue_type {
        QueueType::Memory => Err(QueueError::InvalidConfig(
            "memory queues are not distributed".into(),
        )),
        QueueType::Sql => Ok(Box::new(SqlQueue::open(sql_config(options)?, factory.clone())?)),
        QueueType::Redis => Ok(Box::new(RedisQueue::open(redis_config(options), factory.clone())?)),
    }
}

fn sql_config(options: &QueueOptions) -> QueueResult<SqlQueueConfig> {
    let path = options
        .sql_path
        .clone()
        .ok_or_else(|| QueueError::InvalidConfig("sql queue requires a database path".into()))?;

    Ok(SqlQueueConfig {
        path,
        table: options.sql_table.clone(),
        name: options.name.clone(),
        capacity: options.capacity,
        poll_interval: options.poll_interval,
        ..Default::default()
    })
}

fn redis_config(options: &QueueOptions) -> RedisQueueConfig {
    RedisQueueConfig {
        url: options.redis_url.clone(),
        name: options.name.clone(),
        capacity: options.capacity,
        poll_interval: options.poll_interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_type_parsing() {
        assert_eq!("memory".parse::<QueueType>().unwrap(), QueueType::Memory);
        assert_eq!("SQL".parse::<QueueType>().unwrap(), QueueType::Sql);
        assert_eq!("redis".parse::<QueueType>().unwrap(), QueueType::Redis);
        assert!(matches!(
            "kafka".parse::<QueueType>(),
            Err(ConfigError::InvalidQueueType(_))
        ));
    }

    #[test]
    fn test_open_queue_selects_backend() {
        let factory = DocumentFactory::default();
        let queue = open_queue(&QueueOptions::default(), &factory).unwrap();
        assert_eq!(queue.name(), DEFAULT_QUEUE_NAME);

        let dir = tempfile::tempdir().unwrap();
        let options = QueueOptions {
            queue_type: QueueType::Sql,
            sql_path: Some(dir.path().join("queue.db")),
            ..Default::default()
        };
        let queue = open_queue(&options, &factory).unwrap();
        queue.put(&factory.create("/a", None)).unwrap();
        assert_eq!(queue.size().unwrap(), 1);
    }

    #[test]
    fn test_sql_queue_requires_path() {
        let options = QueueOptions {
            queue_type: QueueType::Sql,
            ..Default::default()
        };
        assert!(matches!(
            open_queue(&options, &DocumentFactory::default()),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_memory_queue_is_not_distributed() {
        assert!(open_distributed(&QueueOptions::default(), &DocumentFactory::default()).is_err());
    }
}
