//! SQLite-backed document queue
//!
//! Every queue lives in one shared table, partitioned by queue name:
//!
//! ```sql
//! CREATE TABLE <table> (
//!     seq      INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO order
//!     queue    TEXT NOT NULL,
//!     identity TEXT NOT NULL,                      -- document identity
//!     document TEXT NOT NULL                       -- JSON DocumentRecord
//! )
//! ```
//!
//! `contains`, `remove` and `remove_duplicates` match on `identity`, so two
//! records for the same document count as equal even if their sizes differ.
//!
//! Dequeue runs inside an IMMEDIATE transaction so concurrent consumers in
//! other processes never pop the same row. SQLite has no blocking reads, so
//! `take`/`put` poll at `poll_interval`.

use super::{DistributedQueue, DocumentQueue, QueueStats, DEFAULT_POLL_INTERVAL};
use crate::document::{Document, DocumentFactory, DocumentRecord};
use crate::error::{QueueError, QueueResult};
use crate::sql::{open_shared, validate_identifier};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default queue table
pub const DEFAULT_TABLE: &str = "docsweep_queue";

/// Configuration for a SQL queue
#[derive(Debug, Clone)]
pub struct SqlQueueConfig {
    pub path: PathBuf,
    pub table: String,
    pub seq_column: String,
    pub name_column: String,
    pub identity_column: String,
    pub document_column: String,
    pub name: String,
    /// Maximum queued documents; 0 means unbounded
    pub capacity: usize,
    pub poll_interval: Duration,
}

impl Default for SqlQueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsweep.db"),
            table: DEFAULT_TABLE.to_string(),
            seq_column: "seq".to_string(),
            name_column: "queue".to_string(),
            identity_column: "identity".to_string(),
            document_column: "document".to_string(),
            name: super::DEFAULT_QUEUE_NAME.to_string(),
            capacity: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Prepared SQL text for the configured table and columns
struct Statements {
    create_table: String,
    create_index: String,
    create_identity_index: String,
    insert: String,
    count: String,
    head: String,
    delete_seq: String,
    contains: String,
    dedupe: String,
    remove_all: String,
    remove_n: String,
    delete_queue: String,
}

impl Statements {
    fn new(c: &SqlQueueConfig) -> Self {
        let (t, seq, name, doc) = (&c.table, &c.seq_column, &c.name_column, &c.document_column);
        let key = &c.identity_column;
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    {seq} INTEGER PRIMARY KEY AUTOINCREMENT,
                    {name} TEXT NOT NULL,
                    {key} TEXT NOT NULL,
                    {doc} TEXT NOT NULL
                )"
            ),
            create_index: format!("CREATE INDEX IF NOT EXISTS idx_{t}_{name} ON {t}({name}, {seq})"),
            create_identity_index: format!("CREATE INDEX IF NOT EXISTS idx_{t}_{key} ON {t}({name}, {key})"),
            insert: format!("INSERT INTO {t} ({name}, {key}, {doc}) VALUES (?1, ?2, ?3)"),
            count: format!("SELECT COUNT(*) FROM {t} WHERE {name} = ?1"),
            head: format!("SELECT {seq}, {doc} FROM {t} WHERE {name} = ?1 ORDER BY {seq} LIMIT 1"),
            delete_seq: format!("DELETE FROM {t} WHERE {seq} = ?1"),
            contains: format!("SELECT EXISTS(SELECT 1 FROM {t} WHERE {name} = ?1 AND {key} = ?2)"),
            dedupe: format!(
                "DELETE FROM {t} WHERE {name} = ?1 AND {seq} NOT IN
                    (SELECT MIN({seq}) FROM {t} WHERE {name} = ?1 GROUP BY {key})"
            ),
            remove_all: format!("DELETE FROM {t} WHERE {name} = ?1 AND {key} = ?2"),
            remove_n: format!(
                "DELETE FROM {t} WHERE {seq} IN
                    (SELECT {seq} FROM {t} WHERE {name} = ?1 AND {key} = ?2 ORDER BY {seq} LIMIT ?3)"
            ),
            delete_queue: format!("DELETE FROM {t} WHERE {name} = ?1"),
        }
    }
}

/// Document queue stored in a SQLite table
pub struct SqlQueue {
    config: SqlQueueConfig,
    sql: Statements,
    factory: DocumentFactory,
    /// `None` once closed
    conn: Mutex<Option<Connection>>,
    stats: QueueStats,
}

impl SqlQueue {
    /// Open (creating if needed) the queue table
    pub fn open(config: SqlQueueConfig, factory: DocumentFactory) -> QueueResult<Self> {
        for ident in [
            &config.table,
            &config.seq_column,
            &config.name_column,
            &config.identity_column,
            &config.document_column,
        ] {
            validate_identifier(ident).map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        }

        let conn = open_shared(&config.path).map_err(|e| QueueError::ConnectionFailed {
            backend: format!("sqlite:{}", config.path.display()),
            reason: e.to_string(),
        })?;

        let sql = Statements::new(&config);
        conn.execute(&sql.create_table, [])?;
        conn.execute(&sql.create_index, [])?;
        conn.execute(&sql.create_identity_index, [])?;

        debug!(path = %config.path.display(), table = %config.table, queue = %config.name, "SQL queue opened");

        Ok(Self {
            config,
            sql,
            factory,
            conn: Mutex::new(Some(conn)),
            stats: QueueStats::default(),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> QueueResult<T>) -> QueueResult<T> {
        let mut guard = self.conn.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(QueueError::Closed {
                name: self.config.name.clone(),
            }),
        }
    }

    fn encode(doc: &Document) -> QueueResult<String> {
        Ok(serde_json::to_string(&doc.to_record())?)
    }

    fn try_push(&self, key: &str, json: &str) -> QueueResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if self.config.capacity > 0 {
                let count: i64 = tx.query_row(&self.sql.count, [&self.config.name], |row| row.get(0))?;
                if count as usize >= self.config.capacity {
                    return Ok(false);
                }
            }
            tx.execute(&self.sql.insert, params![self.config.name, key, json])?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn try_pop(&self) -> QueueResult<Option<Document>> {
        let json = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let head: Option<(i64, String)> = tx
                .query_row(&self.sql.head, [&self.config.name], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;

            if let Some((seq, _)) = &head {
                tx.execute(&self.sql.delete_seq, [seq])?;
            }
            tx.commit()?;
            Ok(head.map(|(_, json)| json))
        })?;

        match json {
            Some(json) => {
                let record: DocumentRecord = serde_json::from_str(&json)?;
                self.stats.record_dequeue();
                Ok(Some(self.factory.restore(record)))
            }
            None => Ok(None),
        }
    }

    /// Offer, re-polling until `deadline` (`None` waits forever)
    fn push_until(&self, doc: &Document, deadline: Option<Instant>) -> QueueResult<bool> {
        let key = doc.identity();
        let json = Self::encode(doc)?;
        loop {
            if self.try_push(&key, &json)? {
                self.stats.record_enqueue();
                return Ok(true);
            }
            if !self.sleep_until(deadline) {
                self.stats.record_full();
                return Ok(false);
            }
        }
    }

    fn pop_until(&self, deadline: Option<Instant>) -> QueueResult<Option<Document>> {
        loop {
            if let Some(doc) = self.try_pop()? {
                return Ok(Some(doc));
            }
            if !self.sleep_until(deadline) {
                return Ok(None);
            }
        }
    }

    /// Sleep one poll interval, clamped to the deadline
    ///
    /// Returns `false` if the deadline has already passed.
    fn sleep_until(&self, deadline: Option<Instant>) -> bool {
        let nap = match deadline {
            None => self.config.poll_interval,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                remaining.min(self.config.poll_interval)
            }
        };
        thread::sleep(nap);
        true
    }
}

impl DocumentQueue for SqlQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn put(&self, doc: &Document) -> QueueResult<()> {
        self.push_until(doc, None).map(|_| ())
    }

    fn offer(&self, doc: &Document) -> QueueResult<bool> {
        self.push_until(doc, Some(Instant::now()))
    }

    fn offer_timeout(&self, doc: &Document, timeout: Duration) -> QueueResult<bool> {
        self.push_until(doc, Some(Instant::now() + timeout))
    }

    fn take(&self) -> QueueResult<Document> {
        loop {
            if let Some(doc) = self.pop_until(None)? {
                return Ok(doc);
            }
        }
    }

    fn poll(&self) -> QueueResult<Option<Document>> {
        self.try_pop()
    }

    fn poll_timeout(&self, timeout: Duration) -> QueueResult<Option<Document>> {
        self.pop_until(Some(Instant::now() + timeout))
    }

    fn size(&self) -> QueueResult<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(&self.sql.count, [&self.config.name], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn contains(&self, doc: &Document) -> QueueResult<bool> {
        let key = doc.identity();
        self.with_conn(|conn| {
            Ok(conn.query_row(&self.sql.contains, params![self.config.name, &*key], |row| row.get(0))?)
        })
    }

    fn remove_duplicates(&self) -> QueueResult<usize> {
        self.with_conn(|conn| Ok(conn.execute(&self.sql.dedupe, [&self.config.name])?))
    }

    fn remove(&self, doc: &Document, occurrences: usize) -> QueueResult<bool> {
        let key = doc.identity();
        self.with_conn(|conn| {
            let removed = if occurrences == 0 {
                conn.execute(&self.sql.remove_all, params![self.config.name, &*key])?
            } else {
                conn.execute(
                    &self.sql.remove_n,
                    params![self.config.name, &*key, occurrences as i64],
                )?
            };
            Ok(removed > 0)
        })
    }

    fn close(&self) -> QueueResult<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| QueueError::from(e))?;
            debug!(queue = %self.config.name, "SQL queue closed");
        }
        Ok(())
    }

    fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

impl DistributedQueue for SqlQueue {
    fn delete(&self) -> QueueResult<()> {
        self.with_conn(|conn| {
            let removed = conn.execute(&self.sql.delete_queue, [&self.config.name])?;
            debug!(queue = %self.config.name, removed, "SQL queue deleted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, capacity: usize) -> SqlQueue {
        SqlQueue::open(
            SqlQueueConfig {
                path: dir.path().join("queue.db"),
                capacity,
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            DocumentFactory::default(),
        )
        .unwrap()
    }

    fn drain_paths(queue: &SqlQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(doc) = queue.poll().unwrap() {
            out.push(doc.path().to_string_lossy().into_owned());
        }
        out
    }

    #[test]
    fn test_fifo_and_restore() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 0);
        let factory = DocumentFactory::default();

        let mut doc = factory.create("/a", Some(3));
        doc.set_foreign_id("ext");
        queue.put(&doc).unwrap();
        queue.put(&factory.create("/b", None)).unwrap();

        let first = queue.take().unwrap();
        assert_eq!(first.size(), Some(3));
        assert_eq!(first.foreign_id(), Some("ext"));
        assert_eq!(drain_paths(&queue), vec!["/b"]);
    }

    #[test]
    fn test_capacity_bound() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 2);
        let factory = DocumentFactory::default();

        assert!(queue.offer(&factory.create("/a", None)).unwrap());
        assert!(queue.offer(&factory.create("/b", None)).unwrap());
        assert!(!queue.offer(&factory.create("/c", None)).unwrap());
        assert!(!queue
            .offer_timeout(&factory.create("/c", None), Duration::from_millis(20))
            .unwrap());
        assert_eq!(queue.size().unwrap(), 2);
    }

    #[test]
    fn test_remove_duplicates_and_remove() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 0);
        let factory = DocumentFactory::default();
        for path in ["/a", "/b", "/a", "/a"] {
            queue.put(&factory.create(path, None)).unwrap();
        }

        assert_eq!(queue.remove_duplicates().unwrap(), 2);
        assert!(queue.contains(&factory.create("/a", None)).unwrap());

        queue.put(&factory.create("/a", None)).unwrap();
        assert!(queue.remove(&factory.create("/a", None), 0).unwrap());
        assert!(!queue.remove(&factory.create("/a", None), 0).unwrap());
        assert_eq!(drain_paths(&queue), vec!["/b"]);
    }

    #[test]
    fn test_documents_match_by_identity_not_record() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 0);
        let factory = DocumentFactory::default();
        let small = factory.create("/a", Some(1));
        let large = factory.create("/a", Some(2));
        assert_eq!(small, large);

        queue.put(&small).unwrap();
        queue.put(&large).unwrap();
        queue.put(&factory.create("/b", None)).unwrap();

        assert!(queue.contains(&factory.create("/a", None)).unwrap());
        assert_eq!(queue.remove_duplicates().unwrap(), 1);
        assert_eq!(queue.take().unwrap().size(), Some(1));

        queue.put(&large).unwrap();
        assert!(queue.remove(&factory.create("/a", Some(7)), 1).unwrap());
        assert_eq!(drain_paths(&queue), vec!["/b"]);
    }

    #[test]
    fn test_queues_share_table_by_name() {
        let dir = TempDir::new().unwrap();
        let factory = DocumentFactory::default();
        let first = open(&dir, 0);
        let second = SqlQueue::open(
            SqlQueueConfig {
                path: dir.path().join("queue.db"),
                name: "other".into(),
                ..Default::default()
            },
            factory.clone(),
        )
        .unwrap();

        first.put(&factory.create("/a", None)).unwrap();
        assert_eq!(second.size().unwrap(), 0);

        second.put(&factory.create("/b", None)).unwrap();
        second.delete().unwrap();
        assert_eq!(second.size().unwrap(), 0);
        assert_eq!(first.size().unwrap(), 1);
    }

    #[test]
    fn test_poll_timeout_on_empty() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 0);
        let start = Instant::now();
        assert!(queue.poll_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_invalid_table_name() {
        let dir = TempDir::new().unwrap();
        let result = SqlQueue::open(
            SqlQueueConfig {
                path: dir.path().join("queue.db"),
                table: "bad name".into(),
                ..Default::default()
            },
            DocumentFactory::default(),
        );
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 0);
        queue.close().unwrap();
        queue.close().unwrap();
        assert!(matches!(queue.size(), Err(QueueError::Closed { .. })));
    }
}
