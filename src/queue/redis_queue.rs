//! Redis-backed distributed document queue
//!
//! Documents are JSON entries `{"identity": .., "document": DocumentRecord}`
//! in a Redis list at `<name>:queue`: RPUSH to enqueue, LPOP/BLPOP to
//! dequeue. Bounded offers run as a Lua script so the length check and push
//! are atomic across processes. `contains`, `remove` and
//! `remove_duplicates` are Lua scripts too, matching entries on their
//! identity rather than on the raw JSON.

use super::{DistributedQueue, DocumentQueue, QueueStats, DEFAULT_POLL_INTERVAL};
use crate::document::{Document, DocumentFactory, DocumentRecord};
use crate::error::{QueueError, QueueResult};
use parking_lot::Mutex;
use redis::{Client, Commands, Connection, Script};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Suffix of the list key
const QUEUE_KEY_SUFFIX: &str = "queue";

/// Push only while the list is shorter than ARGV[2]
const BOUNDED_PUSH: &str = r#"
if redis.call('LLEN', KEYS[1]) < tonumber(ARGV[2]) then
    redis.call('RPUSH', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

/// 1 if any entry has identity ARGV[1]
const CONTAINS: &str = r#"
for _, item in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
    if cjson.decode(item)['identity'] == ARGV[1] then
        return 1
    end
end
return 0
"#;

/// Remove the first ARGV[2] entries with identity ARGV[1] (0 = all)
const REMOVE: &str = r#"
local limit = tonumber(ARGV[2])
local matched = {}
for _, item in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
    if cjson.decode(item)['identity'] == ARGV[1] then
        table.insert(matched, item)
        if limit > 0 and #matched >= limit then
            break
        end
    end
end
for _, item in ipairs(matched) do
    redis.call('LREM', KEYS[1], 1, item)
end
return #matched
"#;

/// Keep the first entry per identity; returns the number removed
const DEDUPE: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
local seen = {}
local kept = {}
for _, item in ipairs(items) do
    local identity = cjson.decode(item)['identity']
    if not seen[identity] then
        seen[identity] = true
        table.insert(kept, item)
    end
end
local removed = #items - #kept
if removed > 0 then
    redis.call('DEL', KEYS[1])
    for _, item in ipairs(kept) do
        redis.call('RPUSH', KEYS[1], item)
    end
end
return removed
"#;

/// List entry: the record plus the identity it is matched on
#[derive(Debug, Serialize, Deserialize)]
struct QueueEntry {
    identity: String,
    document: DocumentRecord,
}

/// Configuration for a Redis queue
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Queue name, used as the key prefix
    pub name: String,
    /// Maximum queued documents; 0 means unbounded
    pub capacity: usize,
    /// Retry interval for `put`/`offer_timeout` on a full queue
    pub poll_interval: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            name: super::DEFAULT_QUEUE_NAME.to_string(),
            capacity: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RedisQueueConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Document queue stored in a Redis list
pub struct RedisQueue {
    config: RedisQueueConfig,
    key: String,
    factory: DocumentFactory,
    bounded_push: Script,
    contains_script: Script,
    remove_script: Script,
    dedupe_script: Script,
    commands: Mutex<Option<Connection>>,
    /// BLPOP parks this one, so it is kept apart from `commands`
    blocking: Mutex<Option<Connection>>,
    stats: QueueStats,
}

impl RedisQueue {
    pub fn open(config: RedisQueueConfig, factory: DocumentFactory) -> QueueResult<Self> {
        let connect_err = |e: redis::RedisError| QueueError::ConnectionFailed {
            backend: config.url.clone(),
            reason: e.to_string(),
        };

        let client = Client::open(config.url.as_str()).map_err(connect_err)?;
        let commands = client.get_connection().map_err(connect_err)?;
        let blocking = client.get_connection().map_err(connect_err)?;

        let key = format!("{}:{}", config.name, QUEUE_KEY_SUFFIX);
        debug!(url = %config.url, key = %key, "Redis queue opened");

        Ok(Self {
            key,
            factory,
            bounded_push: Script::new(BOUNDED_PUSH),
            contains_script: Script::new(CONTAINS),
            remove_script: Script::new(REMOVE),
            dedupe_script: Script::new(DEDUPE),
            commands: Mutex::new(Some(commands)),
            blocking: Mutex::new(Some(blocking)),
            stats: QueueStats::default(),
            config,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed {
            name: self.config.name.clone(),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> QueueResult<T>) -> QueueResult<T> {
        match self.commands.lock().as_mut() {
            Some(conn) => f(conn),
            None => Err(self.closed()),
        }
    }

    fn encode(doc: &Document) -> QueueResult<String> {
        let entry = QueueEntry {
            identity: doc.identity().into_owned(),
            document: doc.to_record(),
        };
        Ok(serde_json::to_string(&entry)?)
    }

    fn decode(&self, json: &str) -> QueueResult<Document> {
        let entry: QueueEntry = serde_json::from_str(json)?;
        self.stats.record_dequeue();
        Ok(self.factory.restore(entry.document))
    }

    fn try_push(&self, json: &str) -> QueueResult<bool> {
        self.with_conn(|conn| {
            if self.config.capacity == 0 {
                conn.rpush::<_, _, ()>(&self.key, json)?;
                return Ok(true);
            }
            let pushed: i64 = self
                .bounded_push
                .key(&self.key)
                .arg(json)
                .arg(self.config.capacity)
                .invoke(conn)?;
            Ok(pushed == 1)
        })
    }

    fn push_until(&self, doc: &Document, deadline: Option<Instant>) -> QueueResult<bool> {
        let json = Self::encode(doc)?;
        loop {
            if self.try_push(&json)? {
                self.stats.record_enqueue();
                return Ok(true);
            }

            let nap = match deadline {
                None => self.config.poll_interval,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.stats.record_full();
                        return Ok(false);
                    }
                    remaining.min(self.config.poll_interval)
                }
            };
            thread::sleep(nap);
        }
    }

    /// BLPOP with a timeout in seconds (0 blocks forever)
    fn blocking_pop(&self, timeout_secs: f64) -> QueueResult<Option<Document>> {
        let reply: Option<(String, String)> = match self.blocking.lock().as_mut() {
            Some(conn) => redis::cmd("BLPOP")
                .arg(&self.key)
                .arg(timeout_secs)
                .query(conn)?,
            None => return Err(self.closed()),
        };

        reply.map(|(_, json)| self.decode(&json)).transpose()
    }
}

impl DocumentQueue for RedisQueue {
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
            if let Some(doc) = self.blocking_pop(0.0)? {
                return Ok(doc);
            }
        }
    }

    fn poll(&self) -> QueueResult<Option<Document>> {
        let json: Option<String> = self.with_conn(|conn| Ok(conn.lpop(&self.key, None)?))?;
        json.map(|json| self.decode(&json)).transpose()
    }

    fn poll_timeout(&self, timeout: Duration) -> QueueResult<Option<Document>> {
        if timeout.is_zero() {
            return self.poll();
        }
        self.blocking_pop(timeout.as_secs_f64())
    }

    fn size(&self) -> QueueResult<usize> {
        self.with_conn(|conn| Ok(conn.llen(&self.key)?))
    }

    fn contains(&self, doc: &Document) -> QueueResult<bool> {
        let identity = doc.identity();
        self.with_conn(|conn| {
            let found: i64 = self.contains_script.key(&self.key).arg(&*identity).invoke(conn)?;
            Ok(found == 1)
        })
    }

    fn remove_duplicates(&self) -> QueueResult<usize> {
        self.with_conn(|conn| Ok(self.dedupe_script.key(&self.key).invoke(conn)?))
    }

    fn remove(&self, doc: &Document, occurrences: usize) -> QueueResult<bool> {
        let identity = doc.identity();
        self.with_conn(|conn| {
            let removed: usize = self
                .remove_script
                .key(&self.key)
                .arg(&*identity)
                .arg(occurrences)
                .invoke(conn)?;
            Ok(removed > 0)
        })
    }

    fn close(&self) -> QueueResult<()> {
        let had_conn = self.commands.lock().take().is_some();
        // A consumer parked in BLPOP holds this lock; its connection goes
        // away with the queue instead
        if let Some(mut blocking) = self.blocking.try_lock() {
            blocking.take();
        }
        if had_conn {
            debug!(key = %self.key, "Redis queue closed");
        }
        Ok(())
    }

    fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

impl DistributedQueue for RedisQueue {
    fn delete(&self) -> QueueResult<()> {
        self.with_conn(|conn| {
            conn.del::<_, ()>(&self.key)?;
            debug!(key = %self.key, "Redis queue deleted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(name: &str, capacity: usize) -> RedisQueue {
        let queue = RedisQueue::open(
            RedisQueueConfig {
                name: name.into(),
                capacity,
                ..Default::default()
            },
            DocumentFactory::default(),
        )
        .unwrap();
        queue.delete().unwrap();
        queue
    }

    #[test]
    fn test_config_defaults() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.url, DEFAULT_REDIS_URL);
        assert_eq!(config.capacity, 0);

        let custom = RedisQueueConfig::with_url("redis://queue-host:6380");
        assert_eq!(custom.url, "redis://queue-host:6380");
        assert_eq!(custom.name, "docsweep");
    }

    #[test]
    #[ignore = "requires a running Redis server"]
    fn test_fifo_and_dedupe() {
        let queue = open("docsweep:test:fifo", 0);
        let factory = DocumentFactory::default();
        for path in ["/a", "/b", "/a", "/a"] {
            queue.put(&factory.create(path, None)).unwrap();
        }

        assert_eq!(queue.remove_duplicates().unwrap(), 2);
        assert_eq!(queue.size().unwrap(), 2);
        assert_eq!(queue.take().unwrap().path().to_str(), Some("/a"));
        assert_eq!(
            queue.poll_timeout(Duration::from_millis(100)).unwrap().map(|d| d.path().to_path_buf()),
            Some("/b".into())
        );
        assert!(queue.poll().unwrap().is_none());
        queue.delete().unwrap();
    }

    #[test]
    #[ignore = "requires a running Redis server"]
    fn test_bounded_offer_and_remove() {
        let queue = open("docsweep:test:bounded", 1);
        let factory = DocumentFactory::default();
        let a = factory.create("/a", None);

        assert!(queue.offer(&a).unwrap());
        assert!(!queue.offer(&factory.create("/b", None)).unwrap());
        assert!(queue.contains(&a).unwrap());
        assert!(queue.remove(&a, 0).unwrap());
        assert!(!queue.remove(&a, 0).unwrap());
        queue.delete().unwrap();
    }

    #[test]
    #[ignore = "requires a running Redis server"]
    fn test_documents_match_by_identity_not_record() {
        let queue = open("docsweep:test:identity", 0);
        let factory = DocumentFactory::default();
        queue.put(&factory.create("/a", Some(1))).unwrap();
        queue.put(&factory.create("/a", Some(2))).unwrap();
        queue.put(&factory.create("/b", None)).unwrap();

        assert!(queue.contains(&factory.create("/a", None)).unwrap());
        assert_eq!(queue.remove_duplicates().unwrap(), 1);
        assert!(queue.remove(&factory.create("/a", Some(9)), 0).unwrap());
        assert_eq!(queue.take().unwrap().path().to_str(), Some("/b"));
        queue.delete().unwrap();
    }
}
