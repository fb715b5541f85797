//! Redis-backed report map
//!
//! Reports live in one hash at `<name>:reports`, field = document id,
//! value = JSON report. Out-of-memory replies and dropped connections are
//! journalable: both clear up on their own.

use super::{Report, ReportMap};
use crate::document::Document;
use crate::error::{ReportError, ReportErrorKind, ReportResult};
use parking_lot::Mutex;
use redis::{Client, Commands, Connection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Suffix of the hash key
const REPORTS_KEY_SUFFIX: &str = "reports";

const JOURNALABLE: &[ReportErrorKind] = &[ReportErrorKind::OutOfMemory, ReportErrorKind::Unavailable];

/// Configuration for a Redis report map
#[derive(Debug, Clone)]
pub struct RedisReportConfig {
    pub url: String,
    /// Key prefix, shared with the queue of the same name
    pub name: String,
}

impl Default for RedisReportConfig {
    fn default() -> Self {
        Self {
            url: crate::queue::RedisQueueConfig::default().url,
            name: crate::queue::DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

/// Report map stored in a Redis hash
pub struct RedisReportMap {
    client: Client,
    key: String,
    /// `None` after a dropped connection (reopened on next use) or close
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl RedisReportMap {
    pub fn open(config: RedisReportConfig) -> ReportResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_connection()?;
        let key = format!("{}:{}", config.name, REPORTS_KEY_SUFFIX);
        debug!(url = %config.url, key = %key, "Redis report map opened");

        Ok(Self {
            client,
            key,
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Drop every stored report
    pub fn wipe(&self) -> ReportResult<()> {
        self.with_conn(|conn| conn.del(&self.key))
    }

    /// Run `f` on the connection, reconnecting if a previous call dropped it
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>) -> ReportResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReportError::Closed);
        }

        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(self.client.get_connection()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(ReportError::Closed);
        };

        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    guard.take();
                }
                Err(e.into())
            }
        }
    }
}

impl ReportMap for RedisReportMap {
    fn fast_put(&self, doc: &Document, report: &Report) -> ReportResult<bool> {
        let id = doc.identity();
        let json = serde_json::to_string(report)?;
        let added: i64 = self.with_conn(|conn| conn.hset(&self.key, &*id, json))?;
        Ok(added == 1)
    }

    fn get(&self, doc: &Document) -> ReportResult<Option<Report>> {
        let id = doc.identity();
        let json: Option<String> = self.with_conn(|conn| conn.hget(&self.key, &*id))?;
        Ok(json.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    fn entries(&self) -> ReportResult<Vec<(String, Report)>> {
        let raw: HashMap<String, String> = self.with_conn(|conn| conn.hgetall(&self.key))?;
        let mut entries = raw
            .into_iter()
            .map(|(id, json)| Ok((id, serde_json::from_str::<Report>(&json)?)))
            .collect::<ReportResult<Vec<_>>>()?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn journalable(&self) -> &[ReportErrorKind] {
        JOURNALABLE
    }

    fn close(&self) -> ReportResult<()> {
        self.closed.store(true, Ordering::Release);
        self.conn.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFactory;
    use crate::report::ExtractionStatus;

    #[test]
    fn test_unavailable_is_journalable() {
        assert!(JOURNALABLE.contains(&ReportErrorKind::Unavailable));
        assert!(JOURNALABLE.contains(&ReportErrorKind::OutOfMemory));
        assert!(!JOURNALABLE.contains(&ReportErrorKind::Serialization));
    }

    #[test]
    #[ignore = "requires a running Redis server"]
    fn test_put_get_entries() {
        let map = RedisReportMap::open(RedisReportConfig {
            name: "docsweep:test".into(),
            ..Default::default()
        })
        .unwrap();
        map.wipe().unwrap();

        let doc = DocumentFactory::default().create("/r/a", None);
        assert!(map.fast_put(&doc, &Report::success()).unwrap());
        assert!(!map
            .fast_put(&doc, &Report::new(ExtractionStatus::NotRead, None))
            .unwrap());
        assert_eq!(
            map.get(&doc).unwrap().map(|r| r.status),
            Some(ExtractionStatus::NotRead)
        );
        assert_eq!(map.entries().unwrap().len(), 1);
        map.wipe().unwrap();
    }
}
