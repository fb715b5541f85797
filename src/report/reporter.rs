//! Journaling front end to a report map
//!
//! `save` writes straight through. If the write fails with a kind the map
//! declared journalable, the entry is parked in the journal and the error
//! is still returned, so the caller knows the status is not durable yet.
//! Every save then tries to flush the whole journal, but only if no other
//! flush is running: the gate is taken with `try_lock`, never waited on.

use super::{ExtractionStatus, Report, ReportCause, ReportMap};
use crate::document::Document;
use crate::error::{ReportError, ReportResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status recorder with transient-failure journaling
pub struct Reporter {
    map: Arc<dyn ReportMap>,
    /// Failed writes keyed by document identity
    journal: Mutex<HashMap<String, (Document, Report)>>,
    /// Held while a flush runs
    flush_gate: Mutex<()>,
}

impl Reporter {
    pub fn new(map: Arc<dyn ReportMap>) -> Self {
        Self {
            map,
            journal: Mutex::new(HashMap::new()),
            flush_gate: Mutex::new(()),
        }
    }

    /// Record `status` for `doc`
    pub fn save(&self, doc: &Document, status: ExtractionStatus) -> ReportResult<()> {
        self.save_report(doc, Report::new(status, None))
    }

    /// Record `status` for `doc` along with what caused it
    pub fn save_with_cause(
        &self,
        doc: &Document,
        status: ExtractionStatus,
        cause: ReportCause,
    ) -> ReportResult<()> {
        self.save_report(doc, Report::new(status, Some(cause)))
    }

    fn save_report(&self, doc: &Document, report: Report) -> ReportResult<()> {
        let key = doc.identity().into_owned();
        let result = self.map.fast_put(doc, &report);

        match &result {
            // Supersedes anything journaled for this document
            Ok(_) => {
                self.journal.lock().remove(&key);
            }
            Err(e) if !self.is_journalable(e) => return result.map(|_| ()),
            Err(e) => {
                warn!(
                    document = %key,
                    status = %report.status,
                    error = %e,
                    "Report write failed, journaling for retry"
                );
                self.journal.lock().insert(key, (doc.clone(), report));
            }
        }

        self.try_flush();
        result.map(|_| ())
    }

    fn is_journalable(&self, err: &ReportError) -> bool {
        self.map.journalable().contains(&err.kind())
    }

    /// Flush unless another flush is already running
    fn try_flush(&self) {
        if let Some(_gate) = self.flush_gate.try_lock() {
            self.flush_journal();
        }
    }

    /// Flush the journal, waiting for any in-progress flush first
    ///
    /// Returns the number of entries still journaled.
    pub fn flush(&self) -> usize {
        let _gate = self.flush_gate.lock();
        self.flush_journal()
    }

    /// Caller must hold the flush gate
    fn flush_journal(&self) -> usize {
        let pending: Vec<(String, Document, Report)> = self
            .journal
            .lock()
            .iter()
            .map(|(key, (doc, report))| (key.clone(), doc.clone(), report.clone()))
            .collect();

        if pending.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        for (key, doc, report) in pending {
            // Skip entries a later save already replaced or landed
            if !self.journal.lock().get(&key).is_some_and(|(_, r)| *r == report) {
                continue;
            }
            match self.map.fast_put(&doc, &report) {
                Ok(_) => {
                    let mut journal = self.journal.lock();
                    // A newer failed save for the same document stays queued
                    if journal.get(&key).is_some_and(|(_, r)| *r == report) {
                        journal.remove(&key);
                    }
                    flushed += 1;
                }
                Err(e) => {
                    debug!(document = %key, error = %e, "Journaled report still failing");
                }
            }
        }

        let remaining = self.journal.lock().len();
        if flushed > 0 {
            info!(flushed, remaining, "Flushed journaled reports");
        }
        remaining
    }

    /// Stored report for `doc`
    pub fn report(&self, doc: &Document) -> ReportResult<Option<Report>> {
        self.map.get(doc)
    }

    /// Whether `doc` is stored with `status`
    pub fn check(&self, doc: &Document, status: ExtractionStatus) -> ReportResult<bool> {
        Ok(self.report(doc)?.is_some_and(|r| r.status == status))
    }

    /// Number of writes waiting for a retry
    pub fn journal_len(&self) -> usize {
        self.journal.lock().len()
    }

    pub fn map(&self) -> &Arc<dyn ReportMap> {
        &self.map
    }

    /// Final blocking flush, then close the map
    pub fn close(&self) -> ReportResult<()> {
        let remaining = self.flush();
        if remaining > 0 {
            warn!(remaining, "Closing report map with unflushed journal entries");
        }
        self.map.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFactory;
    use crate::error::ReportErrorKind;
    use crate::report::MemoryReportMap;
    use std::collections::HashSet;

    /// Fails the first write for each listed path with a journalable error
    struct FlakyMap {
        inner: MemoryReportMap,
        fail_once: Mutex<HashSet<String>>,
        fail_always: Mutex<bool>,
        /// Fail this many upcoming writes, whatever the key
        fail_next: Mutex<usize>,
    }

    impl FlakyMap {
        fn new(paths: &[&str]) -> Self {
            Self {
                inner: MemoryReportMap::new(),
                fail_once: Mutex::new(paths.iter().map(|p| p.to_string()).collect()),
                fail_always: Mutex::new(false),
                fail_next: Mutex::new(0),
            }
        }
    }

    impl ReportMap for FlakyMap {
        fn fast_put(&self, doc: &Document, report: &Report) -> ReportResult<bool> {
            if *self.fail_always.lock() {
                return Err(ReportError::OutOfMemory("maxmemory reached".into()));
            }
            {
                let mut next = self.fail_next.lock();
                if *next > 0 {
                    *next -= 1;
                    return Err(ReportError::OutOfMemory("maxmemory reached".into()));
                }
            }
            let path = doc.path().to_string_lossy().into_owned();
            if self.fail_once.lock().remove(&path) {
                return Err(ReportError::OutOfMemory("maxmemory reached".into()));
            }
            self.inner.fast_put(doc, report)
        }

        fn get(&self, doc: &Document) -> ReportResult<Option<Report>> {
            self.inner.get(doc)
        }

        fn entries(&self) -> ReportResult<Vec<(String, Report)>> {
            self.inner.entries()
        }

        fn journalable(&self) -> &[ReportErrorKind] {
            &[ReportErrorKind::OutOfMemory]
        }

        fn close(&self) -> ReportResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_journaled_write_lands_eventually() {
        let map = Arc::new(FlakyMap::new(&["/k"]));
        let reporter = Reporter::new(map.clone());
        let factory = DocumentFactory::default();
        let k = factory.create("/k", None);

        let first = reporter.save(&k, ExtractionStatus::NotParsed);
        assert!(matches!(first, Err(ReportError::OutOfMemory(_))));

        reporter.save(&factory.create("/other", None), ExtractionStatus::Success).unwrap();

        assert_eq!(reporter.journal_len(), 0);
        assert!(reporter.check(&k, ExtractionStatus::NotParsed).unwrap());
    }

    #[test]
    fn test_journal_holds_until_backend_recovers() {
        let map = Arc::new(FlakyMap::new(&[]));
        *map.fail_always.lock() = true;
        let reporter = Reporter::new(map.clone());
        let factory = DocumentFactory::default();

        for path in ["/a", "/b", "/c"] {
            assert!(reporter.save(&factory.create(path, None), ExtractionStatus::Success).is_err());
        }
        assert_eq!(reporter.journal_len(), 3);

        *map.fail_always.lock() = false;
        assert_eq!(reporter.flush(), 0);
        assert_eq!(map.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_non_journalable_errors_are_not_kept() {
        let reporter = Reporter::new(Arc::new(MemoryReportMap::new()));
        reporter.map().close().unwrap();

        let doc = DocumentFactory::default().create("/a", None);
        assert_eq!(reporter.save(&doc, ExtractionStatus::Success), Err(ReportError::Closed));
        assert_eq!(reporter.journal_len(), 0);
    }

    #[test]
    fn test_successful_save_supersedes_journaled_report() {
        let map = Arc::new(FlakyMap::new(&[]));
        // The first save and the flush that follows it both fail
        *map.fail_next.lock() = 2;
        let reporter = Reporter::new(map.clone());
        let doc = DocumentFactory::default().create("/k", None);

        assert!(reporter.save(&doc, ExtractionStatus::NotRead).is_err());
        assert_eq!(reporter.journal_len(), 1);

        reporter.save(&doc, ExtractionStatus::Success).unwrap();
        assert_eq!(reporter.journal_len(), 0);
        assert!(reporter.check(&doc, ExtractionStatus::Success).unwrap());

        assert_eq!(reporter.flush(), 0);
        assert!(reporter.check(&doc, ExtractionStatus::Success).unwrap());
    }

    #[test]
    fn test_latest_journaled_report_wins() {
        let map = Arc::new(FlakyMap::new(&[]));
        *map.fail_always.lock() = true;
        let reporter = Reporter::new(map.clone());
        let doc = DocumentFactory::default().create("/a", None);

        let _ = reporter.save(&doc, ExtractionStatus::NotRead);
        let _ = reporter.save_with_cause(
            &doc,
            ExtractionStatus::NotParsed,
            ReportCause::new("Parse", "truncated"),
        );
        assert_eq!(reporter.journal_len(), 1);

        *map.fail_always.lock() = false;
        assert_eq!(reporter.flush(), 0);
        let stored = reporter.report(&doc).unwrap().unwrap();
        assert_eq!(stored.status, ExtractionStatus::NotParsed);
        assert_eq!(stored.cause.map(|c| c.message), Some("truncated".to_string()));

        reporter.close().unwrap();
        assert_eq!(map.inner.entries().unwrap_err(), ReportError::Closed);
    }
}
