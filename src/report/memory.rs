//! In-process report map

use super::{Report, ReportMap};
use crate::document::Document;
use crate::error::{ReportError, ReportErrorKind, ReportResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Report map held in a `HashMap`; nothing it does is transient
#[derive(Debug, Default)]
pub struct MemoryReportMap {
    reports: RwLock<HashMap<String, Report>>,
    closed: AtomicBool,
}

impl MemoryReportMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> ReportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ReportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ReportMap for MemoryReportMap {
    fn fast_put(&self, doc: &Document, report: &Report) -> ReportResult<bool> {
        self.check_open()?;
        let key = doc.identity().into_owned();
        Ok(self.reports.write().insert(key, report.clone()).is_none())
    }

    fn get(&self, doc: &Document) -> ReportResult<Option<Report>> {
        self.check_open()?;
        Ok(self.reports.read().get(&*doc.identity()).cloned())
    }

    fn entries(&self) -> ReportResult<Vec<(String, Report)>> {
        self.check_open()?;
        let mut entries: Vec<_> = self
            .reports
            .read()
            .iter()
            .map(|(id, report)| (id.clone(), report.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn journalable(&self) -> &[ReportErrorKind] {
        &[]
    }

    fn close(&self) -> ReportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFactory;
    use crate::report::ExtractionStatus;

    #[test]
    fn test_fast_put_reports_new_keys() {
        let map = MemoryReportMap::new();
        let doc = DocumentFactory::default().create("/a", None);

        assert!(map.fast_put(&doc, &Report::success()).unwrap());
        let failed = Report::new(ExtractionStatus::NotRead, None);
        assert!(!map.fast_put(&doc, &failed).unwrap());

        assert_eq!(map.get(&doc).unwrap(), Some(failed));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unhashed_digest_document_keyed_by_path() {
        use crate::identity::{DigestAlgorithm, DigestIdentifier};
        use std::sync::Arc;

        let factory = DocumentFactory::new(Arc::new(DigestIdentifier::with_algorithm(
            DigestAlgorithm::Sha256,
        )));
        let doc = factory.create("/missing.txt", None);
        assert!(doc.id().is_err());

        let map = MemoryReportMap::new();
        let failed = Report::new(ExtractionStatus::NotFound, None);
        assert!(map.fast_put(&doc, &failed).unwrap());
        assert_eq!(map.get(&doc).unwrap(), Some(failed.clone()));
        assert_eq!(map.entries().unwrap(), vec![("/missing.txt".to_string(), failed)]);
    }

    #[test]
    fn test_closed_map_rejects_writes() {
        let map = MemoryReportMap::new();
        map.close().unwrap();
        let doc = DocumentFactory::default().create("/a", None);
        assert_eq!(map.fast_put(&doc, &Report::success()), Err(ReportError::Closed));
    }
}
