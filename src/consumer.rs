//! Document consumer pool
//!
//! Each accepted document runs through extract → spew → report on a
//! [`BoundedExecutor`] worker. Failures are recorded per document and never
//! escape the pool: a missing file, a parse error or even a panicking
//! extractor costs one status entry, not the batch.

use crate::document::Document;
use crate::error::{ExecutorResult, ExtractionError, ExtractionErrorKind, SpewError};
use crate::executor::{panic_message, BoundedExecutor};
use crate::extraction::{Extractor, Spewer};
use crate::report::{ExtractionStatus, ReportCause, Reporter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Worker threads (and concurrent documents)
    pub workers: usize,

    /// How long `accept` may block for a free worker; `None` waits forever
    pub max_wait: Option<Duration>,

    /// Also spew each document's metadata block
    pub write_metadata: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_wait: None,
            write_metadata: false,
        }
    }
}

/// Statistics collected by the consumer
#[derive(Debug, Default)]
pub struct ConsumerStats {
    /// Documents admitted into the pool
    pub accepted: AtomicU64,

    /// Documents extracted and spewed
    pub succeeded: AtomicU64,

    /// Documents recorded with a failure status
    pub failed: AtomicU64,

    /// Status writes the report map did not take
    pub report_errors: AtomicU64,
}

impl ConsumerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn report_errors(&self) -> u64 {
        self.report_errors.load(Ordering::Relaxed)
    }

    /// Documents finished either way
    pub fn processed(&self) -> u64 {
        self.succeeded() + self.failed()
    }
}

/// Status recorded for an extraction failure kind
pub fn status_for(kind: ExtractionErrorKind) -> ExtractionStatus {
    match kind {
        ExtractionErrorKind::NotFound => ExtractionStatus::NotFound,
        ExtractionErrorKind::Io => ExtractionStatus::NotRead,
        ExtractionErrorKind::Encrypted => ExtractionStatus::NotDecrypted,
        ExtractionErrorKind::UnsupportedFormat | ExtractionErrorKind::Parse => ExtractionStatus::NotParsed,
    }
}

enum Failure {
    Extraction(ExtractionError),
    Spew(SpewError),
}

impl From<ExtractionError> for Failure {
    fn from(err: ExtractionError) -> Self {
        Failure::Extraction(err)
    }
}

impl From<SpewError> for Failure {
    fn from(err: SpewError) -> Self {
        Failure::Spew(err)
    }
}

/// The per-document work, shared by every worker
struct Pipeline {
    extractor: Arc<dyn Extractor>,
    spewer: Arc<dyn Spewer>,
    reporter: Option<Arc<Reporter>>,
    write_metadata: bool,
    stats: ConsumerStats,
}

impl Pipeline {
    fn run(&self, doc: &mut Document) -> Result<(), Failure> {
        let mut content = self.extractor.extract(doc)?;
        self.spewer.write(doc, &mut content)?;
        if self.write_metadata {
            self.spewer.write_metadata(doc)?;
        }
        Ok(())
    }

    fn process(&self, mut doc: Document) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(&mut doc)));

        let (status, cause) = match outcome {
            Ok(Ok(())) => {
                debug!(path = %doc.path().display(), "Document processed");
                (ExtractionStatus::Success, None)
            }
            Ok(Err(Failure::Extraction(e))) => {
                warn!(path = %doc.path().display(), kind = e.kind.as_str(), "Extraction failed: {}", e.message);
                (status_for(e.kind), Some(ReportCause::from(&e)))
            }
            Ok(Err(Failure::Spew(e))) => {
                warn!(path = %doc.path().display(), error = %e.source, "Spew failed");
                (ExtractionStatus::NotSaved, Some(ReportCause::new("Spew", e.source.to_string())))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(path = %doc.path().display(), "Document processing panicked: {}", message);
                (ExtractionStatus::FailureUnknown, Some(ReportCause::new("Panic", message)))
            }
        };

        if status.is_success() {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(reporter) = &self.reporter {
            let saved = match cause {
                Some(cause) => reporter.save_with_cause(&doc, status, cause),
                None => reporter.save(&doc, status),
            };
            if let Err(e) = saved {
                self.stats.report_errors.fetch_add(1, Ordering::Relaxed);
                warn!(path = %doc.path().display(), status = %status, error = %e, "Failed to record status");
            }
        }
    }
}

/// Worker pool that extracts, spews and reports documents
pub struct DocumentConsumer {
    executor: BoundedExecutor,
    pipeline: Arc<Pipeline>,
}

impl DocumentConsumer {
    pub fn new(
        options: &ConsumerOptions,
        extractor: Arc<dyn Extractor>,
        spewer: Arc<dyn Spewer>,
        reporter: Option<Arc<Reporter>>,
    ) -> ExecutorResult<Self> {
        let executor = BoundedExecutor::with_max_wait("consumer", options.workers, options.max_wait)?;
        Ok(Self {
            executor,
            pipeline: Arc::new(Pipeline {
                extractor,
                spewer,
                reporter,
                write_metadata: options.write_metadata,
                stats: ConsumerStats::default(),
            }),
        })
    }

    /// Hand `doc` to a worker, blocking while every worker is busy
    pub fn accept(&self, doc: Document) -> ExecutorResult<()> {
        let pipeline = Arc::clone(&self.pipeline);
        self.executor.submit(move || pipeline.process(doc))?;
        self.pipeline.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until every accepted document has been processed
    pub fn await_idle(&self) {
        self.executor.await_idle();
    }

    /// Change the number of concurrent documents
    pub fn resize(&self, workers: usize, timeout: Option<Duration>) -> ExecutorResult<()> {
        self.executor.resize(workers, timeout)
    }

    pub fn shutdown(&self) {
        self.executor.shutdown();
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.executor.await_termination(timeout)
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.pipeline.stats
    }

    pub fn workers(&self) -> usize {
        self.executor.max_concurrency()
    }
}
