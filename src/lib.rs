//! docsweep - Resumable Document Extraction Pipeline
//!
//! Walks large file trees, extracts text and metadata from every file, ships
//! the result to a sink, and records a status per document so an interrupted
//! run can be audited and resumed. Work is coordinated through shared queue
//! and report backends, so scanners and consumers can run in one process or
//! spread across many.
//!
//! # Features
//!
//! - **Backpressure everywhere**: bounded queues block the scanner and a
//!   permit-gated worker pool blocks the drainer, so a fast producer simply
//!   slows to the consumers' pace.
//!
//! - **Swappable backends**: queues and status reports live in memory, in a
//!   SQLite file, or in Redis, selected purely by configuration.
//!
//! - **Stable identity**: documents and their embedded parts get
//!   deterministic ids (path, path digest or content digest).
//!
//! - **Failure isolation**: one unreadable document costs one status entry,
//!   never the batch. Transient report-store failures are journaled and
//!   retried.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  put/offer   ┌──────────────────┐  poll/take  ┌──────────────┐
//! │   Scanner    │─────────────►│  DocumentQueue   │────────────►│ QueueDrainer │
//! │  (walkdir)   │              │ memory│sql│redis │             └──────┬───────┘
//! └──────┬───────┘              └──────────────────┘                    │ accept
//!        │ signal / seal                                                ▼
//!        │                 ┌──────────────┐          ┌──────────────────────────┐
//!        └────────────────►│ SealableLatch│─ wait ──►│  DocumentConsumer        │
//!                          └──────────────┘          │  (BoundedExecutor)       │
//!                                                    │  extract → spew → report │
//!                                                    └────────────┬─────────────┘
//!                                                                 │ save
//!                                                                 ▼
//!                                                    ┌──────────────────────────┐
//!                                                    │ Reporter ─► ReportMap    │
//!                                                    │ (journal + retry)        │
//!                                                    └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Scan and spew in one process
//! docsweep spew ./corpus -w 8
//!
//! # Scan into a shared SQLite queue, spew from another process
//! docsweep --queue-type sql --sql-path jobs.db scan ./corpus
//! docsweep --queue-type sql --sql-path jobs.db --report-type sql spew
//! ```

pub mod config;
pub mod consumer;
pub mod document;
pub mod drainer;
pub mod error;
pub mod executor;
pub mod extraction;
pub mod identity;
pub mod latch;
pub mod progress;
pub mod queue;
pub mod report;
pub mod scanner;
pub mod sql;

pub use config::{CliArgs, RunCommand, RunConfig};
pub use consumer::{ConsumerOptions, ConsumerStats, DocumentConsumer};
pub use document::{Document, DocumentFactory, EmbedId, Metadata, MetadataValue};
pub use drainer::QueueDrainer;
pub use error::{PipelineError, Result};
pub use executor::BoundedExecutor;
pub use extraction::{Extractor, PlainTextExtractor, PrintSpewer, Spewer};
pub use identity::{DigestAlgorithm, IdMethod, Identifier, IdentityOptions};
pub use latch::{LocalLatch, RedisLatch, SealableLatch};
pub use queue::{open_queue, DistributedQueue, DocumentQueue, QueueOptions, QueueType};
pub use report::{open_report_map, ExtractionStatus, Report, ReportMap, ReportOptions, Reporter};
pub use scanner::{FullQueuePolicy, ScanOptions, ScanSummary, Scanner};
