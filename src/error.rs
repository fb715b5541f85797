//! Error types for docsweep
//!
//! This module defines the error hierarchy for the pipeline:
//! - Admission errors (full queues, exhausted executor permits)
//! - Queue and report backend errors (SQLite, Redis)
//! - Per-document extraction and spew failures
//! - Configuration errors, raised before any work is scheduled
//!
//! Per-document failures are tagged values that the consumer switches on to
//! pick a status. They never propagate out of the worker pool.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for docsweep
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Latch errors
    #[error("Latch error: {0}")]
    Latch(#[from] LatchError),

    /// Executor admission errors
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Document identity errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Report ledger errors
    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    /// Scanner errors
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stopped by a shutdown request
    #[error("Operation interrupted by shutdown request")]
    Interrupted,
}

/// Sealable latch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LatchError {
    /// `await` was called on a latch that is already sealed
    #[error("Latch is sealed")]
    Sealed,

    /// Distributed latch backend failure
    #[error("Latch backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LatchError {
    fn from(err: redis::RedisError) -> Self {
        LatchError::Backend(err.to_string())
    }
}

/// Bounded executor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// No permit became available within the configured wait
    #[error("Task rejected: no permit available after {waited:?}")]
    AdmissionTimeout { waited: Duration },

    /// The executor is shut down and no longer accepts tasks
    #[error("Task rejected: executor is shut down")]
    Shutdown,

    /// Shrinking the pool could not reclaim enough permits in time
    #[error("Failed to resize executor to {requested}: {reason}")]
    ResizeFailed { requested: usize, reason: String },

    /// Invalid pool size
    #[error("Invalid executor size {size}: must be at least 1")]
    InvalidSize { size: usize },

    /// Worker thread could not be spawned
    #[error("Failed to spawn executor worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },
}

/// Document identity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Digest algorithm not supported by this build
    #[error("Unsupported digest algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// Content digest was not computed before the id was requested
    #[error("Missing '{key}' metadata for '{path}': content digest has not been computed")]
    MissingDigest { path: PathBuf, key: String },

    /// Unknown identification method
    #[error("Unknown identification method '{0}'")]
    UnknownMethod(String),

    /// Embedded document slot does not belong to this document
    #[error("Unknown embedded document slot {0}")]
    UnknownEmbed(usize),
}

/// Document queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Backend connection could not be established
    #[error("Failed to connect to queue backend '{backend}': {reason}")]
    ConnectionFailed { backend: String, reason: String },

    /// Backend operation failed
    #[error("Queue operation failed: {0}")]
    OperationFailed(String),

    /// Queue was closed
    #[error("Queue '{name}' is closed")]
    Closed { name: String },

    /// Serialization error for a queued document
    #[error("Failed to serialize/deserialize queued document: {0}")]
    Serialization(String),

    /// Invalid queue configuration
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    /// Check if the operation is worth retrying (backend hiccup, not misuse)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionFailed { .. } | QueueError::OperationFailed(_)
        )
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::OperationFailed(err.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            QueueError::ConnectionFailed {
                backend: "redis".into(),
                reason: err.to_string(),
            }
        } else {
            QueueError::OperationFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Coarse classification of report errors, used to declare which kinds a
/// report map treats as transient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportErrorKind {
    Backend,
    Busy,
    OutOfMemory,
    Unavailable,
    Serialization,
    Closed,
}

/// Report ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    /// Generic backend failure
    #[error("Report backend error: {0}")]
    Backend(String),

    /// Store is locked by another writer
    #[error("Report store is busy: {0}")]
    Busy(String),

    /// Store refused the write for lack of memory
    #[error("Report store is out of memory: {0}")]
    OutOfMemory(String),

    /// Store could not be reached
    #[error("Report store unavailable: {0}")]
    Unavailable(String),

    /// Report could not be encoded or decoded
    #[error("Report serialization error: {0}")]
    Serialization(String),

    /// Report map was closed
    #[error("Report map is closed")]
    Closed,
}

impl ReportError {
    /// Classification of this error
    pub fn kind(&self) -> ReportErrorKind {
        match self {
            ReportError::Backend(_) => ReportErrorKind::Backend,
            ReportError::Busy(_) => ReportErrorKind::Busy,
            ReportError::OutOfMemory(_) => ReportErrorKind::OutOfMemory,
            ReportError::Unavailable(_) => ReportErrorKind::Unavailable,
            ReportError::Serialization(_) => ReportErrorKind::Serialization,
            ReportError::Closed => ReportErrorKind::Closed,
        }
    }
}

impl From<rusqlite::Error> for ReportError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                ReportError::Busy(err.to_string())
            }
            Some(rusqlite::ErrorCode::OutOfMemory) | Some(rusqlite::ErrorCode::DiskFull) => {
                ReportError::OutOfMemory(err.to_string())
            }
            _ => ReportError::Backend(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for ReportError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("OOM") {
            ReportError::OutOfMemory(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            ReportError::Unavailable(err.to_string())
        } else {
            ReportError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ReportError {
    fn from(err: serde_json::Error) -> Self {
        ReportError::Serialization(err.to_string())
    }
}

/// Scanner errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// Queue stayed full past the configured timeout
    #[error("Queue full: could not enqueue '{path}' within {timeout:?}")]
    QueueFull { path: PathBuf, timeout: Duration },

    /// Enqueue failed in the backend
    #[error("Failed to enqueue '{path}': {source}")]
    Enqueue { path: PathBuf, source: QueueError },

    /// Walk root is unusable
    #[error("Cannot scan '{path}': {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    /// Scanner already running
    #[error("Scanner is already walking")]
    AlreadyWalking,

    /// Full-queue handler aborted the scan
    #[error("Scan aborted by full-queue handler at '{path}'")]
    Aborted { path: PathBuf },

    /// Latch could not be signalled
    #[error("Latch error: {0}")]
    Latch(#[from] LatchError),
}

/// The recognized per-document extraction failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionErrorKind {
    NotFound,
    Encrypted,
    UnsupportedFormat,
    Parse,
    Io,
}

impl ExtractionErrorKind {
    /// Stable name used when persisting a failure cause
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionErrorKind::NotFound => "NotFound",
            ExtractionErrorKind::Encrypted => "Encrypted",
            ExtractionErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ExtractionErrorKind::Parse => "Parse",
            ExtractionErrorKind::Io => "Io",
        }
    }
}

/// A tagged extraction failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} extracting '{}': {message}", .kind.as_str(), .path.display())]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub path: PathBuf,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify an I/O error raised while reading a document
    pub fn from_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ExtractionErrorKind::NotFound,
            std::io::ErrorKind::InvalidData => ExtractionErrorKind::Parse,
            _ => ExtractionErrorKind::Io,
        };
        Self::new(kind, path, err.to_string())
    }
}

/// Spewer (sink) failure
#[derive(Error, Debug)]
#[error("Failed to spew '{}': {source}", .path.display())]
pub struct SpewError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue buffer size
    #[error("Invalid queue buffer size {size}: must be at least 1")]
    InvalidBufferSize { size: usize },

    /// Unknown queue backend
    #[error("Invalid queue type '{0}': expected memory, sql or redis")]
    InvalidQueueType(String),

    /// Unknown report backend
    #[error("Invalid report type '{0}': expected none, memory, sql or redis")]
    InvalidReportType(String),

    /// Invalid include/exclude pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Invalid SQL identifier (table or column name)
    #[error("Invalid SQL identifier '{0}': use letters, digits and underscores only")]
    InvalidIdentifier(String),

    /// Invalid full-queue policy
    #[error("Invalid full-queue policy '{0}': expected block, hook or fail")]
    InvalidQueuePolicy(String),

    /// Unknown extraction status filter
    #[error("Invalid status '{status}': {reason}")]
    InvalidStatus { status: String, reason: String },

    /// Missing required option
    #[error("Missing required option: {0}")]
    MissingRequired(String),

    /// Identity configuration error
    #[error("{0}")]
    Identity(#[from] IdentityError),

    /// Output path error
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for QueueError
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type alias for ReportError
pub type ReportResult<T> = std::result::Result<T, ReportError>;

/// Result type alias for ExecutorError
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Result type alias for ScanError
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Result type alias for IdentityError
pub type IdentityResult<T> = std::result::Result<T, IdentityError>;
