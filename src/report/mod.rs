//! Extraction status ledger
//!
//! A [`ReportMap`] stores one [`Report`] per document id. Backends declare
//! which error kinds are transient ("journalable"); the [`Reporter`] keeps
//! writes that failed with those kinds in a journal and retries them on
//! later saves, so a short backend outage never blocks the pipeline and
//! never silently loses a status.

mod memory;
mod redis_report;
mod reporter;
mod sql_report;

pub use memory::MemoryReportMap;
pub use redis_report::{RedisReportConfig, RedisReportMap};
pub use reporter::Reporter;
pub use sql_report::{SqlReportConfig, SqlReportMap, DEFAULT_TABLE as DEFAULT_REPORT_TABLE};

use crate::document::Document;
use crate::error::{ConfigError, ExtractionError, ReportError, ReportErrorKind, ReportResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of processing one document, persisted as a small integer code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExtractionStatus {
    Success,
    NotFound,
    NotRead,
    NotDecrypted,
    NotParsed,
    NotSaved,
    FailureUnknown,
}

impl ExtractionStatus {
    pub const ALL: [ExtractionStatus; 7] = [
        ExtractionStatus::Success,
        ExtractionStatus::NotFound,
        ExtractionStatus::NotRead,
        ExtractionStatus::NotDecrypted,
        ExtractionStatus::NotParsed,
        ExtractionStatus::NotSaved,
        ExtractionStatus::FailureUnknown,
    ];

    pub fn code(&self) -> u8 {
        match self {
            ExtractionStatus::Success => 0,
            ExtractionStatus::NotFound => 1,
            ExtractionStatus::NotRead => 2,
            ExtractionStatus::NotDecrypted => 3,
            ExtractionStatus::NotParsed => 4,
            ExtractionStatus::NotSaved => 5,
            ExtractionStatus::FailureUnknown => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "SUCCESS",
            ExtractionStatus::NotFound => "NOT_FOUND",
            ExtractionStatus::NotRead => "NOT_READ",
            ExtractionStatus::NotDecrypted => "NOT_DECRYPTED",
            ExtractionStatus::NotParsed => "NOT_PARSED",
            ExtractionStatus::NotSaved => "NOT_SAVED",
            ExtractionStatus::FailureUnknown => "FAILURE_UNKNOWN",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ExtractionStatus::Success
    }
}

impl From<ExtractionStatus> for u8 {
    fn from(status: ExtractionStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for ExtractionStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown extraction status code {}", code))
    }
}

impl FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return Self::try_from(code);
        }
        let wanted = s.to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.name() == wanted)
            .ok_or_else(|| format!("unknown extraction status '{}'", s))
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a document failed: error kind and message, without any backtrace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportCause {
    pub kind: String,
    pub message: String,
}

impl ReportCause {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&ExtractionError> for ReportCause {
    fn from(err: &ExtractionError) -> Self {
        Self::new(err.kind.as_str(), err.message.clone())
    }
}

/// Persisted status of one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Report {
    pub status: ExtractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ReportCause>,
}

impl Report {
    pub fn new(status: ExtractionStatus, cause: Option<ReportCause>) -> Self {
        Self { status, cause }
    }

    pub fn success() -> Self {
        Self::new(ExtractionStatus::Success, None)
    }
}

/// Keyed status store
pub trait ReportMap: Send + Sync {
    /// Store `report` for `doc`; returns whether the key was new
    ///
    /// Must cost no more than a plain write: the prior value is not read back.
    fn fast_put(&self, doc: &Document, report: &Report) -> ReportResult<bool>;

    fn get(&self, doc: &Document) -> ReportResult<Option<Report>>;

    /// Every stored `(id, report)` pair
    fn entries(&self) -> ReportResult<Vec<(String, Report)>>;

    /// Error kinds this backend considers transient and safe to retry
    fn journalable(&self) -> &[ReportErrorKind];

    fn close(&self) -> ReportResult<()>;
}

/// Report backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportType {
    #[default]
    None,
    Memory,
    Sql,
    Redis,
}

impl FromStr for ReportType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ReportType::None),
            "memory" | "mem" => Ok(ReportType::Memory),
            "sql" | "sqlite" => Ok(ReportType::Sql),
            "redis" => Ok(ReportType::Redis),
            _ => Err(ConfigError::InvalidReportType(s.to_string())),
        }
    }
}

/// Report backend configuration
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub report_type: ReportType,
    pub name: String,
    pub sql_path: Option<PathBuf>,
    pub sql_table: String,
    pub redis_url: String,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            report_type: ReportType::None,
            name: crate::queue::DEFAULT_QUEUE_NAME.to_string(),
            sql_path: None,
            sql_table: sql_report::DEFAULT_TABLE.to_string(),
            redis_url: crate::queue::RedisQueueConfig::default().url,
        }
    }
}

/// Open the configured report map, `None` when reporting is off
pub fn open_report_map(options: &ReportOptions) -> ReportResult<Option<Arc<dyn ReportMap>>> {
    let map: Arc<dyn ReportMap> = match options.report_type {
        ReportType::None => return Ok(None),
        ReportType::Memory => Arc::new(MemoryReportMap::new()),
        ReportType::Sql => {
            let path = options
                .sql_path
                .clone()
                .ok_or_else(|| ReportError::Unavailable("sql report map requires a database path".into()))?;
            Arc::new(SqlReportMap::open(SqlReportConfig {
                path,
                table: options.sql_table.clone(),
            })?)
        }
        ReportType::Redis => Arc::new(RedisReportMap::open(RedisReportConfig {
            url: options.redis_url.clone(),
            name: options.name.clone(),
        })?),
    };
    Ok(Some(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ExtractionStatus::Success.code(), 0);
        assert_eq!(ExtractionStatus::NotSaved.code(), 5);
        assert_eq!(ExtractionStatus::FailureUnknown.code(), 9);
        assert_eq!(ExtractionStatus::from_code(3), Some(ExtractionStatus::NotDecrypted));
        assert_eq!(ExtractionStatus::from_code(7), None);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("not_found".parse::<ExtractionStatus>(), Ok(ExtractionStatus::NotFound));
        assert_eq!("NOT-PARSED".parse::<ExtractionStatus>(), Ok(ExtractionStatus::NotParsed));
        assert_eq!("9".parse::<ExtractionStatus>(), Ok(ExtractionStatus::FailureUnknown));
        assert!("bogus".parse::<ExtractionStatus>().is_err());
    }

    #[test]
    fn test_report_json_uses_codes() {
        let report = Report::new(
            ExtractionStatus::NotParsed,
            Some(ReportCause::new("Parse", "bad header")),
        );
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"status":4,"cause":{"kind":"Parse","message":"bad header"}}"#);

        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(serde_json::to_string(&Report::success()).unwrap(), r#"{"status":0}"#);
    }

    #[test]
    fn test_report_type_parsing() {
        assert_eq!("none".parse::<ReportType>().unwrap(), ReportType::None);
        assert_eq!("sqlite".parse::<ReportType>().unwrap(), ReportType::Sql);
        assert!(matches!(
            "mongo".parse::<ReportType>(),
            Err(ConfigError::InvalidReportType(_))
        ));
    }

    #[test]
    fn test_open_report_map() {
        assert!(open_report_map(&ReportOptions::default()).unwrap().is_none());

        let memory = ReportOptions {
            report_type: ReportType::Memory,
            ..Default::default()
        };
        assert!(open_report_map(&memory).unwrap().is_some());
    }
}
