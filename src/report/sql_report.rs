//! SQLite-backed report map
//!
//! Lock contention between processes sharing the database surfaces as
//! SQLITE_BUSY/LOCKED; those writes are journalable and retried later.

use super::{ExtractionStatus, Report, ReportCause, ReportMap};
use crate::document::Document;
use crate::error::{ReportError, ReportErrorKind, ReportResult};
use crate::sql::{open_shared, validate_identifier};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::PathBuf;
use tracing::debug;

/// Default report table
pub const DEFAULT_TABLE: &str = "docsweep_reports";

const JOURNALABLE: &[ReportErrorKind] = &[ReportErrorKind::Busy, ReportErrorKind::OutOfMemory];

/// Configuration for a SQL report map
#[derive(Debug, Clone)]
pub struct SqlReportConfig {
    pub path: PathBuf,
    pub table: String,
}

impl Default for SqlReportConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsweep.db"),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

/// Report map stored in a SQLite table
pub struct SqlReportMap {
    table: String,
    /// `None` once closed
    conn: Mutex<Option<Connection>>,
}

impl SqlReportMap {
    pub fn open(config: SqlReportConfig) -> ReportResult<Self> {
        validate_identifier(&config.table).map_err(|e| ReportError::Backend(e.to_string()))?;

        let conn = open_shared(&config.path).map_err(|e| ReportError::Unavailable(e.to_string()))?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    status INTEGER NOT NULL,
                    cause_kind TEXT,
                    cause_message TEXT,
                    updated_at TEXT NOT NULL
                )",
                config.table
            ),
            [],
        )?;

        debug!(path = %config.path.display(), table = %config.table, "SQL report map opened");

        Ok(Self {
            table: config.table,
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> ReportResult<T>) -> ReportResult<T> {
        match self.conn.lock().as_ref() {
            Some(conn) => f(conn),
            None => Err(ReportError::Closed),
        }
    }
}

fn report_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Report> {
    let code: u8 = row.get(offset)?;
    let kind: Option<String> = row.get(offset + 1)?;
    let message: Option<String> = row.get(offset + 2)?;

    let status = ExtractionStatus::from_code(code).unwrap_or(ExtractionStatus::FailureUnknown);
    let cause = kind.map(|kind| ReportCause::new(kind, message.unwrap_or_default()));
    Ok(Report::new(status, cause))
}

impl ReportMap for SqlReportMap {
    fn fast_put(&self, doc: &Document, report: &Report) -> ReportResult<bool> {
        let id = doc.identity();
        let (kind, message) = match &report.cause {
            Some(cause) => (Some(cause.kind.as_str()), Some(cause.message.as_str())),
            None => (None, None),
        };
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            // One write lock for both statements
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (id, status, cause_kind, cause_message, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.table
                ),
                params![&*id, report.status.code(), kind, message, now],
            )?;
            if inserted == 0 {
                tx.execute(
                    &format!(
                        "UPDATE {} SET status = ?2, cause_kind = ?3, cause_message = ?4, updated_at = ?5
                         WHERE id = ?1",
                        self.table
                    ),
                    params![&*id, report.status.code(), kind, message, now],
                )?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })
    }

    fn get(&self, doc: &Document) -> ReportResult<Option<Report>> {
        let id = doc.identity();
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT status, cause_kind, cause_message FROM {} WHERE id = ?1",
                        self.table
                    ),
                    [&*id],
                    |row| report_from_row(row, 0),
                )
                .optional()?)
        })
    }

    fn entries(&self) -> ReportResult<Vec<(String, Report)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, status, cause_kind, cause_message FROM {} ORDER BY id",
                self.table
            ))?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, report_from_row(row, 1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn journalable(&self) -> &[ReportErrorKind] {
        JOURNALABLE
    }

    fn close(&self) -> ReportResult<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| ReportError::from(e))?;
        }
        Ok(())
    }
}
