//! Shared SQLite plumbing for the SQL queue and report backends
//!
//! Both backends may be opened by several processes at once, so the
//! connection runs in WAL mode with a busy timeout instead of the exclusive
//! locking a single-writer database would use.

use crate::error::ConfigError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on a locked database before SQLITE_BUSY
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pragmas for a database shared between processes
const SHARED_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -16000;      -- 16MB cache
"#;

/// Open (creating if needed) a shared database
pub fn open_shared(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SHARED_PRAGMAS)?;
    Ok(conn)
}

/// Open a private in-memory database
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    Connection::open_in_memory()
}

/// Reject table and column names that cannot be safely interpolated
///
/// Identifiers can't be bound as parameters, so they are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("docsweep_queue").is_ok());
        assert!(validate_identifier("_q1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1queue").is_err());
        assert!(validate_identifier("queue; DROP TABLE x").is_err());
        assert!(validate_identifier("a-b").is_err());
    }

    #[test]
    fn test_open_shared_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_shared(&dir.path().join("shared.db")).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
