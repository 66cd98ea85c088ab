//! SQLite connection resource shared by the result and profile stores

use crate::config::DatabaseConfig;
use crate::error::{DetectorError, Result};
use crate::store::retry::RetryPolicy;
use anyhow::Context;
use rusqlite::{Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Owned database connection with bounded reconnect-and-retry.
///
/// A broken connection is dropped and re-opened before the next statement.
/// Transient failures are retried according to the [`RetryPolicy`]; once
/// the attempts are spent they surface as retryable
/// [`DetectorError::Persistence`] errors.
pub struct Database {
    location: Location,
    busy_timeout: Duration,
    retry: RetryPolicy,
    conn: Mutex<Option<Connection>>,
    reconnects: AtomicU64,
}

impl Database {
    /// Open the database file, creating parent directories as needed
    pub fn open(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed creating database directory {}", parent.display())
                })?;
            }
        }

        let retry = RetryPolicy {
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: 2,
            max_attempts: config.max_attempts.max(1),
        };
        let db = Self::new(
            Location::File(path.clone()),
            Duration::from_millis(config.busy_timeout_ms),
            retry,
        )
        .with_context(|| format!("Failed opening database {}", path.display()))?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Location::Memory, Duration::from_secs(1), RetryPolicy::default())
    }

    fn new(location: Location, busy_timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let db = Self {
            location,
            busy_timeout,
            retry,
            conn: Mutex::new(None),
            reconnects: AtomicU64::new(0),
        };
        let conn = db.connect().map_err(|source| DetectorError::Persistence {
            retryable: false,
            source,
        })?;
        *db.lock() = Some(conn);
        Ok(db)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.location {
            Location::File(path) => Connection::open(path)?,
            Location::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        if let Location::File(_) = self.location {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                ",
            )?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected<'g>(&self, slot: &'g mut Option<Connection>) -> rusqlite::Result<&'g mut Connection> {
        let conn = match slot.take() {
            Some(conn) => conn,
            None => {
                let conn = self.connect()?;
                let total = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                info!(reconnects = total, "Database connection re-established");
                conn
            }
        };
        Ok(slot.insert(conn))
    }

    /// Run `op` against the connection, reconnecting and retrying on
    /// transient failures. `op` may run more than once.
    pub fn with_connection<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = self.lock();
        let mut attempt = 0u32;

        loop {
            let result = self.ensure_connected(&mut guard).and_then(&mut op);

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let transient = is_transient(&error);
            if needs_reconnect(&error) {
                self.drop_connection(&mut guard);
            }

            if !transient || !self.retry.should_retry(attempt) {
                return Err(DetectorError::Persistence {
                    retryable: transient,
                    source: error,
                });
            }

            let delay = self.retry.next_delay(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient database error, retrying"
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Cheap liveness check
    pub fn ping(&self) -> Result<()> {
        self.with_connection(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .map(|_| ())
    }

    /// Drop the current connection so the next call re-opens it.
    pub fn invalidate(&self) {
        let mut guard = self.lock();
        self.drop_connection(&mut guard);
    }

    fn drop_connection(&self, slot: &mut Option<Connection>) {
        match self.location {
            // An in-memory database only lives as long as its connection
            Location::Memory => debug!("Keeping in-memory connection"),
            Location::File(_) => {
                if slot.take().is_some() {
                    warn!("Database connection dropped, will reconnect");
                }
            }
        }
    }

    /// Connections re-opened since startup
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }
}

fn sqlite_code(error: &rusqlite::Error) -> Option<ErrorCode> {
    match error {
        rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
        _ => None,
    }
}

/// Failures that may clear up on their own
pub(crate) fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        sqlite_code(error),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
        )
    )
}

/// Failures that leave the connection itself unusable
fn needs_reconnect(error: &rusqlite::Error) -> bool {
    matches!(
        sqlite_code(error),
        Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen | ErrorCode::NotADatabase)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(dir: &Path) -> DatabaseConfig {
        DatabaseConfig {
            path: dir.join("nested").join("anomalies.db").display().to_string(),
            busy_timeout_ms: 50,
            max_attempts: 3,
            min_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&file_config(dir.path())).unwrap();

        assert!(dir.path().join("nested").exists());
        db.ping().unwrap();
        assert_eq!(db.reconnect_count(), 0);
    }

    #[test]
    fn test_reconnects_after_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&file_config(dir.path())).unwrap();

        db.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
        })
        .unwrap();

        db.invalidate();
        let value: i64 = db
            .with_connection(|conn| conn.query_row("SELECT v FROM t", [], |row| row.get(0)))
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(db.reconnect_count(), 1);
    }

    #[test]
    fn test_permanent_error_is_not_retryable() {
        let db = Database::open_in_memory().unwrap();
        let mut calls = 0;

        let err = db
            .with_connection(|conn| {
                calls += 1;
                conn.execute("INSERT INTO missing_table VALUES (1)", [])
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, DetectorError::Persistence { retryable: false, .. }));
    }

    #[test]
    fn test_busy_database_is_retried_then_reported_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path());
        let db = Database::open(&config).unwrap();
        db.with_connection(|conn| conn.execute_batch("CREATE TABLE t (v INTEGER);"))
            .unwrap();

        // A second connection holds the write lock
        let blocker = Connection::open(&config.path).unwrap();
        blocker
            .execute_batch("BEGIN IMMEDIATE; INSERT INTO t VALUES (1);")
            .unwrap();

        let mut calls = 0;
        let err = db
            .with_connection(|conn| {
                calls += 1;
                conn.execute("INSERT INTO t VALUES (2)", [])
            })
            .unwrap_err();

        assert_eq!(calls, 3);
        assert!(err.is_retryable());

        blocker.execute_batch("COMMIT;").unwrap();
        db.with_connection(|conn| conn.execute("INSERT INTO t VALUES (2)", []))
            .unwrap();
    }

    #[test]
    fn test_in_memory_survives_invalidate() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| conn.execute_batch("CREATE TABLE t (v INTEGER);"))
            .unwrap();

        db.invalidate();
        let count: i64 = db
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
        assert!(db.path().is_none());
    }
}
