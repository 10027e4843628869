//! SQLite storage client shared by the identity store and the ledger.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY NOT NULL,
  name TEXT NOT NULL,
  image_path TEXT NOT NULL,
  embedding BLOB NOT NULL,
  embedding_model TEXT,
  registered_at TEXT NOT NULL,
  last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  date TEXT NOT NULL,
  time TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  UNIQUE (user_id, date)
);

CREATE TRIGGER IF NOT EXISTS trg_attendance_no_update
BEFORE UPDATE ON attendance
BEGIN
  SELECT RAISE(FAIL, 'attendance is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_attendance_no_delete
BEFORE DELETE ON attendance
BEGIN
  SELECT RAISE(FAIL, 'attendance is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_attendance_date_time
  ON attendance(date, time);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    StorageFailure(#[from] rusqlite::Error),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("unsupported schema version {0}")]
    SchemaVersion(i64),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handle to the attendance database.
///
/// Cloning is cheap and every clone shares one connection; independent
/// handles opened on the same file coordinate through SQLite itself.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let storage = Self::from_connection(conn)?;
        tracing::debug!(path = %path.display(), "storage opened");
        Ok(storage)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive use of the connection.
    pub(crate) fn with_conn<T, E>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion(version));
    }
    conn.execute_batch(SCHEMA_V1)?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "storage schema migrated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let storage = Storage::open_in_memory().unwrap();
        let tables: Vec<String> = storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'attendance') ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<Vec<String>, rusqlite::Error>>()
            })
            .unwrap();
        assert_eq!(tables, vec!["attendance", "users"]);
    }

    #[test]
    fn test_reopen_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");
        drop(Storage::open(&path).unwrap());
        let storage = Storage::open(&path).unwrap();
        let version: i64 = storage
            .with_conn(|conn| conn.pragma_query_value(None, "user_version", |row| row.get(0)))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }
        assert!(matches!(Storage::open(&path), Err(StoreError::SchemaVersion(_))));
    }

    #[test]
    fn test_attendance_rows_are_append_only() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO attendance (user_id, date, time, timestamp) VALUES ('a', '2024-01-10', '09:00:00', 't')",
                    [],
                )
            })
            .unwrap();
        let update = storage
            .with_conn(|conn| conn.execute("UPDATE attendance SET time = '10:00:00'", []));
        assert!(update.is_err());
        let delete = storage.with_conn(|conn| conn.execute("DELETE FROM attendance", []));
        assert!(delete.is_err());
    }
}
