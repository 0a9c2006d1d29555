//! SQLite connection handling shared by the entry store and the
//! interception namespaces.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Schema for every table reelsync keeps on disk.
const SCHEMA: &str = r#"
-- One row per logical path; writes replace
CREATE TABLE IF NOT EXISTS cache_entries (
    path TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_written
    ON cache_entries(written_at);

-- Responses owned by the interceptor, bucketed by versioned namespace
CREATE TABLE IF NOT EXISTS intercept_cache (
    namespace TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, url_hash)
);
"#;

/// Open (or create) the database file and run migrations.
pub fn open(path: &Path) -> SyncResult<Connection> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to create cache directory {}: {}",
        parent.display(),
        e
      ))
    })?;
  }

  let conn = Connection::open(path).map_err(|e| {
    SyncError::StorageUnavailable(format!(
      "Failed to open cache database at {}: {}",
      path.display(),
      e
    ))
  })?;
  conn.busy_timeout(Duration::from_secs(5))?;
  migrate(&conn)?;

  Ok(conn)
}

/// Open a private in-memory database with the same schema.
#[cfg(test)]
pub fn open_in_memory() -> SyncResult<Connection> {
  let conn = Connection::open_in_memory()?;
  migrate(&conn)?;
  Ok(conn)
}

fn migrate(conn: &Connection) -> SyncResult<()> {
  conn.execute_batch(SCHEMA).map_err(|e| {
    SyncError::StorageUnavailable(format!("Failed to run cache migrations: {}", e))
  })
}

/// Directory for the database and log file.
pub fn data_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("reelsync"))
}

/// Get the default database path
pub fn default_path() -> Option<PathBuf> {
  data_dir().map(|d| d.join("cache.db"))
}
