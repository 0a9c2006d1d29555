//! SQLite-backed persistent store.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{CacheEntry, PersistentStore};
use crate::db;
use crate::error::{SyncError, SyncResult};

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  max_entries: usize,
}

impl SqliteStore {
  /// Open the store at the given database file.
  pub fn open(path: &Path, max_entries: usize) -> SyncResult<Self> {
    let conn = db::open(path)?;
    Ok(Self::with_connection(conn, max_entries))
  }

  fn with_connection(conn: Connection, max_entries: usize) -> Self {
    Self {
      conn: Mutex::new(conn),
      max_entries: max_entries.max(1),
    }
  }

  #[cfg(test)]
  pub fn in_memory(max_entries: usize) -> SyncResult<Self> {
    Ok(Self::with_connection(db::open_in_memory()?, max_entries))
  }

  fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Drop the oldest rows by write time beyond the configured cap.
  fn evict(&self, conn: &Connection) -> SyncResult<()> {
    let evicted = conn.execute(
      "DELETE FROM cache_entries WHERE path NOT IN (
         SELECT path FROM cache_entries ORDER BY written_at DESC, rowid DESC LIMIT ?
       )",
      params![self.max_entries as i64],
    )?;
    if evicted > 0 {
      debug!(evicted, cap = self.max_entries, "evicted oldest cache entries");
    }
    Ok(())
  }
}

impl PersistentStore for SqliteStore {
  fn get(&self, path: &str) -> SyncResult<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, i64)> = conn
      .query_row(
        "SELECT value, written_at, ttl_ms FROM cache_entries WHERE path = ?",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((data, written_at, ttl_ms)) = row else {
      return Ok(None);
    };

    let decoded = serde_json::from_slice::<Value>(&data)
      .map_err(SyncError::from)
      .and_then(|value| Ok((value, parse_timestamp(written_at)?)));

    match decoded {
      Ok((value, written_at)) => Ok(Some(CacheEntry {
        path: path.to_string(),
        value,
        written_at,
        ttl: Duration::from_millis(ttl_ms.max(0) as u64),
      })),
      Err(e) => {
        warn!(path, error = %e, "dropping malformed cache entry");
        conn.execute("DELETE FROM cache_entries WHERE path = ?", params![path])?;
        Ok(None)
      }
    }
  }

  fn put(&self, path: &str, value: &Value, ttl: Duration) -> SyncResult<CacheEntry> {
    let entry = CacheEntry::new(path, value.clone(), ttl);
    let data = serde_json::to_vec(value)?;

    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (path, value, written_at, ttl_ms)
       VALUES (?, ?, ?, ?)",
      params![
        path,
        data,
        entry.written_at.timestamp_millis(),
        ttl.as_millis() as i64
      ],
    )?;
    self.evict(&conn)?;

    Ok(entry)
  }

  fn remove(&self, path: &str) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM cache_entries WHERE path = ?", params![path])?;
    Ok(())
  }

  fn clear(&self) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM cache_entries", [])?;
    Ok(())
  }

  fn len(&self) -> SyncResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

fn parse_timestamp(ms: i64) -> SyncResult<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| SyncError::Malformed(format!("invalid timestamp {}", ms)))
}
