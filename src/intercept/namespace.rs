//! Versioned response buckets owned by the interceptor.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db;
use crate::error::{SyncError, SyncResult};

/// A response body as the interceptor stores and serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn json(body: Vec<u8>) -> Self {
    Self {
      status: 200,
      content_type: Some("application/json".to_string()),
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Storage for named response namespaces, keyed by full request URL.
pub trait NamespaceStore: Send + Sync {
  /// Names of every namespace holding at least one response.
  fn namespaces(&self) -> SyncResult<Vec<String>>;

  /// Drop a namespace and everything in it. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> SyncResult<bool>;

  fn get(&self, namespace: &str, url: &str) -> SyncResult<Option<StoredResponse>>;

  /// Store a response, replacing any previous one for the URL.
  fn put(&self, namespace: &str, url: &str, response: &StoredResponse) -> SyncResult<()>;
}

/// SHA256 of the URL for stable, fixed-length keys.
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// In-memory namespaces
#[derive(Default)]
pub struct MemoryNamespaces {
  buckets: Mutex<BTreeMap<String, HashMap<String, StoredResponse>>>,
}

impl MemoryNamespaces {
  pub fn new() -> Self {
    Self::default()
  }

  fn buckets(&self) -> MutexGuard<'_, BTreeMap<String, HashMap<String, StoredResponse>>> {
    self
      .buckets
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl NamespaceStore for MemoryNamespaces {
  fn namespaces(&self) -> SyncResult<Vec<String>> {
    Ok(self.buckets().keys().cloned().collect())
  }

  fn delete_namespace(&self, namespace: &str) -> SyncResult<bool> {
    Ok(self.buckets().remove(namespace).is_some())
  }

  fn get(&self, namespace: &str, url: &str) -> SyncResult<Option<StoredResponse>> {
    Ok(
      self
        .buckets()
        .get(namespace)
        .and_then(|bucket| bucket.get(url))
        .cloned(),
    )
  }

  fn put(&self, namespace: &str, url: &str, response: &StoredResponse) -> SyncResult<()> {
    self
      .buckets()
      .entry(namespace.to_string())
      .or_default()
      .insert(url.to_string(), response.clone());
    Ok(())
  }
}

/// SQLite-backed namespaces, sharing the cache database file.
pub struct SqliteNamespaces {
  conn: Mutex<Connection>,
}

impl SqliteNamespaces {
  pub fn open(path: &Path) -> SyncResult<Self> {
    Ok(Self {
      conn: Mutex::new(db::open(path)?),
    })
  }

  #[cfg(test)]
  pub fn in_memory() -> SyncResult<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory()?),
    })
  }

  fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl NamespaceStore for SqliteNamespaces {
  fn namespaces(&self) -> SyncResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT namespace FROM intercept_cache ORDER BY namespace")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> SyncResult<bool> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM intercept_cache WHERE namespace = ?",
      params![namespace],
    )?;
    Ok(deleted > 0)
  }

  fn get(&self, namespace: &str, url: &str) -> SyncResult<Option<StoredResponse>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, content_type, body FROM intercept_cache
         WHERE namespace = ? AND url_hash = ?",
        params![namespace, url_hash(url)],
        |row| {
          Ok(StoredResponse {
            status: row.get(0)?,
            content_type: row.get(1)?,
            body: row.get(2)?,
          })
        },
      )
      .optional()?;
    Ok(row)
  }

  fn put(&self, namespace: &str, url: &str, response: &StoredResponse) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO intercept_cache
         (namespace, url_hash, url, status, content_type, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        url_hash(url),
        url,
        response.status,
        response.content_type,
        response.body,
        chrono::Utc::now().timestamp_millis()
      ],
    )?;
    Ok(())
  }
}
