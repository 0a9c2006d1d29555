//! Core trait and types for the persistent store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::SyncResult;

/// A cached value for one logical path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  /// Logical data path (unique key)
  pub path: String,
  /// The cached payload
  pub value: Value,
  /// When the entry was last written
  pub written_at: DateTime<Utc>,
  /// How long the entry bypasses network fetches
  #[serde(with = "duration_ms")]
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn new(path: &str, value: Value, ttl: Duration) -> Self {
    Self {
      path: path.to_string(),
      value,
      written_at: Utc::now(),
      ttl,
    }
  }

  /// Expiry only affects whether a fetch may be skipped; the entry is kept.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(self.ttl) {
      Ok(ttl) => now - self.written_at > ttl,
      Err(_) => false,
    }
  }
}

/// Trait for persistent store backends.
///
/// Implementations are shared by every path and subscriber. Writes to the
/// same path are last-writer-wins.
pub trait PersistentStore: Send + Sync {
  /// Look up the entry for a path. A miss is `Ok(None)`.
  fn get(&self, path: &str) -> SyncResult<Option<CacheEntry>>;

  /// Replace the entry for a path. Returns once the write is durable.
  fn put(&self, path: &str, value: &Value, ttl: Duration) -> SyncResult<CacheEntry>;

  /// Delete the entry for a path. Removing an absent path is not an error.
  fn remove(&self, path: &str) -> SyncResult<()>;

  /// Delete every entry.
  fn clear(&self) -> SyncResult<()>;

  /// Number of stored entries.
  fn len(&self) -> SyncResult<usize>;
}

mod duration_ms {
  use serde::Serializer;
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }
}
