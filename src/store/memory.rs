//! In-memory persistent store.
//!
//! Used when the SQLite store cannot be opened (memory-only degraded mode)
//! and as the injected store in tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{CacheEntry, PersistentStore};
use crate::error::{SyncError, SyncResult};

pub struct MemoryStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
  max_entries: usize,
  /// Simulates a host that refuses storage access
  unavailable: AtomicBool,
}

impl MemoryStore {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      max_entries: max_entries.max(1),
      unavailable: AtomicBool::new(false),
    }
  }

  /// Make every subsequent call fail with `StorageUnavailable`.
  #[allow(dead_code)]
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn entries(&self) -> SyncResult<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(SyncError::StorageUnavailable("storage disabled".to_string()));
    }
    self
      .entries
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new(usize::MAX)
  }
}

impl PersistentStore for MemoryStore {
  fn get(&self, path: &str) -> SyncResult<Option<CacheEntry>> {
    Ok(self.entries()?.get(path).cloned())
  }

  fn put(&self, path: &str, value: &Value, ttl: Duration) -> SyncResult<CacheEntry> {
    let entry = CacheEntry::new(path, value.clone(), ttl);
    let mut entries = self.entries()?;
    entries.insert(path.to_string(), entry.clone());

    while entries.len() > self.max_entries {
      let oldest = entries
        .values()
        .filter(|e| e.path != path)
        .min_by_key(|e| e.written_at)
        .map(|e| e.path.clone());
      match oldest {
        Some(p) => {
          entries.remove(&p);
        }
        None => break,
      }
    }

    Ok(entry)
  }

  fn remove(&self, path: &str) -> SyncResult<()> {
    self.entries()?.remove(path);
    Ok(())
  }

  fn clear(&self) -> SyncResult<()> {
    self.entries()?.clear();
    Ok(())
  }

  fn len(&self) -> SyncResult<usize> {
    Ok(self.entries()?.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_put_get_remove() {
    let store = MemoryStore::default();
    store.put("shows/1", &json!({"title": "Dark"}), Duration::from_secs(5)).unwrap();
    assert_eq!(store.get("shows/1").unwrap().unwrap().value, json!({"title": "Dark"}));

    store.remove("shows/1").unwrap();
    store.remove("shows/1").unwrap();
    assert!(store.get("shows/1").unwrap().is_none());
  }

  #[test]
  fn test_unavailable_store_fails_every_call() {
    let store = MemoryStore::default();
    store.set_unavailable(true);
    assert!(matches!(store.get("x"), Err(SyncError::StorageUnavailable(_))));
    assert!(matches!(
      store.put("x", &json!(1), Duration::ZERO),
      Err(SyncError::StorageUnavailable(_))
    ));
  }

  #[test]
  fn test_eviction_keeps_newest_write() {
    let store = MemoryStore::new(1);
    store.put("a", &json!(1), Duration::ZERO).unwrap();
    store.put("b", &json!(2), Duration::ZERO).unwrap();
    assert_eq!(store.len().unwrap(), 1);
    assert!(store.get("b").unwrap().is_some());
  }
}
