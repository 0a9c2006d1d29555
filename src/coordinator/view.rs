//! Per-subscriber projection of a cached path.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::SyncError;

/// What a subscriber sees for one path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheViewState {
  /// Last known value, if any
  pub data: Option<Value>,
  /// True only until the first resolution for the path
  pub loading: bool,
  /// Last classified failure
  #[serde(serialize_with = "error_message")]
  pub error: Option<SyncError>,
  /// Data came from the local store while offline, or a fetch failed and
  /// the cached value was kept
  pub is_stale: bool,
  pub is_offline: bool,
  /// When `data` last came from a successful network source
  pub last_updated: Option<DateTime<Utc>>,
  /// Local persistence failed; the engine is running memory-only
  pub storage_degraded: bool,
}

/// Lifecycle of an active path, derived from the view tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStatus {
  Initializing,
  Ready,
  Degraded,
  Failed,
}

impl CacheViewState {
  pub fn initial(offline: bool) -> Self {
    Self {
      data: None,
      loading: true,
      error: None,
      is_stale: false,
      is_offline: offline,
      last_updated: None,
      storage_degraded: false,
    }
  }

  pub fn status(&self) -> PathStatus {
    if self.loading {
      PathStatus::Initializing
    } else if self.data.is_none() && self.error.is_some() {
      PathStatus::Failed
    } else if self.is_stale || self.error.is_some() || self.storage_degraded {
      PathStatus::Degraded
    } else {
      PathStatus::Ready
    }
  }

  /// Whether reconnecting should re-run the network step for this view.
  pub fn needs_reconcile(&self) -> bool {
    self.is_stale || self.data.is_none()
  }

  /// Accept a value from a network source. Returns whether subscribers
  /// should be notified; `last_updated` moves either way.
  pub(crate) fn accept_network(&mut self, value: Option<Value>, storage_degraded: bool) -> bool {
    let data_changed = self.data != value;
    let flags_changed = self.loading
      || self.is_stale
      || self.error.is_some()
      || self.is_offline
      || self.storage_degraded != storage_degraded;

    if data_changed {
      self.data = value;
    }
    self.loading = false;
    self.is_stale = false;
    self.error = None;
    self.is_offline = false;
    self.storage_degraded = storage_degraded;
    self.last_updated = Some(Utc::now());

    data_changed || flags_changed
  }

  /// Record a failed network step. Denials never fall back to cache.
  pub(crate) fn reject(&mut self, error: SyncError) {
    if error.is_fatal() {
      self.data = None;
      self.is_stale = false;
    } else if self.data.is_some() {
      self.is_stale = true;
    }
    self.loading = false;
    self.error = Some(error);
  }
}

fn error_message<S: Serializer>(error: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
  match error {
    Some(e) => s.serialize_some(&e.to_string()),
    None => s.serialize_none(),
  }
}
