//! Registry entry for one active subscriber.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use super::view::CacheViewState;
use crate::error::{SyncError, SyncResult};
use super::ActivateOptions;

pub type SubscriberId = u64;

pub(crate) struct ActiveSlot {
  pub id: SubscriberId,
  pub path: String,
  pub options: ActivateOptions,
  pub ttl: Duration,
  view: watch::Sender<CacheViewState>,
  /// Token of the last result applied to `view`
  applied: Mutex<u64>,
  /// Token of the latest network step started
  requested: AtomicU64,
  /// Highest token of a network step that has finished, applied or not
  finished: watch::Sender<u64>,
  disposed: AtomicBool,
  fetch: Mutex<Option<AbortHandle>>,
  listener: Mutex<Option<AbortHandle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ActiveSlot {
  pub fn new(
    id: SubscriberId,
    path: &str,
    options: ActivateOptions,
    ttl: Duration,
    view: watch::Sender<CacheViewState>,
  ) -> Self {
    Self {
      id,
      path: path.to_string(),
      options,
      ttl,
      view,
      applied: Mutex::new(0),
      requested: AtomicU64::new(0),
      finished: watch::channel(0).0,
      disposed: AtomicBool::new(false),
      fetch: Mutex::new(None),
      listener: Mutex::new(None),
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }

  pub fn snapshot(&self) -> CacheViewState {
    self.view.borrow().clone()
  }

  /// Apply the result of operation `token` if nothing newer has been
  /// applied. `persist` runs under the same guard, before the view changes,
  /// and reports whether the store failed. Returns false when discarded.
  pub fn commit<P, F>(&self, token: u64, persist: P, update: F) -> bool
  where
    P: FnOnce() -> bool,
    F: FnOnce(&mut CacheViewState, bool) -> bool,
  {
    let mut applied = lock(&self.applied);
    if self.is_disposed() {
      debug!(id = self.id, path = %self.path, token, "discarding result for disposed subscriber");
      return false;
    }
    if token < *applied {
      debug!(
        id = self.id,
        path = %self.path,
        token,
        applied = *applied,
        "discarding superseded result"
      );
      return false;
    }

    let storage_failed = persist();
    *applied = token;
    self.view.send_if_modified(|state| update(state, storage_failed));
    true
  }

  /// Record that network step `token` has started.
  pub fn begin_network(&self, token: u64) {
    self.requested.fetch_max(token, Ordering::SeqCst);
  }

  /// Record that network step `token` has finished. Call after its result
  /// has been committed or discarded.
  pub fn finish_network(&self, token: u64) {
    self.finished.send_if_modified(|finished| {
      if token > *finished {
        *finished = token;
        true
      } else {
        false
      }
    });
  }

  /// Wait until every network step started so far has finished.
  pub async fn network_finished(&self) -> SyncResult<()> {
    let target = self.requested.load(Ordering::SeqCst);
    if target == 0 {
      return Ok(());
    }
    let mut rx = self.finished.subscribe();
    rx.wait_for(|finished| *finished >= target)
      .await
      .map_err(|_| SyncError::Cancelled)?;
    Ok(())
  }

  /// Update fields that are not operation results (connectivity flags).
  pub fn touch<F>(&self, update: F)
  where
    F: FnOnce(&mut CacheViewState) -> bool,
  {
    let _applied = lock(&self.applied);
    if !self.is_disposed() {
      self.view.send_if_modified(update);
    }
  }

  /// Track a new one-shot fetch, aborting any still in flight.
  pub fn replace_fetch(&self, handle: AbortHandle) {
    self.track(&self.fetch, handle);
  }

  /// Track a new push listener, closing the previous one.
  pub fn replace_listener(&self, handle: AbortHandle) {
    self.track(&self.listener, handle);
  }

  /// Holds the same guard as `dispose`, so a handle tracked after disposal
  /// is aborted here instead of leaking.
  fn track(&self, slot: &Mutex<Option<AbortHandle>>, handle: AbortHandle) {
    let _applied = lock(&self.applied);
    if self.is_disposed() {
      debug!(id = self.id, path = %self.path, "subscriber disposed, aborting new task");
      handle.abort();
      return;
    }
    if let Some(previous) = lock(slot).replace(handle) {
      previous.abort();
    }
  }

  /// Cancel in-flight work. Later results are discarded by `commit`.
  pub fn dispose(&self) {
    let _applied = lock(&self.applied);
    self.disposed.store(true, Ordering::SeqCst);
    if let Some(fetch) = lock(&self.fetch).take() {
      fetch.abort();
    }
    if let Some(listener) = lock(&self.listener).take() {
      listener.abort();
    }
  }
}
