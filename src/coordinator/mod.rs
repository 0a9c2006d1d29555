//! Per-path cache coordinator.
//!
//! Layers the persistent store, an in-memory view per subscriber, and the
//! remote service:
//! - Activation paints cached data before any network round-trip
//! - Online activations then fetch once or open a push subscription,
//!   writing every accepted network value through to the store
//! - Failed fetches keep cached data and mark it stale
//! - Going back online re-runs the network step for stale or empty views
//!
//! Every asynchronous result carries a per-path operation token; results
//! older than the one already applied are discarded.

mod slot;
mod view;

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::event::Connectivity;
use crate::intercept::InterceptorHandle;
use crate::remote::RemoteService;
use crate::store::PersistentStore;

use slot::ActiveSlot;
pub use slot::SubscriberId;
pub use view::{CacheViewState, PathStatus};

/// How a subscriber wants its path resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivateOptions {
  /// Keep a live push subscription instead of a one-shot fetch
  pub push: bool,
  /// TTL for entries written on behalf of this subscriber
  pub ttl: Option<Duration>,
}

impl ActivateOptions {
  pub fn push() -> Self {
    Self {
      push: true,
      ttl: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

/// Coordinates cached and remote data for every active subscriber.
#[derive(Clone)]
pub struct CacheCoordinator {
  inner: Arc<Inner>,
}

struct Inner {
  store: Arc<dyn PersistentStore>,
  remote: Arc<dyn RemoteService>,
  connectivity: Connectivity,
  default_ttl: Duration,
  registry: Mutex<HashMap<SubscriberId, Arc<ActiveSlot>>>,
  tokens: Mutex<HashMap<String, u64>>,
  next_id: AtomicU64,
  interceptor: Mutex<Option<InterceptorHandle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CacheCoordinator {
  /// Create a coordinator and start observing connectivity transitions.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(
    store: Arc<dyn PersistentStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    default_ttl: Duration,
  ) -> Self {
    let inner = Arc::new(Inner {
      store,
      remote,
      connectivity: connectivity.clone(),
      default_ttl,
      registry: Mutex::new(HashMap::new()),
      tokens: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      interceptor: Mutex::new(None),
    });

    tokio::spawn(observe_connectivity(
      Arc::downgrade(&inner),
      connectivity.subscribe(),
    ));

    Self { inner }
  }

  /// Pre-warm the interceptor's data namespace on every local write.
  pub fn attach_interceptor(&self, handle: InterceptorHandle) {
    *lock(&self.inner.interceptor) = Some(handle);
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }

  /// Start tracking `path` for a new subscriber.
  ///
  /// Any cached entry is published before this returns; network work
  /// continues in the background.
  pub fn activate(&self, path: &str, options: ActivateOptions) -> Subscriber {
    let inner = &self.inner;
    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let online = inner.connectivity.is_online();
    let ttl = options.ttl.unwrap_or(inner.default_ttl);

    let (tx, rx) = watch::channel(CacheViewState::initial(!online));
    let slot = Arc::new(ActiveSlot::new(id, path, options, ttl, tx));
    lock(&inner.registry).insert(id, Arc::clone(&slot));
    info!(id, path, online, push = options.push, "activating subscriber");

    let token = inner.next_token(path);
    let cached = match inner.store.get(path) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(path, error = %e, "cache read failed, continuing memory-only");
        slot.commit(token, || true, |state, degraded| {
          state.storage_degraded = degraded;
          true
        });
        None
      }
    };

    if let Some(entry) = &cached {
      debug!(path, written_at = %entry.written_at, "painting cached entry");
      slot.commit(token, || false, |state, _| {
        state.data = Some(entry.value.clone());
        state.loading = false;
        state.is_stale = !online;
        true
      });
    }

    if !online {
      if cached.is_none() {
        slot.commit(token, || false, |state, _| {
          state.loading = false;
          state.error = Some(SyncError::RemoteUnavailable(
            "offline, no cached data".to_string(),
          ));
          true
        });
      }
    } else if !options.push && cached.as_ref().is_some_and(|e| !e.is_expired(Utc::now())) {
      debug!(path, "cached entry within ttl, skipping fetch");
    } else {
      inner.reconcile(&slot);
    }

    Subscriber {
      id,
      path: path.to_string(),
      rx,
      inner: Arc::clone(inner),
    }
  }

  /// Number of active subscribers.
  pub fn active_count(&self) -> usize {
    lock(&self.inner.registry).len()
  }

  /// Write a value to the remote service, persist it, and publish it to
  /// every subscriber of the path.
  pub async fn write(&self, path: &str, value: Value) -> SyncResult<()> {
    let inner = &self.inner;
    inner.remote.write(path, &value).await?;

    let storage_failed = match inner.store.put(path, &value, inner.default_ttl) {
      Ok(_) => false,
      Err(e) => {
        warn!(path, error = %e, "write-through failed");
        true
      }
    };

    if let Some(handle) = lock(&inner.interceptor).as_ref() {
      if !handle.cache_data(path, value.clone()) {
        debug!(path, "interceptor message loop is gone");
      }
    }

    for slot in inner.slots_for(path) {
      let token = inner.next_token(path);
      let value = value.clone();
      slot.commit(token, || storage_failed, |state, degraded| {
        state.accept_network(Some(value), degraded)
      });
    }

    Ok(())
  }

  /// Delete the persisted entry for `path`.
  pub fn clear_cache(&self, path: &str) -> SyncResult<()> {
    info!(path, "clearing cached entry");
    self.inner.store.remove(path)
  }

  /// Delete every persisted entry.
  pub fn clear_all(&self) -> SyncResult<()> {
    info!("clearing all cached entries");
    self.inner.store.clear()
  }
}

impl Inner {
  fn next_token(&self, path: &str) -> u64 {
    let mut tokens = lock(&self.tokens);
    let counter = tokens.entry(path.to_string()).or_insert(0);
    *counter += 1;
    *counter
  }

  fn slots_for(&self, path: &str) -> Vec<Arc<ActiveSlot>> {
    lock(&self.registry)
      .values()
      .filter(|s| s.path == path)
      .cloned()
      .collect()
  }

  fn deactivate(&self, id: SubscriberId) {
    let slot = {
      let mut registry = lock(&self.registry);
      let slot = registry.remove(&id);
      if let Some(slot) = &slot {
        if !registry.values().any(|s| s.path == slot.path) {
          lock(&self.tokens).remove(&slot.path);
        }
      }
      slot
    };
    if let Some(slot) = slot {
      info!(id, path = %slot.path, "deactivating subscriber");
      slot.dispose();
    }
  }

  /// Run the network step for a slot.
  fn reconcile(self: &Arc<Self>, slot: &Arc<ActiveSlot>) {
    if slot.options.push {
      self.open_listener(slot);
    } else {
      self.spawn_fetch(slot);
    }
  }

  fn spawn_fetch(self: &Arc<Self>, slot: &Arc<ActiveSlot>) {
    let token = self.next_token(&slot.path);
    slot.begin_network(token);
    let inner = Arc::clone(self);
    let task_slot = Arc::clone(slot);

    let task = tokio::spawn(async move {
      let result = inner.remote.fetch_once(&task_slot.path).await;
      match result {
        Ok(value) => inner.settle_value(&task_slot, token, value),
        Err(e) => inner.settle_failure(&task_slot, token, e),
      }
    });
    slot.replace_fetch(task.abort_handle());
  }

  fn open_listener(self: &Arc<Self>, slot: &Arc<ActiveSlot>) {
    let setup_token = self.next_token(&slot.path);
    slot.begin_network(setup_token);
    let inner = Arc::clone(self);
    let task_slot = Arc::clone(slot);

    let task = tokio::spawn(async move {
      let mut subscription = match inner.remote.subscribe(&task_slot.path).await {
        Ok(s) => s,
        Err(e) => {
          inner.settle_failure(&task_slot, setup_token, e);
          return;
        }
      };
      debug!(path = %task_slot.path, "push subscription open");

      while let Some(update) = subscription.next().await {
        let token = inner.next_token(&task_slot.path);
        match update {
          Ok(value) => inner.settle_value(&task_slot, token, value),
          Err(e) => {
            inner.settle_failure(&task_slot, token, e);
            break;
          }
        }
      }
      subscription.unsubscribe();
    });
    slot.replace_listener(task.abort_handle());
  }

  /// Persist then publish a network value. Empty paths remove the entry.
  fn settle_value(&self, slot: &ActiveSlot, token: u64, value: Option<Value>) {
    let path = slot.path.as_str();
    let published = value.clone();
    let applied = slot.commit(
      token,
      || {
        let result = match &value {
          Some(v) => self.store.put(path, v, slot.ttl).map(|_| ()),
          None => self.store.remove(path),
        };
        match result {
          Ok(()) => false,
          Err(e) => {
            warn!(path, error = %e, "write-through failed");
            true
          }
        }
      },
      |state, degraded| state.accept_network(published, degraded),
    );
    if applied {
      debug!(path, token, "accepted network value");
    }
    slot.finish_network(token);
  }

  fn settle_failure(&self, slot: &ActiveSlot, token: u64, error: SyncError) {
    if error.is_cancelled() {
      debug!(path = %slot.path, "operation cancelled");
    } else {
      if error.is_transient() {
        warn!(path = %slot.path, error = %error, "transient network failure");
      } else {
        error!(path = %slot.path, error = %error, "network step failed");
      }
      slot.commit(token, || false, |state, _| {
        state.reject(error);
        true
      });
    }
    slot.finish_network(token);
  }

  fn on_connectivity(self: &Arc<Self>, online: bool) {
    info!(online, "connectivity changed");
    let slots: Vec<Arc<ActiveSlot>> = lock(&self.registry).values().cloned().collect();

    for slot in slots {
      slot.touch(|state| {
        if state.is_offline == !online {
          false
        } else {
          state.is_offline = !online;
          true
        }
      });

      if online && !slot.is_disposed() && slot.snapshot().needs_reconcile() {
        debug!(path = %slot.path, "reconciling after reconnect");
        self.reconcile(&slot);
      }
    }
  }
}

async fn observe_connectivity(inner: Weak<Inner>, mut rx: watch::Receiver<bool>) {
  while rx.changed().await.is_ok() {
    let online = *rx.borrow_and_update();
    let Some(inner) = inner.upgrade() else {
      break;
    };
    inner.on_connectivity(online);
  }
}

/// Handle held by one consumer of a path. Dropping it deactivates.
pub struct Subscriber {
  id: SubscriberId,
  path: String,
  rx: watch::Receiver<CacheViewState>,
  inner: Arc<Inner>,
}

impl Subscriber {
  pub fn id(&self) -> SubscriberId {
    self.id
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  /// Current view state.
  pub fn state(&self) -> CacheViewState {
    self.rx.borrow().clone()
  }

  /// Wait for the next published change.
  pub async fn changed(&mut self) -> SyncResult<CacheViewState> {
    self.rx.changed().await.map_err(|_| SyncError::Cancelled)?;
    Ok(self.rx.borrow_and_update().clone())
  }

  /// Wait until the initial resolution window has closed.
  pub async fn settled(&mut self) -> SyncResult<CacheViewState> {
    let state = self
      .rx
      .wait_for(|s| !s.loading)
      .await
      .map_err(|_| SyncError::Cancelled)?;
    Ok(state.clone())
  }

  /// Wait until every network step started for this subscriber has
  /// finished, then return the settled state. Returns at once when the
  /// activation was served from a fresh cache or offline.
  pub async fn resolved(&mut self) -> SyncResult<CacheViewState> {
    let slot = lock(&self.inner.registry).get(&self.id).cloned();
    if let Some(slot) = slot {
      slot.network_finished().await?;
    }
    self.settled().await
  }

  /// Re-run the network step now. Supersedes any fetch still in flight.
  pub fn refresh(&self) {
    if !self.inner.connectivity.is_online() {
      debug!(path = %self.path, "offline, refresh skipped");
      return;
    }
    let slot = lock(&self.inner.registry).get(&self.id).cloned();
    if let Some(slot) = slot {
      self.inner.reconcile(&slot);
    }
  }
}

impl Drop for Subscriber {
  fn drop(&mut self) {
    self.inner.deactivate(self.id);
  }
}

#[cfg(test)]
mod tests;
