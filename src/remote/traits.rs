use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::SyncResult;

/// One push delivery: the full current value at the path, `None` when the
/// path has no data, or a classified failure.
pub type RemoteUpdate = SyncResult<Option<Value>>;

/// Remote data service addressed by hierarchical string paths.
#[async_trait]
pub trait RemoteService: Send + Sync {
  /// One-shot read. A path with no data yields `Ok(None)`.
  async fn fetch_once(&self, path: &str) -> SyncResult<Option<Value>>;

  /// One-shot write replacing the value at `path`.
  async fn write(&self, path: &str, value: &Value) -> SyncResult<()>;

  /// Open a push subscription delivering every upstream change.
  async fn subscribe(&self, path: &str) -> SyncResult<Subscription>;
}

/// Live push subscription. Dropping it unsubscribes.
pub struct Subscription {
  updates: mpsc::UnboundedReceiver<RemoteUpdate>,
  task: Option<AbortHandle>,
}

impl Subscription {
  /// Wrap a receiver fed by `task`; the task is aborted on unsubscribe.
  pub fn new(updates: mpsc::UnboundedReceiver<RemoteUpdate>, task: Option<AbortHandle>) -> Self {
    Self { updates, task }
  }

  /// Next delivery, or `None` once the feed has stopped.
  pub async fn next(&mut self) -> Option<RemoteUpdate> {
    self.updates.recv().await
  }

  pub fn unsubscribe(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.updates.close();
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.stop();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.task.is_some())
      .finish_non_exhaustive()
  }
}
