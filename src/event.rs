use std::sync::Arc;
use tokio::sync::watch;

/// Connectivity transitions reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

/// Shared online/offline signal.
///
/// Transitions are pushed in by the host; nothing here polls the network.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Apply a transition. Repeating the current state does not notify.
  pub fn emit(&self, event: ConnectivityEvent) {
    let online = event == ConnectivityEvent::Online;
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
  }

  pub fn set_online(&self) {
    self.emit(ConnectivityEvent::Online);
  }

  pub fn set_offline(&self) {
    self.emit(ConnectivityEvent::Offline);
  }

  /// Receiver that wakes on every transition
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl std::fmt::Debug for Connectivity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connectivity")
      .field("online", &self.is_online())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_notify_once() {
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    connectivity.set_online();
    assert!(!rx.has_changed().unwrap());

    connectivity.set_offline();
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());
    assert!(!connectivity.is_online());

    connectivity.emit(ConnectivityEvent::Online);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }
}
