use super::*;
use crate::remote::{RemoteUpdate, Subscription};
use crate::store::MemoryStore;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;

type Scripted = (Duration, SyncResult<Option<Value>>);

/// Remote whose responses are queued per path by the test.
#[derive(Default)]
struct FakeRemote {
  responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
  fetches: AtomicUsize,
  feeds: Mutex<HashMap<String, mpsc::UnboundedSender<RemoteUpdate>>>,
  subscribe_error: Mutex<Option<SyncError>>,
  writes: Mutex<Vec<(String, Value)>>,
}

impl FakeRemote {
  fn respond(&self, path: &str, delay_ms: u64, result: SyncResult<Option<Value>>) {
    lock(&self.responses)
      .entry(path.to_string())
      .or_default()
      .push_back((Duration::from_millis(delay_ms), result));
  }

  fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  fn push(&self, path: &str, update: RemoteUpdate) {
    let feeds = lock(&self.feeds);
    let tx = feeds.get(path).expect("no subscription for path");
    tx.send(update).expect("subscription closed");
  }

  async fn wait_for_feed(&self, path: &str) {
    for _ in 0..100 {
      if lock(&self.feeds).contains_key(path) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscription for {} never opened", path);
  }
}

#[async_trait]
impl RemoteService for FakeRemote {
  async fn fetch_once(&self, path: &str) -> SyncResult<Option<Value>> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let scripted = lock(&self.responses)
      .get_mut(path)
      .and_then(|queue| queue.pop_front());
    let (delay, result) = scripted
      .unwrap_or_else(|| (Duration::ZERO, Err(SyncError::RemoteUnavailable("unscripted".into()))));
    tokio::time::sleep(delay).await;
    result
  }

  async fn write(&self, path: &str, value: &Value) -> SyncResult<()> {
    lock(&self.writes).push((path.to_string(), value.clone()));
    Ok(())
  }

  async fn subscribe(&self, path: &str) -> SyncResult<Subscription> {
    if let Some(e) = lock(&self.subscribe_error).clone() {
      return Err(e);
    }
    let (tx, rx) = mpsc::unbounded_channel();
    lock(&self.feeds).insert(path.to_string(), tx);
    Ok(Subscription::new(rx, None))
  }
}

struct Harness {
  coordinator: CacheCoordinator,
  store: Arc<MemoryStore>,
  remote: Arc<FakeRemote>,
  connectivity: Connectivity,
}

fn harness(online: bool) -> Harness {
  let store = Arc::new(MemoryStore::default());
  let remote = Arc::new(FakeRemote::default());
  let connectivity = Connectivity::new(online);
  let coordinator = CacheCoordinator::new(
    store.clone(),
    remote.clone(),
    connectivity.clone(),
    Duration::from_secs(60),
  );
  Harness {
    coordinator,
    store,
    remote,
    connectivity,
  }
}

/// Store an entry that is already past its TTL.
async fn put_expired(store: &MemoryStore, path: &str, value: Value) {
  store.put(path, &value, Duration::ZERO).unwrap();
  tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn wait_until<F>(sub: &Subscriber, predicate: F) -> CacheViewState
where
  F: Fn(&CacheViewState) -> bool,
{
  let mut rx = sub.rx.clone();
  let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| predicate(s)))
    .await
    .expect("timed out waiting for view state")
    .expect("view closed");
  state.clone()
}

#[tokio::test]
async fn test_offline_without_cache_reports_error() {
  let h = harness(false);
  let sub = h.coordinator.activate("users/u1/watchlist", ActivateOptions::default());

  let state = sub.state();
  assert_eq!(state.data, None);
  assert!(!state.loading);
  assert!(state.is_offline);
  assert_eq!(
    state.error,
    Some(SyncError::RemoteUnavailable("offline, no cached data".to_string()))
  );
  assert_eq!(state.status(), PathStatus::Failed);
  assert_eq!(h.remote.fetch_count(), 0);
}

#[tokio::test]
async fn test_cached_value_painted_before_network_online() {
  let h = harness(true);
  put_expired(&h.store, "shows/1", json!({"title": "Dark"})).await;
  h.remote.respond("shows/1", 200, Ok(Some(json!({"title": "Dark", "seasons": 3}))));

  let sub = h.coordinator.activate("shows/1", ActivateOptions::default());

  let state = sub.state();
  assert_eq!(state.data, Some(json!({"title": "Dark"})));
  assert!(!state.loading);
  assert!(!state.is_stale);
  assert_eq!(state.last_updated, None);
}

#[tokio::test]
async fn test_cached_value_painted_offline_is_stale() {
  let h = harness(false);
  h.store.put("shows/1", &json!(1), Duration::from_secs(60)).unwrap();

  let sub = h.coordinator.activate("shows/1", ActivateOptions::default());

  let state = sub.state();
  assert_eq!(state.data, Some(json!(1)));
  assert!(state.is_stale);
  assert!(state.is_offline);
  assert_eq!(state.error, None);
  assert_eq!(h.remote.fetch_count(), 0);
}

#[tokio::test]
async fn test_fetch_publishes_and_writes_through() {
  let h = harness(true);
  h.remote.respond("ratings/9", 0, Ok(Some(json!({"score": 7}))));

  let mut sub = h.coordinator.activate("ratings/9", ActivateOptions::default());
  assert!(sub.state().loading);

  let state = sub.settled().await.unwrap();
  assert_eq!(state.data, Some(json!({"score": 7})));
  assert!(state.last_updated.is_some());
  assert_eq!(state.status(), PathStatus::Ready);

  let entry = h.store.get("ratings/9").unwrap().unwrap();
  assert_eq!(entry.value, json!({"score": 7}));
  assert_eq!(entry.ttl, Duration::from_secs(60));
}

#[tokio::test]
async fn test_subscriber_ttl_is_persisted() {
  let h = harness(true);
  h.remote.respond("ratings/9", 0, Ok(Some(json!(1))));

  let mut sub = h.coordinator.activate(
    "ratings/9",
    ActivateOptions::default().with_ttl(Duration::from_secs(5)),
  );
  sub.settled().await.unwrap();

  assert_eq!(h.store.get("ratings/9").unwrap().unwrap().ttl, Duration::from_secs(5));
}

#[tokio::test]
async fn test_fetch_failure_keeps_cache_and_marks_stale() {
  let h = harness(true);
  put_expired(&h.store, "feed", json!(["a"])).await;
  h.remote.respond("feed", 0, Err(SyncError::RemoteUnavailable("timeout".into())));

  let sub = h.coordinator.activate("feed", ActivateOptions::default());
  let state = wait_until(&sub, |s| s.error.is_some()).await;

  assert_eq!(state.data, Some(json!(["a"])));
  assert!(state.is_stale);
  assert_eq!(state.status(), PathStatus::Degraded);
}

#[tokio::test]
async fn test_fetch_failure_without_cache() {
  let h = harness(true);
  h.remote.respond("feed", 0, Err(SyncError::RemoteUnavailable("timeout".into())));

  let mut sub = h.coordinator.activate("feed", ActivateOptions::default());
  let state = sub.settled().await.unwrap();

  assert_eq!(state.data, None);
  assert!(state.error.is_some());
  assert!(!state.is_stale);
}

#[tokio::test]
async fn test_denied_is_not_masked_by_cache() {
  let h = harness(true);
  put_expired(&h.store, "admin/uploads", json!({"secret": true})).await;
  h.remote.respond("admin/uploads", 0, Err(SyncError::RemoteDenied("401".into())));

  let sub = h.coordinator.activate("admin/uploads", ActivateOptions::default());
  let state = wait_until(&sub, |s| s.error.is_some()).await;

  assert_eq!(state.data, None);
  assert!(matches!(state.error, Some(SyncError::RemoteDenied(_))));
}

#[tokio::test]
async fn test_remote_empty_clears_data_and_entry() {
  let h = harness(true);
  put_expired(&h.store, "lists/old", json!([1])).await;
  h.remote.respond("lists/old", 0, Ok(None));

  let sub = h.coordinator.activate("lists/old", ActivateOptions::default());
  let state = wait_until(&sub, |s| s.last_updated.is_some()).await;

  assert_eq!(state.data, None);
  assert_eq!(state.error, None);
  assert!(h.store.get("lists/old").unwrap().is_none());
}

#[tokio::test]
async fn test_fresh_cache_skips_fetch() {
  let h = harness(true);
  h.store.put("shows/2", &json!("cached"), Duration::from_secs(60)).unwrap();

  let sub = h.coordinator.activate("shows/2", ActivateOptions::default());
  tokio::time::sleep(Duration::from_millis(20)).await;

  assert_eq!(h.remote.fetch_count(), 0);
  assert_eq!(sub.state().status(), PathStatus::Ready);
}

#[tokio::test]
async fn test_equal_fetch_does_not_notify() {
  let h = harness(true);
  put_expired(&h.store, "shows/3", json!({"a": 1})).await;
  h.remote.respond("shows/3", 0, Ok(Some(json!({"a": 1}))));

  let sub = h.coordinator.activate("shows/3", ActivateOptions::default());
  let mut rx = sub.rx.clone();
  rx.borrow_and_update();
  tokio::time::sleep(Duration::from_millis(30)).await;

  assert_eq!(h.remote.fetch_count(), 1);
  assert!(!rx.has_changed().unwrap());
  assert!(rx.borrow().last_updated.is_some());
}

#[tokio::test]
async fn test_slow_earlier_fetch_cannot_overwrite_newer_result() {
  let h = harness(true);
  h.remote.respond("feed", 150, Ok(Some(json!("A"))));
  h.remote.respond("feed", 10, Ok(Some(json!("B"))));

  let sub = h.coordinator.activate("feed", ActivateOptions::default());
  tokio::time::sleep(Duration::from_millis(10)).await;
  sub.refresh();

  let state = wait_until(&sub, |s| s.data.is_some()).await;
  assert_eq!(state.data, Some(json!("B")));

  tokio::time::sleep(Duration::from_millis(250)).await;
  assert_eq!(sub.state().data, Some(json!("B")));
  assert_eq!(h.store.get("feed").unwrap().unwrap().value, json!("B"));
}

#[tokio::test]
async fn test_reconnect_refetches_stale_paths() {
  let h = harness(false);
  h.store.put("shows/5", &json!("old"), Duration::from_secs(60)).unwrap();

  let sub = h.coordinator.activate("shows/5", ActivateOptions::default());
  assert!(sub.state().is_stale);

  h.remote.respond("shows/5", 0, Ok(Some(json!("new"))));
  h.connectivity.set_online();

  let state = wait_until(&sub, |s| !s.is_stale).await;
  assert_eq!(state.data, Some(json!("new")));
  assert!(!state.is_offline);
  assert_eq!(h.remote.fetch_count(), 1);
}

#[tokio::test]
async fn test_reconnect_skips_fresh_views() {
  let h = harness(true);
  h.remote.respond("shows/6", 0, Ok(Some(json!(1))));
  let mut sub = h.coordinator.activate("shows/6", ActivateOptions::default());
  sub.settled().await.unwrap();

  h.connectivity.set_offline();
  wait_until(&sub, |s| s.is_offline).await;
  h.connectivity.set_online();
  wait_until(&sub, |s| !s.is_offline).await;
  tokio::time::sleep(Duration::from_millis(20)).await;

  assert_eq!(h.remote.fetch_count(), 1);
}

#[tokio::test]
async fn test_push_updates_write_through() {
  let h = harness(true);
  let sub = h.coordinator.activate("friends/activity", ActivateOptions::push());
  h.remote.wait_for_feed("friends/activity").await;

  h.remote.push("friends/activity", Ok(Some(json!([1]))));
  let state = wait_until(&sub, |s| s.data == Some(json!([1]))).await;
  assert!(!state.is_stale);
  assert_eq!(h.store.get("friends/activity").unwrap().unwrap().value, json!([1]));

  h.remote.push("friends/activity", Ok(Some(json!([1, 2]))));
  wait_until(&sub, |s| s.data == Some(json!([1, 2]))).await;
  assert_eq!(h.store.get("friends/activity").unwrap().unwrap().value, json!([1, 2]));

  h.remote.push(
    "friends/activity",
    Err(SyncError::RemoteUnavailable("stream closed".into())),
  );
  let state = wait_until(&sub, |s| s.is_stale).await;
  assert_eq!(state.data, Some(json!([1, 2])));
  assert!(state.error.is_some());
  assert_eq!(h.remote.fetch_count(), 0);
}

#[tokio::test]
async fn test_push_setup_failure_falls_back_to_cache() {
  let h = harness(true);
  h.store.put("friends/activity", &json!("cached"), Duration::from_secs(60)).unwrap();
  *lock(&h.remote.subscribe_error) = Some(SyncError::RemoteUnavailable("refused".into()));

  let sub = h.coordinator.activate("friends/activity", ActivateOptions::push());
  let state = wait_until(&sub, |s| s.error.is_some()).await;

  assert_eq!(state.data, Some(json!("cached")));
  assert!(state.is_stale);
}

#[tokio::test]
async fn test_deactivate_cancels_in_flight_fetch() {
  let h = harness(true);
  h.remote.respond("shows/7", 100, Ok(Some(json!("late"))));

  let sub = h.coordinator.activate("shows/7", ActivateOptions::default());
  let rx = sub.rx.clone();
  assert_eq!(h.coordinator.active_count(), 1);
  drop(sub);
  assert_eq!(h.coordinator.active_count(), 0);

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(rx.borrow().loading);
  assert_eq!(rx.borrow().data, None);
  assert!(h.store.get("shows/7").unwrap().is_none());
}

#[tokio::test]
async fn test_clear_cache_behaves_as_never_cached() {
  let h = harness(false);
  h.store.put("shows/8", &json!(1), Duration::from_secs(60)).unwrap();

  h.coordinator.clear_cache("shows/8").unwrap();
  assert!(h.store.get("shows/8").unwrap().is_none());

  let state = h.coordinator.activate("shows/8", ActivateOptions::default()).state();
  assert_eq!(state.data, None);
  assert!(state.error.is_some());
}

#[tokio::test]
async fn test_storage_unavailable_degrades_to_memory() {
  let h = harness(true);
  h.store.set_unavailable(true);
  h.remote.respond("shows/9", 0, Ok(Some(json!("net"))));

  let mut sub = h.coordinator.activate("shows/9", ActivateOptions::default());
  let state = sub.settled().await.unwrap();

  assert_eq!(state.data, Some(json!("net")));
  assert!(state.storage_degraded);
  assert_eq!(state.status(), PathStatus::Degraded);
}

#[tokio::test]
async fn test_write_publishes_to_subscribers() {
  let h = harness(true);
  h.store.put("ratings/1", &json!(3), Duration::from_secs(60)).unwrap();
  let sub = h.coordinator.activate("ratings/1", ActivateOptions::default());

  h.coordinator.write("ratings/1", json!(5)).await.unwrap();

  assert_eq!(sub.state().data, Some(json!(5)));
  assert_eq!(h.store.get("ratings/1").unwrap().unwrap().value, json!(5));
  assert_eq!(
    lock(&h.remote.writes).clone(),
    vec![("ratings/1".to_string(), json!(5))]
  );
}

#[tokio::test]
async fn test_subscribers_are_independent() {
  let h = harness(false);
  h.store.put("shows/10", &json!("x"), Duration::from_secs(60)).unwrap();

  let first = h.coordinator.activate("shows/10", ActivateOptions::default());
  let second = h.coordinator.activate("shows/10", ActivateOptions::default());
  assert_ne!(first.id(), second.id());
  assert_eq!(first.state().data, second.state().data);

  drop(first);
  assert_eq!(h.coordinator.active_count(), 1);
  assert_eq!(second.state().data, Some(json!("x")));
}

#[tokio::test]
async fn test_resolved_waits_for_refresh_of_expired_entry() {
  let h = harness(true);
  put_expired(&h.store, "shows/11", json!("old")).await;
  h.remote.respond("shows/11", 20, Ok(Some(json!("new"))));

  let mut sub = h.coordinator.activate("shows/11", ActivateOptions::default());
  assert_eq!(sub.state().data, Some(json!("old")));
  assert!(!sub.state().loading);

  let state = sub.resolved().await.unwrap();
  drop(sub);

  assert_eq!(state.data, Some(json!("new")));
  assert!(state.last_updated.is_some());
  assert_eq!(h.store.get("shows/11").unwrap().unwrap().value, json!("new"));
}

#[tokio::test]
async fn test_resolved_after_unchanged_fetch() {
  let h = harness(true);
  put_expired(&h.store, "shows/13", json!({"a": 1})).await;
  h.remote.respond("shows/13", 10, Ok(Some(json!({"a": 1}))));

  let mut sub = h.coordinator.activate("shows/13", ActivateOptions::default());
  let state = tokio::time::timeout(Duration::from_secs(2), sub.resolved())
    .await
    .expect("unchanged fetch never resolved")
    .unwrap();

  assert_eq!(state.data, Some(json!({"a": 1})));
  assert!(state.last_updated.is_some());
}

#[tokio::test]
async fn test_resolved_returns_at_once_for_fresh_cache() {
  let h = harness(true);
  h.store.put("shows/14", &json!("cached"), Duration::from_secs(60)).unwrap();

  let mut sub = h.coordinator.activate("shows/14", ActivateOptions::default());
  let state = tokio::time::timeout(Duration::from_millis(50), sub.resolved())
    .await
    .expect("fresh cache should not wait for the network")
    .unwrap();

  assert_eq!(state.data, Some(json!("cached")));
  assert_eq!(h.remote.fetch_count(), 0);
}

#[tokio::test]
async fn test_fetch_resolving_after_write_is_discarded() {
  let h = harness(true);
  h.remote.respond("ratings/2", 50, Ok(Some(json!(1))));
  let mut sub = h.coordinator.activate("ratings/2", ActivateOptions::default());

  h.coordinator.write("ratings/2", json!(7)).await.unwrap();
  assert_eq!(sub.state().data, Some(json!(7)));

  let state = sub.resolved().await.unwrap();
  assert_eq!(h.remote.fetch_count(), 1);
  assert_eq!(state.data, Some(json!(7)));
  assert_eq!(h.store.get("ratings/2").unwrap().unwrap().value, json!(7));
}

#[tokio::test]
async fn test_path_tokens_released_with_last_subscriber() {
  let h = harness(false);
  let tracked = |h: &Harness| lock(&h.coordinator.inner.tokens).contains_key("shows/12");

  let first = h.coordinator.activate("shows/12", ActivateOptions::default());
  let second = h.coordinator.activate("shows/12", ActivateOptions::default());
  assert!(tracked(&h));

  drop(first);
  assert!(tracked(&h));
  drop(second);
  assert!(!tracked(&h));
}

#[tokio::test]
async fn test_clear_all_empties_store() {
  let h = harness(false);
  h.store.put("a", &json!(1), Duration::from_secs(60)).unwrap();
  h.store.put("b", &json!(2), Duration::from_secs(60)).unwrap();

  h.coordinator.clear_all().unwrap();
  assert_eq!(h.store.len().unwrap(), 0);
}
