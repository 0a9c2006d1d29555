//! Server-sent event parsing for realtime database streams.
//!
//! The stream sends `put` events that replace the value at a sub-path and
//! `patch` events that merge object keys at a sub-path. Each event's data is
//! `{"path": "/a/b", "data": ...}`.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// A single dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
  pub event: String,
  pub data: String,
}

/// Incremental line parser. Chunks may split lines (and UTF-8 sequences)
/// anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
  buf: Vec<u8>,
  event: Option<String>,
  data: Vec<String>,
}

impl SseParser {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed raw bytes and return every event completed by them.
  pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
    self.buf.extend_from_slice(chunk);
    let mut events = Vec::new();

    while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
      let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
      line.pop();
      if line.last() == Some(&b'\r') {
        line.pop();
      }
      let line = String::from_utf8_lossy(&line);

      if line.is_empty() {
        if let Some(event) = self.dispatch() {
          events.push(event);
        }
        continue;
      }
      if line.starts_with(':') {
        continue;
      }

      let (field, value) = match line.split_once(':') {
        Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
        None => (line.as_ref(), ""),
      };
      match field {
        "event" => self.event = Some(value.to_string()),
        "data" => self.data.push(value.to_string()),
        _ => {}
      }
    }

    events
  }

  fn dispatch(&mut self) -> Option<SseEvent> {
    let event = self.event.take();
    if self.data.is_empty() && event.is_none() {
      return None;
    }
    let data = std::mem::take(&mut self.data).join("\n");
    Some(SseEvent {
      event: event.unwrap_or_else(|| "message".to_string()),
      data,
    })
  }
}

#[derive(Debug, Deserialize)]
struct Payload {
  path: String,
  #[serde(default)]
  data: Value,
}

/// Outcome of applying a stream event to the locally tracked value.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
  /// The tracked value changed
  Changed,
  /// Nothing to deliver (keep-alive or unknown event)
  Ignored,
}

/// Apply one event to `current`, the full value at the subscribed path.
pub fn apply_event(current: &mut Value, event: &SseEvent) -> SyncResult<StreamStep> {
  match event.event.as_str() {
    "put" => {
      let payload: Payload = serde_json::from_str(&event.data)?;
      put_at(current, &segments(&payload.path), payload.data);
      Ok(StreamStep::Changed)
    }
    "patch" => {
      let payload: Payload = serde_json::from_str(&event.data)?;
      let Value::Object(fields) = payload.data else {
        return Err(SyncError::Malformed("patch data is not an object".to_string()));
      };
      patch_at(current, &segments(&payload.path), fields);
      Ok(StreamStep::Changed)
    }
    "cancel" => Err(SyncError::RemoteDenied(format!(
      "subscription cancelled by server: {}",
      event.data
    ))),
    "auth_revoked" => Err(SyncError::RemoteDenied("credential revoked".to_string())),
    _ => Ok(StreamStep::Ignored),
  }
}

fn segments(path: &str) -> Vec<&str> {
  path.split('/').filter(|s| !s.is_empty()).collect()
}

fn put_at(root: &mut Value, path: &[&str], data: Value) {
  let Some((last, parents)) = path.split_last() else {
    *root = data;
    return;
  };

  let parent = descend(root, parents);
  if data.is_null() {
    if let Value::Object(map) = parent {
      map.remove(*last);
    }
  } else {
    object_mut(parent).insert((*last).to_string(), data);
  }
  prune_empty(root);
}

fn patch_at(root: &mut Value, path: &[&str], fields: Map<String, Value>) {
  let target = descend(root, path);
  let map = object_mut(target);
  for (key, value) in fields {
    if value.is_null() {
      map.remove(&key);
    } else {
      map.insert(key, value);
    }
  }
  prune_empty(root);
}

fn descend<'a>(mut node: &'a mut Value, path: &[&str]) -> &'a mut Value {
  for segment in path {
    node = object_mut(node)
      .entry((*segment).to_string())
      .or_insert(Value::Null);
  }
  node
}

fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
  if !node.is_object() {
    *node = Value::Object(Map::new());
  }
  match node {
    Value::Object(map) => map,
    _ => unreachable!("node was just replaced with an object"),
  }
}

/// Empty objects mean "no data" in the realtime model.
fn prune_empty(node: &mut Value) {
  if let Value::Object(map) = node {
    for child in map.values_mut() {
      prune_empty(child);
    }
    map.retain(|_, v| !v.is_null() && !matches!(v, Value::Object(m) if m.is_empty()));
    if map.is_empty() {
      *node = Value::Null;
    }
  }
}
