//! Realtime database client over its REST + event-stream protocol.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::sse::{apply_event, SseParser, StreamStep};
use super::traits::{RemoteService, RemoteUpdate, Subscription};
use crate::error::{SyncError, SyncResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote data service client
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  auth: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, auth: Option<String>) -> SyncResult<Self> {
    let base = normalize_base(base_url)?;
    let client = reqwest::Client::builder()
      .connect_timeout(CONNECT_TIMEOUT)
      .build()
      .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client, base, auth })
  }

  /// Resource URL for a path, with the auth token as a query parameter.
  pub fn url_for(&self, path: &str) -> SyncResult<Url> {
    let mut url = resource_url(&self.base, path)?;
    if let Some(token) = &self.auth {
      url.query_pairs_mut().append_pair("auth", token);
    }
    Ok(url)
  }
}

/// Parse a database base URL, ensuring joins append rather than replace.
pub fn normalize_base(base_url: &str) -> SyncResult<Url> {
  let mut base = Url::parse(base_url)
    .map_err(|e| SyncError::Malformed(format!("invalid remote url {}: {}", base_url, e)))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  Ok(base)
}

/// `{base}/{path}.json`
pub fn resource_url(base: &Url, path: &str) -> SyncResult<Url> {
  let trimmed = path.trim_matches('/');
  let relative = if trimmed.is_empty() {
    ".json".to_string()
  } else {
    format!("{}.json", trimmed)
  };
  base
    .join(&relative)
    .map_err(|e| SyncError::Malformed(format!("invalid path {}: {}", path, e)))
}

/// Map a response status onto the error taxonomy.
fn check_status(response: Response) -> SyncResult<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let message = format!("{} {}", status.as_u16(), response.url().path());
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::RemoteDenied(message)),
    _ => Err(SyncError::RemoteUnavailable(message)),
  }
}

fn non_null(value: Value) -> Option<Value> {
  if value.is_null() {
    None
  } else {
    Some(value)
  }
}

#[async_trait]
impl RemoteService for HttpRemote {
  async fn fetch_once(&self, path: &str) -> SyncResult<Option<Value>> {
    let url = self.url_for(path)?;
    let response = self.client.get(url).timeout(REQUEST_TIMEOUT).send().await?;
    let response = check_status(response)?;
    let body = response.bytes().await?;
    let value: Value = serde_json::from_slice(&body)?;

    debug!(path, empty = value.is_null(), "fetched remote value");
    Ok(non_null(value))
  }

  async fn write(&self, path: &str, value: &Value) -> SyncResult<()> {
    let url = self.url_for(path)?;
    let response = self
      .client
      .put(url)
      .timeout(REQUEST_TIMEOUT)
      .json(value)
      .send()
      .await?;
    check_status(response)?;
    Ok(())
  }

  async fn subscribe(&self, path: &str) -> SyncResult<Subscription> {
    let url = self.url_for(path)?;
    let response = self
      .client
      .get(url)
      .header(header::ACCEPT, "text/event-stream")
      .send()
      .await?;
    let response = check_status(response)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let path = path.to_string();
    let task = tokio::spawn(async move {
      let reason = pump_events(response, &tx).await;
      debug!(path = %path, error = %reason, "event stream ended");
      let _ = tx.send(Err(reason));
    });

    Ok(Subscription::new(rx, Some(task.abort_handle())))
  }
}

/// Forward stream events as full values until the stream fails. Returns the
/// error that ended it.
async fn pump_events(response: Response, tx: &mpsc::UnboundedSender<RemoteUpdate>) -> SyncError {
  let mut parser = SseParser::new();
  let mut current = Value::Null;
  let mut stream = response.bytes_stream();

  while let Some(chunk) = stream.next().await {
    let chunk = match chunk {
      Ok(c) => c,
      Err(e) => return SyncError::RemoteUnavailable(e.to_string()),
    };

    for event in parser.feed(&chunk) {
      match apply_event(&mut current, &event) {
        Ok(StreamStep::Changed) => {
          if tx.send(Ok(non_null(current.clone()))).is_err() {
            return SyncError::Cancelled;
          }
        }
        Ok(StreamStep::Ignored) => {}
        Err(SyncError::Malformed(e)) => warn!(error = %e, "skipping malformed stream event"),
        Err(e) => return e,
      }
    }
  }

  SyncError::RemoteUnavailable("event stream closed".to_string())
}
