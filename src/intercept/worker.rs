//! The interceptor: routing policies, lifecycle, and message loop.

use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::namespace::{NamespaceStore, StoredResponse};
use super::upstream::{InterceptRequest, RequestMode, Upstream};
use crate::config::InterceptConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{normalize_base, resource_url};

const NAMESPACE_PREFIX: &str = "reelsync";

/// Resolved interceptor settings.
#[derive(Debug, Clone)]
pub struct InterceptorSettings {
  pub shell_namespace: String,
  pub data_namespace: String,
  pub api_route: Regex,
  pub manifest: Vec<Url>,
  pub offline_fallback: Url,
  /// Base of the realtime database, for pre-warmed data messages
  pub data_base: Url,
}

impl InterceptorSettings {
  pub fn from_config(config: &InterceptConfig, remote_url: &str) -> SyncResult<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| SyncError::Malformed(format!("invalid origin {}: {}", config.origin, e)))?;
    let resolve = |asset: &str| {
      origin
        .join(asset)
        .map_err(|e| SyncError::Malformed(format!("invalid asset {}: {}", asset, e)))
    };

    Ok(Self {
      shell_namespace: format!("{}-shell-{}", NAMESPACE_PREFIX, config.shell_version),
      data_namespace: format!("{}-data-{}", NAMESPACE_PREFIX, config.data_version),
      api_route: Regex::new(&config.api_pattern)
        .map_err(|e| SyncError::Malformed(format!("invalid api pattern: {}", e)))?,
      manifest: config
        .manifest
        .iter()
        .map(|asset| resolve(asset))
        .collect::<SyncResult<Vec<_>>>()?,
      offline_fallback: resolve(&config.offline_fallback)?,
      data_base: normalize_base(remote_url)?,
    })
  }
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// The offline placeholder served for a failed navigation
  Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptResponse {
  pub response: StoredResponse,
  pub source: ResponseSource,
}

/// Lifecycle of one interceptor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Parsed,
  Installed,
  /// Controlling traffic
  Active,
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptMessage {
  /// Store `value` as the cached response for `path` in the data namespace
  CacheData { path: String, value: Value },
}

/// Sender side of the interceptor's message channel.
#[derive(Debug, Clone)]
pub struct InterceptorHandle {
  tx: mpsc::UnboundedSender<InterceptMessage>,
}

impl InterceptorHandle {
  /// Queue a pre-warm. Returns false if the message loop has stopped.
  pub fn cache_data(&self, path: &str, value: Value) -> bool {
    self
      .tx
      .send(InterceptMessage::CacheData {
        path: path.to_string(),
        value,
      })
      .is_ok()
  }
}

/// Network interceptor with its own versioned caches.
///
/// API routes are network-first with cache fallback; everything else is
/// cache-first against the shell manifest.
pub struct Interceptor {
  settings: InterceptorSettings,
  namespaces: Arc<dyn NamespaceStore>,
  upstream: Arc<dyn Upstream>,
  lifecycle: Mutex<Lifecycle>,
}

impl Interceptor {
  pub fn new(
    settings: InterceptorSettings,
    namespaces: Arc<dyn NamespaceStore>,
    upstream: Arc<dyn Upstream>,
  ) -> Self {
    Self {
      settings,
      namespaces,
      upstream,
      lifecycle: Mutex::new(Lifecycle::Parsed),
    }
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self
      .lifecycle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn set_lifecycle(&self, next: Lifecycle) {
    *self
      .lifecycle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
  }

  /// Install and take control immediately. Returns the namespaces evicted
  /// during activation.
  pub async fn start(&self) -> SyncResult<Vec<String>> {
    self.install().await?;
    self.activate()
  }

  /// Cache every manifest asset. Nothing is stored unless all succeed.
  pub async fn install(&self) -> SyncResult<()> {
    let mut fetched = Vec::with_capacity(self.settings.manifest.len());
    for url in &self.settings.manifest {
      let response = self.upstream.fetch(&InterceptRequest::get(url.clone())).await?;
      if !response.is_success() {
        return Err(SyncError::RemoteUnavailable(format!(
          "shell asset {} returned {}",
          url, response.status
        )));
      }
      fetched.push((url, response));
    }

    for (url, response) in &fetched {
      self
        .namespaces
        .put(&self.settings.shell_namespace, url.as_str(), response)?;
    }

    info!(
      namespace = %self.settings.shell_namespace,
      assets = fetched.len(),
      "interceptor installed"
    );
    self.set_lifecycle(Lifecycle::Installed);
    Ok(())
  }

  /// Delete every namespace that is not current, then claim traffic.
  pub fn activate(&self) -> SyncResult<Vec<String>> {
    let current = [
      self.settings.shell_namespace.as_str(),
      self.settings.data_namespace.as_str(),
    ];

    let mut deleted = Vec::new();
    for namespace in self.namespaces.namespaces()? {
      if !current.contains(&namespace.as_str()) {
        self.namespaces.delete_namespace(&namespace)?;
        info!(namespace = %namespace, "deleted superseded namespace");
        deleted.push(namespace);
      }
    }

    self.set_lifecycle(Lifecycle::Active);
    info!("interceptor active");
    Ok(deleted)
  }

  /// Serve one request according to its route policy.
  pub async fn handle(&self, request: &InterceptRequest) -> SyncResult<InterceptResponse> {
    if self.lifecycle() != Lifecycle::Active || !request.is_get() {
      return self.pass_through(request).await;
    }

    if self.settings.api_route.is_match(request.url.as_str()) {
      self.network_first(request).await
    } else {
      self.cache_first(request).await
    }
  }

  async fn pass_through(&self, request: &InterceptRequest) -> SyncResult<InterceptResponse> {
    let response = self.upstream.fetch(request).await?;
    Ok(InterceptResponse {
      response,
      source: ResponseSource::Network,
    })
  }

  async fn network_first(&self, request: &InterceptRequest) -> SyncResult<InterceptResponse> {
    let key = request.url.as_str();
    let namespace = &self.settings.data_namespace;

    match self.upstream.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = self.namespaces.put(namespace, key, &response) {
            warn!(url = key, error = %e, "failed to cache api response");
          }
        }
        Ok(InterceptResponse {
          response,
          source: ResponseSource::Network,
        })
      }
      Err(network_err) => match self.namespaces.get(namespace, key)? {
        Some(response) => {
          debug!(url = key, "network failed, serving cached api response");
          Ok(InterceptResponse {
            response,
            source: ResponseSource::Cache,
          })
        }
        None => Err(network_err),
      },
    }
  }

  async fn cache_first(&self, request: &InterceptRequest) -> SyncResult<InterceptResponse> {
    let namespace = &self.settings.shell_namespace;

    if let Some(response) = self.namespaces.get(namespace, request.url.as_str())? {
      debug!(url = %request.url, "serving shell asset from cache");
      return Ok(InterceptResponse {
        response,
        source: ResponseSource::Cache,
      });
    }

    match self.upstream.fetch(request).await {
      Ok(response) => Ok(InterceptResponse {
        response,
        source: ResponseSource::Network,
      }),
      Err(network_err) if request.mode == RequestMode::Navigate => {
        let fallback = self
          .namespaces
          .get(namespace, self.settings.offline_fallback.as_str())?;
        match fallback {
          Some(response) => {
            debug!(url = %request.url, "navigation offline, serving fallback");
            Ok(InterceptResponse {
              response,
              source: ResponseSource::Fallback,
            })
          }
          None => Err(network_err),
        }
      }
      Err(network_err) => Err(network_err),
    }
  }

  /// Apply one client message.
  pub fn handle_message(&self, message: InterceptMessage) -> SyncResult<()> {
    match message {
      InterceptMessage::CacheData { path, value } => {
        let url = resource_url(&self.settings.data_base, &path)?;
        let body = serde_json::to_vec(&value)?;
        self
          .namespaces
          .put(&self.settings.data_namespace, url.as_str(), &StoredResponse::json(body))?;
        debug!(path = %path, url = %url, "pre-warmed data namespace");
        Ok(())
      }
    }
  }

  /// Run the message loop on its own task. The task ends once every
  /// handle has been dropped and the queue is drained.
  pub fn spawn(self: Arc<Self>) -> (InterceptorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        if let Err(e) = self.handle_message(message) {
          warn!(error = %e, "interceptor message failed");
        }
      }
      debug!("interceptor message loop stopped");
    });
    (InterceptorHandle { tx }, task)
  }
}
