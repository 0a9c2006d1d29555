//! Raw network access for intercepted requests.

use async_trait::async_trait;
use reqwest::header;
use std::time::Duration;
use url::Url;

use super::namespace::StoredResponse;
use crate::error::{SyncError, SyncResult};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(20);

/// Whether a request loads a top-level document or a sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  Subresource,
}

/// An outgoing request seen by the interceptor.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
}

impl InterceptRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// Network used by the interceptor. Errors mean the request never got a
/// response; any HTTP status is a response.
#[async_trait]
pub trait Upstream: Send + Sync {
  async fn fetch(&self, request: &InterceptRequest) -> SyncResult<StoredResponse>;
}

/// reqwest-backed upstream
#[derive(Clone)]
pub struct HttpUpstream {
  client: reqwest::Client,
}

impl HttpUpstream {
  pub fn new() -> SyncResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(UPSTREAM_TIMEOUT)
      .build()
      .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Upstream for HttpUpstream {
  async fn fetch(&self, request: &InterceptRequest) -> SyncResult<StoredResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| SyncError::Malformed(format!("invalid method {}: {}", request.method, e)))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;

    Ok(StoredResponse {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}
