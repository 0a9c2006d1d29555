//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Result type alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Classified failures produced by the store, remote and interception layers.
///
/// A path that legitimately has no data is not an error: the remote layer
/// returns `Ok(None)` for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Local persistence cannot be opened or written.
  #[error("local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// Network or transport failure talking to the remote service.
  #[error("remote unavailable: {0}")]
  RemoteUnavailable(String),

  /// The remote service refused the request.
  #[error("permission denied: {0}")]
  RemoteDenied(String),

  /// Operation superseded or its subscriber was torn down.
  #[error("operation cancelled")]
  Cancelled,

  /// A payload or cached row could not be decoded.
  #[error("malformed data: {0}")]
  Malformed(String),
}

impl SyncError {
  /// Transient failures may be recovered by falling back to cached data.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::RemoteUnavailable(_) | Self::StorageUnavailable(_))
  }

  /// Failures that must reach the caller even when cached data exists.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::RemoteDenied(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    Self::Malformed(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
        Self::RemoteDenied(e.to_string())
      }
      _ if e.is_decode() => Self::Malformed(e.to_string()),
      _ => Self::RemoteUnavailable(e.to_string()),
    }
  }
}
