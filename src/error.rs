//! Error taxonomy shared by the cache router, the upload queue and the auth pipeline.

use thiserror::Error;

/// Failures surfaced by the resilience layer.
///
/// Cloneable so a single refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// Transport-level failure (offline, DNS, connect, timeout). Retryable.
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// The server rejected the access token (HTTP 401).
  #[error("access token expired")]
  AuthenticationExpired,

  /// Refresh failed or credentials are missing; the user has to log in again.
  #[error("authentication required: {0}")]
  AuthenticationRequired(String),

  /// Cache, queue or credential persistence failed.
  #[error("storage failure: {0}")]
  StorageFailure(String),

  /// The server refused a queued submission. Retrying will not help.
  #[error("submission rejected by server (HTTP {status}): {reason}")]
  DeliveryRejected { status: u16, reason: String },

  /// Retryable HTTP failure (408, 429 or 5xx).
  #[error("server error (HTTP {status})")]
  ServerError { status: u16 },

  /// The request could not be built (bad URL, unserializable payload).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl SyncError {
  /// Whether a later attempt may succeed without user intervention.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SyncError::NetworkUnavailable(_) | SyncError::ServerError { .. }
    )
  }

  pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
    SyncError::StorageFailure(err.to_string())
  }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
