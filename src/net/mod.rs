//! Request/response types and the transport seam used by every network leg.

pub mod api_types;
mod client;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use url::Url;

use crate::error::{SyncError, SyncResult};

pub use client::HttpTransport;

/// An outbound HTTP request, independent of the transport that executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl ApiRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn post(url: Url) -> Self {
    Self::new(Method::POST, url)
  }

  /// POST a serializable value as JSON.
  pub fn post_json<T: serde::Serialize>(url: Url, value: &T) -> SyncResult<Self> {
    let body = serde_json::to_vec(value)
      .map_err(|e| SyncError::InvalidRequest(format!("failed to encode body: {}", e)))?;
    Ok(
      Self::post(url)
        .with_header("content-type", "application/json")
        .with_body(body),
    )
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Side-effect-free requests; the only ones eligible for caching.
  pub fn is_idempotent(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Turn a 401 into [`SyncError::AuthenticationExpired`].
  pub fn into_authorized(self) -> SyncResult<Self> {
    if self.status == 401 {
      Err(SyncError::AuthenticationExpired)
    } else {
      Ok(self)
    }
  }

  pub fn json<T: DeserializeOwned>(&self) -> SyncResult<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| SyncError::InvalidRequest(format!("unexpected response body: {}", e)))
  }

  /// Body as text, truncated for error messages.
  pub fn body_snippet(&self) -> String {
    let text = String::from_utf8_lossy(&self.body);
    text.chars().take(200).collect()
  }
}

/// Executes requests against the backend.
///
/// Any failure to obtain an HTTP response at all is reported as
/// [`SyncError::NetworkUnavailable`]; HTTP error statuses are returned as responses.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &ApiRequest) -> SyncResult<ApiResponse>;
}
