use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{ApiRequest, ApiResponse, Transport};
use crate::error::{SyncError, SyncResult};

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("capsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: &ApiRequest) -> SyncResult<ApiResponse> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_builder() {
        SyncError::InvalidRequest(format!("{} {}: {}", request.method, request.url, e))
      } else {
        SyncError::NetworkUnavailable(format!("{} {}: {}", request.method, request.url, e))
      }
    })?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();

    // A body cut off mid-stream is as good as no response
    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::NetworkUnavailable(format!("reading {}: {}", request.url, e)))?;

    Ok(ApiResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
