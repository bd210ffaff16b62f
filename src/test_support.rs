//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::auth::{AuthApi, TokenPair};
use crate::error::{SyncError, SyncResult};
use crate::net::{ApiRequest, ApiResponse, Transport};

pub fn base_url() -> Url {
  Url::parse("https://api.example.test").unwrap()
}

type Handler = Box<dyn Fn(ApiRequest) -> BoxFuture<'static, SyncResult<ApiResponse>> + Send + Sync>;

/// Transport whose responses come from a closure; records every request.
pub struct MockTransport {
  handler: Handler,
  calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
  pub fn new<F, Fut>(handler: F) -> Arc<Self>
  where
    F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<ApiResponse>> + Send + 'static,
  {
    Arc::new(Self {
      handler: Box::new(move |req| handler(req).boxed()),
      calls: Mutex::new(Vec::new()),
    })
  }

  /// Every request fails as if the device were offline.
  pub fn offline() -> Arc<Self> {
    Self::new(|_| async { Err(SyncError::NetworkUnavailable("offline".into())) })
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn execute(&self, request: &ApiRequest) -> SyncResult<ApiResponse> {
    self.calls.lock().unwrap().push(request.clone());
    (self.handler)(request.clone()).await
  }
}

/// AuthApi with a fixed refresh outcome that counts its calls.
pub struct MockAuth {
  outcome: SyncResult<TokenPair>,
  delay: Duration,
  refresh_calls: AtomicUsize,
  logout_calls: AtomicUsize,
  last_refresh_token: Mutex<Option<String>>,
}

impl MockAuth {
  fn with_outcome(outcome: SyncResult<TokenPair>) -> Self {
    Self {
      outcome,
      delay: Duration::ZERO,
      refresh_calls: AtomicUsize::new(0),
      logout_calls: AtomicUsize::new(0),
      last_refresh_token: Mutex::new(None),
    }
  }

  pub fn succeeding(tokens: TokenPair) -> Arc<Self> {
    Arc::new(Self::with_outcome(Ok(tokens)))
  }

  pub fn rejecting() -> Arc<Self> {
    Arc::new(Self::with_outcome(Err(SyncError::AuthenticationRequired(
      "refresh token revoked".into(),
    ))))
  }

  pub fn offline() -> Arc<Self> {
    Arc::new(Self::with_outcome(Err(SyncError::NetworkUnavailable(
      "offline".into(),
    ))))
  }

  /// Builder for a slow refresh; call before sharing the Arc.
  pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
    let mut inner = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("MockAuth already shared"));
    inner.delay = delay;
    Arc::new(inner)
  }

  pub fn refresh_calls(&self) -> usize {
    self.refresh_calls.load(Ordering::SeqCst)
  }

  pub fn logout_calls(&self) -> usize {
    self.logout_calls.load(Ordering::SeqCst)
  }

  pub fn last_refresh_token(&self) -> Option<String> {
    self.last_refresh_token.lock().unwrap().clone()
  }
}

#[async_trait]
impl AuthApi for MockAuth {
  async fn login(&self, _username: &str, _password: &str) -> SyncResult<TokenPair> {
    self.outcome.clone()
  }

  async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenPair> {
    self.refresh_calls.fetch_add(1, Ordering::SeqCst);
    *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.outcome.clone()
  }

  async fn logout(&self, _tokens: &TokenPair) -> SyncResult<()> {
    self.logout_calls.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
