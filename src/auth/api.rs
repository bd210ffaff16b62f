use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::tokens::TokenPair;
use crate::error::{SyncError, SyncResult};
use crate::net::api_types::{LoginRequest, RefreshRequest, TokenResponse};
use crate::net::{ApiRequest, ApiResponse, Transport};

/// Backend authentication endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
  async fn login(&self, username: &str, password: &str) -> SyncResult<TokenPair>;

  /// Exchange a refresh token for a new pair.
  ///
  /// Must return [`SyncError::AuthenticationRequired`] when the server refuses the
  /// refresh token; any other error leaves the current credentials in place.
  async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenPair>;

  async fn logout(&self, tokens: &TokenPair) -> SyncResult<()>;
}

#[derive(Debug, Clone)]
pub struct AuthEndpoints {
  pub login: Url,
  pub refresh: Url,
  pub logout: Url,
}

/// [`AuthApi`] over plain JSON endpoints.
///
/// These calls go straight to the transport; they never pass through the
/// pipeline, so a refresh can't recursively trigger another refresh.
pub struct HttpAuthApi {
  transport: Arc<dyn Transport>,
  endpoints: AuthEndpoints,
}

impl HttpAuthApi {
  pub fn new(transport: Arc<dyn Transport>, endpoints: AuthEndpoints) -> Self {
    Self {
      transport,
      endpoints,
    }
  }

  fn token_pair(response: &ApiResponse, previous_refresh: Option<&str>) -> SyncResult<TokenPair> {
    let body: TokenResponse = response.json()?;
    if let Some(kind) = body.token_type.as_deref() {
      if !kind.eq_ignore_ascii_case("bearer") {
        debug!(token_type = kind, "unexpected token type, using it as bearer anyway");
      }
    }
    let refresh_token = body
      .refresh_token
      .or_else(|| previous_refresh.map(String::from))
      .ok_or_else(|| {
        SyncError::AuthenticationRequired("server did not issue a refresh token".into())
      })?;
    Ok(TokenPair::new(body.access_token, refresh_token))
  }
}

fn auth_failure(response: &ApiResponse, what: &str) -> SyncError {
  match response.status {
    400 | 401 | 403 => SyncError::AuthenticationRequired(format!(
      "{} refused (HTTP {}): {}",
      what,
      response.status,
      response.body_snippet()
    )),
    status => SyncError::ServerError { status },
  }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
  async fn login(&self, username: &str, password: &str) -> SyncResult<TokenPair> {
    let request =
      ApiRequest::post_json(self.endpoints.login.clone(), &LoginRequest { username, password })?;
    let response = self.transport.execute(&request).await?;
    if !response.is_success() {
      return Err(auth_failure(&response, "login"));
    }
    Self::token_pair(&response, None)
  }

  async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenPair> {
    let request = ApiRequest::post_json(
      self.endpoints.refresh.clone(),
      &RefreshRequest { refresh_token },
    )?;
    let response = self.transport.execute(&request).await?;
    if !response.is_success() {
      return Err(auth_failure(&response, "token refresh"));
    }
    Self::token_pair(&response, Some(refresh_token))
  }

  async fn logout(&self, tokens: &TokenPair) -> SyncResult<()> {
    let request = ApiRequest::post_json(
      self.endpoints.logout.clone(),
      &RefreshRequest {
        refresh_token: &tokens.refresh_token,
      },
    )?
    .with_header("authorization", format!("Bearer {}", tokens.access_token));
    let response = self.transport.execute(&request).await?;
    if response.is_success() || response.status == 401 {
      Ok(())
    } else {
      Err(SyncError::ServerError {
        status: response.status,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{base_url, MockTransport};

  fn endpoints() -> AuthEndpoints {
    AuthEndpoints {
      login: base_url().join("/api/v1/auth/login").unwrap(),
      refresh: base_url().join("/api/v1/auth/refresh").unwrap(),
      logout: base_url().join("/api/v1/auth/logout").unwrap(),
    }
  }

  #[tokio::test]
  async fn test_refresh_keeps_old_refresh_token_when_not_rotated() {
    let transport = MockTransport::new(|req| async move {
      let body: serde_json::Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
      assert_eq!(body["refresh_token"], "r1");
      Ok(ApiResponse::new(
        200,
        r#"{"access_token":"a2","token_type":"bearer"}"#,
      ))
    });
    let api = HttpAuthApi::new(transport, endpoints());
    let pair = api.refresh("r1").await.unwrap();
    assert_eq!(pair, TokenPair::new("a2", "r1"));
  }

  #[tokio::test]
  async fn test_refresh_rejection_requires_login() {
    let transport = MockTransport::new(|_| async { Ok(ApiResponse::new(401, "expired")) });
    let api = HttpAuthApi::new(transport, endpoints());
    assert!(matches!(
      api.refresh("r1").await,
      Err(SyncError::AuthenticationRequired(_))
    ));
  }

  #[tokio::test]
  async fn test_refresh_server_error_is_transient() {
    let transport = MockTransport::new(|_| async { Ok(ApiResponse::new(502, "")) });
    let api = HttpAuthApi::new(transport, endpoints());
    assert_eq!(
      api.refresh("r1").await,
      Err(SyncError::ServerError { status: 502 })
    );
  }

  #[tokio::test]
  async fn test_login_posts_credentials() {
    let transport = MockTransport::new(|req| async move {
      assert_eq!(req.url.path(), "/api/v1/auth/login");
      assert_eq!(req.header("content-type"), Some("application/json"));
      Ok(ApiResponse::new(
        200,
        r#"{"access_token":"a1","refresh_token":"r1","token_type":"bearer"}"#,
      ))
    });
    let api = HttpAuthApi::new(transport.clone(), endpoints());
    let pair = api.login("dealer", "hunter2").await.unwrap();
    assert_eq!(pair, TokenPair::new("a1", "r1"));
    assert_eq!(transport.call_count(), 1);
  }
}
