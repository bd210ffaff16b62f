//! Authenticated request pipeline with single-flight token refresh.
//!
//! Every outbound request goes through [`AuthPipeline::send`]. The token slot and
//! the refresh phase live behind one mutex, so "am I the one who refreshes?" is a
//! single check-and-set. The refresh itself runs in a spawned task and publishes
//! its outcome on a `watch` channel; waiters that arrive late still see the value.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::api::AuthApi;
use super::tokens::{TokenPair, TokenStore};
use crate::error::{SyncError, SyncResult};
use crate::net::{ApiRequest, ApiResponse, Transport};

type RefreshOutcome = SyncResult<TokenPair>;
type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;
type OutcomeSender = watch::Sender<Option<RefreshOutcome>>;

/// Observable pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
  Idle,
  Refreshing,
}

enum RefreshPhase {
  Idle,
  Refreshing(OutcomeReceiver),
}

struct AuthState {
  tokens: Option<TokenPair>,
  /// Bumped on every change of `tokens` (login, refresh, logout, clear)
  generation: u64,
  phase: RefreshPhase,
}

struct PipelineInner {
  transport: Arc<dyn Transport>,
  auth: Arc<dyn AuthApi>,
  store: Option<TokenStore>,
  state: Mutex<AuthState>,
}

/// Shared handle to the process-wide pipeline.
#[derive(Clone)]
pub struct AuthPipeline {
  inner: Arc<PipelineInner>,
}

impl AuthPipeline {
  /// Create a pipeline, restoring persisted credentials if a store is given.
  pub fn new(
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthApi>,
    store: Option<TokenStore>,
  ) -> Self {
    let tokens = match store.as_ref().map(TokenStore::load) {
      Some(Ok(tokens)) => tokens,
      Some(Err(e)) => {
        warn!(error = %e, "could not load stored credentials, starting signed out");
        None
      }
      None => None,
    };

    Self {
      inner: Arc::new(PipelineInner {
        transport,
        auth,
        store,
        state: Mutex::new(AuthState {
          tokens,
          generation: 0,
          phase: RefreshPhase::Idle,
        }),
      }),
    }
  }

  pub fn transport(&self) -> Arc<dyn Transport> {
    Arc::clone(&self.inner.transport)
  }

  pub fn is_authenticated(&self) -> bool {
    self.inner.lock_state().tokens.is_some()
  }

  pub fn phase(&self) -> PipelinePhase {
    match self.inner.lock_state().phase {
      RefreshPhase::Idle => PipelinePhase::Idle,
      RefreshPhase::Refreshing(_) => PipelinePhase::Refreshing,
    }
  }

  /// Log in and install the issued token pair.
  pub async fn login(&self, username: &str, password: &str) -> SyncResult<()> {
    let tokens = self.inner.auth.login(username, password).await?;
    {
      let mut state = self.inner.lock_state();
      state.tokens = Some(tokens.clone());
      state.generation += 1;
    }
    self.inner.persist(Some(&tokens));
    info!(username, "logged in");
    Ok(())
  }

  /// Forget the current credentials locally and, best effort, on the server.
  pub async fn logout(&self) {
    let previous = {
      let mut state = self.inner.lock_state();
      state.generation += 1;
      state.tokens.take()
    };
    self.inner.persist(None);

    if let Some(tokens) = previous {
      if let Err(e) = self.inner.auth.logout(&tokens).await {
        debug!(error = %e, "server-side logout failed, local credentials already cleared");
      }
    }
    info!("logged out");
  }

  /// Send a request with the current access token attached.
  ///
  /// A 401 joins (or starts) the single in-flight refresh and the request is
  /// re-sent exactly once with the refreshed token. A 401 on that retry is final.
  pub async fn send(&self, request: &ApiRequest) -> SyncResult<ApiResponse> {
    let (access_token, generation) = self.inner.snapshot();

    match self
      .execute_with(request, access_token.as_deref())
      .await?
      .into_authorized()
    {
      Err(SyncError::AuthenticationExpired) => {}
      other => return other,
    }

    debug!(url = %request.url, "access token rejected, awaiting refresh");
    let tokens = self.refreshed_since(generation).await?;

    match self
      .execute_with(request, Some(&tokens.access_token))
      .await?
      .into_authorized()
    {
      Err(SyncError::AuthenticationExpired) => {
        warn!(url = %request.url, "request rejected again after refresh");
        self.inner.clear_if_current(&tokens);
        Err(SyncError::AuthenticationRequired(
          "credentials rejected after refresh".into(),
        ))
      }
      other => other,
    }
  }

  async fn execute_with(
    &self,
    request: &ApiRequest,
    access_token: Option<&str>,
  ) -> SyncResult<ApiResponse> {
    match access_token {
      Some(token) => {
        let authorized = request
          .clone()
          .with_header("authorization", format!("Bearer {}", token));
        self.inner.transport.execute(&authorized).await
      }
      None => self.inner.transport.execute(request).await,
    }
  }

  /// Tokens newer than `seen`, refreshing if nobody has done so yet.
  async fn refreshed_since(&self, seen: u64) -> SyncResult<TokenPair> {
    let (mut rx, start) = {
      let mut state = self.inner.lock_state();

      if state.generation != seen {
        // Someone already replaced (or cleared) the pair this request used
        return state.tokens.clone().ok_or_else(|| {
          SyncError::AuthenticationRequired("signed out while request was in flight".into())
        });
      }

      match &state.phase {
        RefreshPhase::Refreshing(rx) => (rx.clone(), None),
        RefreshPhase::Idle => {
          let refresh_token = match &state.tokens {
            Some(tokens) => tokens.refresh_token.clone(),
            None => {
              return Err(SyncError::AuthenticationRequired(
                "no credentials to refresh".into(),
              ))
            }
          };
          let (tx, rx) = watch::channel(None);
          state.phase = RefreshPhase::Refreshing(rx.clone());
          (rx, Some((refresh_token, tx)))
        }
      }
    };

    // Spawned outside the state lock; later callers already see the phase and wait on rx
    if let Some((refresh_token, tx)) = start {
      self.spawn_refresh(refresh_token, seen, tx);
    }

    loop {
      if let Some(outcome) = rx.borrow_and_update().as_ref() {
        return outcome.clone();
      }
      if rx.changed().await.is_err() {
        return Err(SyncError::AuthenticationRequired(
          "token refresh was aborted".into(),
        ));
      }
    }
  }

  /// Run the refresh detached from any caller so abandonment can't strand it.
  fn spawn_refresh(&self, refresh_token: String, generation: u64, tx: OutcomeSender) {
    let guard = RefreshGuard {
      inner: Arc::clone(&self.inner),
      generation,
      tx: Some(tx),
    };
    tokio::spawn(async move {
      info!("refreshing access token");
      let outcome = guard.inner.auth.refresh(&refresh_token).await;
      guard.complete(outcome);
    });
  }
}

impl PipelineInner {
  fn lock_state(&self) -> MutexGuard<'_, AuthState> {
    // Every critical section is a handful of plain assignments; poisoning can't leave it half-updated
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn snapshot(&self) -> (Option<String>, u64) {
    let state = self.lock_state();
    (
      state.tokens.as_ref().map(|t| t.access_token.clone()),
      state.generation,
    )
  }

  /// Resolve an in-flight refresh: swap tokens, return to Idle, then wake waiters.
  fn finish_refresh(&self, generation: u64, outcome: RefreshOutcome, tx: OutcomeSender) {
    let persist = {
      let mut state = self.lock_state();
      state.phase = RefreshPhase::Idle;

      if state.generation != generation {
        // A login or logout happened meanwhile; it owns the slot now
        None
      } else {
        match &outcome {
          Ok(tokens) => {
            state.tokens = Some(tokens.clone());
            state.generation += 1;
            Some(Some(tokens.clone()))
          }
          Err(SyncError::AuthenticationRequired(_)) => {
            state.tokens = None;
            state.generation += 1;
            Some(None)
          }
          Err(_) => None,
        }
      }
    };

    match (&outcome, persist) {
      (_, Some(tokens)) => {
        self.persist(tokens.as_ref());
        match tokens {
          Some(_) => info!("access token refreshed"),
          None => warn!("refresh token rejected, credentials cleared"),
        }
      }
      (Err(e), None) => warn!(error = %e, "token refresh failed, keeping current credentials"),
      (Ok(_), None) => debug!("refresh result discarded, credentials changed meanwhile"),
    }

    let _ = tx.send(Some(outcome));
  }

  /// Clear credentials, unless they have already been replaced.
  fn clear_if_current(&self, tokens: &TokenPair) {
    let cleared = {
      let mut state = self.lock_state();
      if state.tokens.as_ref() == Some(tokens) {
        state.tokens = None;
        state.generation += 1;
        true
      } else {
        false
      }
    };
    if cleared {
      self.persist(None);
    }
  }

  fn persist(&self, tokens: Option<&TokenPair>) {
    let Some(store) = &self.store else {
      return;
    };
    let result = match tokens {
      Some(tokens) => store.save(tokens),
      None => store.clear(),
    };
    if let Err(e) = result {
      warn!(error = %e, "credential persistence failed, keeping credentials in memory only");
    }
  }
}

/// Completes the refresh even if the task panics or the runtime drops it.
struct RefreshGuard {
  inner: Arc<PipelineInner>,
  generation: u64,
  tx: Option<OutcomeSender>,
}

impl RefreshGuard {
  fn complete(mut self, outcome: RefreshOutcome) {
    if let Some(tx) = self.tx.take() {
      self.inner.finish_refresh(self.generation, outcome, tx);
    }
  }
}

impl Drop for RefreshGuard {
  fn drop(&mut self) {
    if let Some(tx) = self.tx.take() {
      self.inner.finish_refresh(
        self.generation,
        Err(SyncError::NetworkUnavailable(
          "token refresh was interrupted".into(),
        )),
        tx,
      );
    }
  }
}
