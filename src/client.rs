//! Client facade wiring the pipeline, cache router and upload queue together.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthEndpoints, AuthPipeline, HttpAuthApi, TokenStore};
use crate::cache::{
  Activation, CacheResult, CacheRouter, CacheStorage, NoopStorage, RouteRules, SqliteStorage,
};
use crate::config::Config;
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::net::api_types::{PhotoBatch, SubmissionReceipt};
use crate::net::{ApiRequest, ApiResponse, HttpTransport, Transport};
use crate::queue::{DrainReport, QueueStatus, QueueStore, UploadQueue};
use crate::sync::ConnectivityMonitor;

/// What happened to a submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  Delivered {
    id: Uuid,
    receipt: Option<SubmissionReceipt>,
  },
  /// Kept in the queue; it goes out on the next successful drain.
  /// `blocked_by` is set when the session ended and a new login is needed first.
  Queued {
    id: Uuid,
    blocked_by: Option<SyncError>,
  },
}

/// Entry point for a UI shell.
///
/// Reads go through the cache router, writes through the upload queue, and both
/// share one auth pipeline. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct ResilientClient {
  base_url: Url,
  health: Url,
  cache_version: String,
  transport: Arc<dyn Transport>,
  pipeline: AuthPipeline,
  router: Arc<CacheRouter>,
  queue: UploadQueue,
}

impl ResilientClient {
  /// Create a client backed by the on-disk database.
  ///
  /// If the database can't be opened the client still works, without caching
  /// and with an in-memory queue and session.
  pub fn new(config: &Config) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
      config.api.timeout_secs,
    ))?);
    let db = match Database::open() {
      Ok(db) => Some(Arc::new(db)),
      Err(e) => {
        warn!(error = %e, "database unavailable, running without persistence");
        None
      }
    };
    Self::from_parts(config, transport, db)
  }

  pub fn from_parts(
    config: &Config,
    transport: Arc<dyn Transport>,
    db: Option<Arc<Database>>,
  ) -> Result<Self> {
    let endpoints = AuthEndpoints {
      login: config.endpoint(&config.api.login_path)?,
      refresh: config.endpoint(&config.api.refresh_path)?,
      logout: config.endpoint(&config.api.logout_path)?,
    };
    let auth = Arc::new(HttpAuthApi::new(Arc::clone(&transport), endpoints));
    let pipeline = AuthPipeline::new(
      Arc::clone(&transport),
      auth,
      db.clone().map(TokenStore::new),
    );

    let storage: Arc<dyn CacheStorage> = match &db {
      Some(db) => Arc::new(SqliteStorage::new(Arc::clone(db))),
      None => Arc::new(NoopStorage),
    };
    let precache = config
      .cache
      .precache
      .iter()
      .map(|path| config.endpoint(path))
      .collect::<Result<Vec<_>>>()?;
    let rules = RouteRules::new(precache, config.cache.api_prefixes.clone());
    let router = Arc::new(CacheRouter::new(storage, pipeline.clone(), rules));

    let queue = UploadQueue::new(
      pipeline.clone(),
      config.endpoint(&config.api.submission_path)?,
      config.queue.eviction_policy(),
      db.map(QueueStore::new),
    );

    Ok(Self {
      base_url: config.api.base_url.clone(),
      health: config.endpoint(&config.api.health_path)?,
      cache_version: config.cache.version.clone(),
      transport,
      pipeline,
      router,
      queue,
    })
  }

  /// Resolve a path against the backend base URL.
  pub fn url(&self, path: &str) -> SyncResult<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| SyncError::InvalidRequest(format!("invalid path '{}': {}", path, e)))
  }

  /// Send any request; reads may be answered from cache.
  pub async fn send(&self, request: &ApiRequest) -> SyncResult<CacheResult<ApiResponse>> {
    self.router.fetch(request).await
  }

  pub async fn get(&self, path: &str) -> SyncResult<CacheResult<ApiResponse>> {
    self.send(&ApiRequest::get(self.url(path)?)).await
  }

  pub async fn login(&self, username: &str, password: &str) -> SyncResult<()> {
    self.pipeline.login(username, password).await
  }

  pub async fn logout(&self) {
    self.pipeline.logout().await
  }

  pub fn is_authenticated(&self) -> bool {
    self.pipeline.is_authenticated()
  }

  /// Queue a batch and try to deliver it right away.
  ///
  /// Older pending submissions go out first. A rejection of this batch is
  /// returned as an error. If the session ended the batch stays queued and the
  /// outcome carries the `AuthenticationRequired` error.
  pub async fn submit(&self, batch: &PhotoBatch) -> SyncResult<SubmitOutcome> {
    let id = self.enqueue(batch)?;
    let report = match self.queue.drain().await {
      Ok(report) => report,
      Err(e @ SyncError::AuthenticationRequired(_)) => {
        info!(%id, "submission queued until sign-in");
        return Ok(SubmitOutcome::Queued {
          id,
          blocked_by: Some(e),
        });
      }
      Err(e) => return Err(e),
    };

    if let Some(delivered) = report.delivered.into_iter().find(|d| d.id == id) {
      return Ok(SubmitOutcome::Delivered {
        id,
        receipt: delivered.receipt,
      });
    }
    if let Some((_, error)) = report.rejected.into_iter().find(|(rejected, _)| *rejected == id) {
      return Err(error);
    }
    info!(%id, "submission queued for later delivery");
    Ok(SubmitOutcome::Queued {
      id,
      blocked_by: None,
    })
  }

  /// Queue a batch without attempting delivery.
  pub fn enqueue(&self, batch: &PhotoBatch) -> SyncResult<Uuid> {
    let payload = batch.encode()?;
    Ok(self.queue.enqueue(payload, batch.metadata()))
  }

  pub fn queue_status(&self) -> QueueStatus {
    self.queue.status()
  }

  /// Drain the upload queue now.
  pub async fn retry_now(&self) -> SyncResult<DrainReport> {
    self.queue.drain().await
  }

  pub fn queue(&self) -> &UploadQueue {
    &self.queue
  }

  /// The configured cache version.
  pub fn cache_version(&self) -> &str {
    &self.cache_version
  }

  pub fn active_cache_version(&self) -> Option<String> {
    self.router.active_version()
  }

  pub async fn install(&self, version: &str) -> SyncResult<usize> {
    self.router.install(version).await
  }

  pub fn activate(&self, version: &str) -> Activation {
    self.router.activate(version)
  }

  /// Install and activate the configured version unless it is already active.
  pub async fn ensure_cache_version(&self) -> SyncResult<Option<Activation>> {
    if self.active_cache_version().as_deref() == Some(self.cache_version.as_str()) {
      return Ok(None);
    }
    self.install(&self.cache_version).await?;
    Ok(Some(self.activate(&self.cache_version)))
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) {
    self.router.settle().await
  }

  pub fn connectivity_monitor(&self, period: Duration) -> ConnectivityMonitor {
    ConnectivityMonitor::new(Arc::clone(&self.transport), self.health.clone(), period)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::net::api_types::VehicleDetails;
  use crate::test_support::MockTransport;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  fn config() -> Config {
    serde_yaml::from_str(
      r#"
api:
  base_url: https://api.example.test
cache:
  version: v1
  precache: [/index.html]
"#,
    )
    .unwrap()
  }

  /// A small backend: issues numbered access tokens, expires them on demand,
  /// and accepts submissions only with the current token.
  struct Backend {
    online: AtomicBool,
    issued: AtomicUsize,
    current: Mutex<Option<String>>,
    refreshes: AtomicUsize,
  }

  impl Backend {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        online: AtomicBool::new(true),
        issued: AtomicUsize::new(0),
        current: Mutex::new(None),
        refreshes: AtomicUsize::new(0),
      })
    }

    fn issue(&self) -> ApiResponse {
      let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
      let access = format!("access-{}", n);
      *self.current.lock().unwrap() = Some(access.clone());
      ApiResponse::new(
        200,
        format!(
          r#"{{"access_token":"{}","refresh_token":"refresh-{}","token_type":"bearer"}}"#,
          access, n
        ),
      )
    }

    fn expire(&self) {
      *self.current.lock().unwrap() = None;
    }

    fn handle(&self, req: &ApiRequest) -> SyncResult<ApiResponse> {
      if !self.online.load(Ordering::SeqCst) {
        return Err(SyncError::NetworkUnavailable("offline".into()));
      }
      match req.url.path() {
        "/api/v1/auth/login" => Ok(self.issue()),
        "/api/v1/auth/refresh" => {
          self.refreshes.fetch_add(1, Ordering::SeqCst);
          Ok(self.issue())
        }
        "/index.html" => Ok(ApiResponse::new(200, "<html>")),
        _ => {
          let current = self.current.lock().unwrap().clone();
          let presented = req
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(String::from);
          if current.is_none() || current != presented {
            return Ok(ApiResponse::new(401, r#"{"detail":"token expired"}"#));
          }
          if req.url.path() == "/api/vehicles" && req.method == reqwest::Method::POST {
            Ok(ApiResponse::new(
              202,
              r#"{"task_id":"task-42","status":"processing"}"#,
            ))
          } else {
            Ok(ApiResponse::new(200, format!("{{\"path\":\"{}\"}}", req.url.path())))
          }
        }
      }
    }
  }

  fn client_on(backend: &Arc<Backend>, db: Option<Arc<Database>>) -> ResilientClient {
    let transport = {
      let backend = Arc::clone(backend);
      MockTransport::new(move |req| {
        let result = backend.handle(&req);
        async move { result }
      })
    };
    ResilientClient::from_parts(&config(), transport, db).unwrap()
  }

  fn batch() -> PhotoBatch {
    let mut batch = PhotoBatch::new(VehicleDetails {
      vin: Some("1HGCM82633A004352".into()),
      ..Default::default()
    });
    batch.add_photo(b"jpeg-bytes", "exterior_front");
    batch
  }

  #[tokio::test]
  async fn test_submit_online_delivers_immediately() {
    let backend = Backend::new();
    let client = client_on(&backend, None);
    client.login("lot-3", "pw").await.unwrap();

    match client.submit(&batch()).await.unwrap() {
      SubmitOutcome::Delivered { receipt, .. } => {
        assert_eq!(receipt.unwrap().task_id, "task-42")
      }
      other => panic!("expected delivery, got {:?}", other),
    }
    assert_eq!(client.queue_status().pending, 0);
  }

  #[tokio::test]
  async fn test_submit_offline_queues_then_retry_delivers() {
    let backend = Backend::new();
    let client = client_on(&backend, None);
    client.login("lot-3", "pw").await.unwrap();

    backend.online.store(false, Ordering::SeqCst);
    let outcome = client.submit(&batch()).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued { blocked_by: None, .. }));
    assert_eq!(client.queue_status().pending, 1);

    backend.online.store(true, Ordering::SeqCst);
    let report = client.retry_now().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(client.queue_status().pending, 0);
  }

  #[tokio::test]
  async fn test_signed_out_submit_keeps_batch_and_its_id() {
    let backend = Backend::new();
    let client = client_on(&backend, None);

    let id = match client.submit(&batch()).await.unwrap() {
      SubmitOutcome::Queued {
        id,
        blocked_by: Some(SyncError::AuthenticationRequired(_)),
      } => id,
      other => panic!("expected a queued batch waiting for sign-in, got {:?}", other),
    };
    assert_eq!(client.queue_status().pending, 1);
    assert_eq!(client.queue().pending()[0].id, id);

    client.login("lot-3", "pw").await.unwrap();
    let report = client.retry_now().await.unwrap();
    assert!(report.was_delivered(id));
  }

  #[tokio::test]
  async fn test_expired_token_refreshes_once_for_concurrent_reads() {
    let backend = Backend::new();
    let client = client_on(&backend, None);
    client.login("lot-3", "pw").await.unwrap();
    backend.expire();
    // Let the refresh issue a token the backend accepts
    let reads = (0..4).map(|i| {
      let client = client.clone();
      async move { client.get(&format!("/api/v1/analysis/{}", i)).await }
    });

    let results = futures::future::join_all(reads).await;
    for result in results {
      let result = result.unwrap();
      assert_eq!(result.data.status, 200);
      assert_eq!(result.source, CacheSource::Bypass);
    }
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_ensure_cache_version_precaches_once() {
    let backend = Backend::new();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let client = client_on(&backend, Some(db));

    let activation = client.ensure_cache_version().await.unwrap().unwrap();
    assert_eq!(activation.version, "v1");
    assert!(client.ensure_cache_version().await.unwrap().is_none());

    backend.online.store(false, Ordering::SeqCst);
    let page = client.get("/index.html").await.unwrap();
    assert_eq!(page.source, CacheSource::Cache);
    assert_eq!(page.data.body, b"<html>");
  }

  #[tokio::test]
  async fn test_session_and_queue_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let backend = Backend::new();

    {
      let client = client_on(&backend, Some(Arc::new(Database::open_at(&path).unwrap())));
      client.login("lot-3", "pw").await.unwrap();
      client.enqueue(&batch()).unwrap();
    }

    let client = client_on(&backend, Some(Arc::new(Database::open_at(&path).unwrap())));
    assert!(client.is_authenticated());
    assert_eq!(client.queue_status().pending, 1);
    let report = client.retry_now().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
  }

  #[tokio::test]
  async fn test_logout_requires_new_login() {
    let backend = Backend::new();
    let client = client_on(&backend, None);
    client.login("lot-3", "pw").await.unwrap();
    client.logout().await;

    assert!(!client.is_authenticated());
    let err = client.get("/api/vehicles/7").await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationRequired(_)));
  }

  #[tokio::test]
  async fn test_empty_batch_is_not_queued() {
    let client = client_on(&Backend::new(), None);
    let err = client.enqueue(&PhotoBatch::default()).unwrap_err();
    assert!(matches!(err, SyncError::InvalidRequest(_)));
    assert_eq!(client.queue_status().pending, 0);
  }
}
