//! Cache strategy router: serves read requests from cache and network.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::classify::RouteRules;
use super::keys::RequestKey;
use super::storage::CacheStorage;
use super::traits::{AssetClass, CacheEntry, CacheNamespace, CacheResult, Strategy};
use crate::auth::AuthPipeline;
use crate::error::{SyncError, SyncResult};
use crate::net::{ApiRequest, ApiResponse};

/// Where one request's cache entry lives.
#[derive(Debug, Clone)]
struct Route {
  namespace: String,
  key: RequestKey,
  strategy: Strategy,
}

/// Outcome of activating a cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
  pub version: String,
  /// Namespaces of superseded versions that were deleted
  pub deleted: Vec<String>,
}

/// Routes read requests through one of four cache strategies.
///
/// Mutating requests and requests made before any version is activated go
/// straight to the pipeline without touching the cache.
pub struct CacheRouter {
  storage: Arc<dyn CacheStorage>,
  pipeline: AuthPipeline,
  rules: RouteRules,
  active: RwLock<Option<String>>,
  revalidations: Mutex<JoinSet<()>>,
}

impl CacheRouter {
  pub fn new(storage: Arc<dyn CacheStorage>, pipeline: AuthPipeline, rules: RouteRules) -> Self {
    let active = storage.active_version().unwrap_or_else(|e| {
      warn!(error = %e, "could not read active cache version, caching disabled until activation");
      None
    });

    Self {
      storage,
      pipeline,
      rules,
      active: RwLock::new(active),
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  pub fn rules(&self) -> &RouteRules {
    &self.rules
  }

  /// Version currently intercepting traffic, if any.
  pub fn active_version(&self) -> Option<String> {
    self
      .active
      .read()
      .map(|active| active.clone())
      .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
  }

  /// Precache the manifest into fresh namespaces for `version`.
  ///
  /// Old namespaces are left alone; they keep serving until [`activate`](Self::activate).
  /// If any manifest entry fails to download, the new version's namespaces are discarded.
  pub async fn install(&self, version: &str) -> SyncResult<usize> {
    info!(version, manifest = self.rules.precache().len(), "installing cache version");

    for namespace in CacheNamespace::all_for(version) {
      if let Err(e) = self.storage.create_namespace(&namespace) {
        warn!(namespace = %namespace.name, error = %e, "could not create cache namespace");
        self.abandon_install(version);
        return Err(SyncError::storage(e));
      }
    }

    let static_ns = CacheNamespace::new(AssetClass::Static, version);
    let mut stored = 0;
    for url in self.rules.precache() {
      let request = ApiRequest::get(url.clone());
      let response = match self.pipeline.send(&request).await {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
          self.abandon_install(version);
          return Err(SyncError::InvalidRequest(format!(
            "precache of {} returned HTTP {}",
            url, response.status
          )));
        }
        Err(e) => {
          warn!(%url, error = %e, "precache failed");
          self.abandon_install(version);
          return Err(e);
        }
      };

      let entry = CacheEntry::from_response(
        RequestKey::for_request(&request),
        url,
        Strategy::CacheFirst,
        &response,
      );
      if let Err(e) = self.storage.put_entry(&static_ns.name, &entry) {
        warn!(%url, error = %e, "could not store precached response");
        self.abandon_install(version);
        return Err(SyncError::storage(e));
      }
      stored += 1;
    }

    info!(version, stored, "cache version installed");
    Ok(stored)
  }

  fn abandon_install(&self, version: &str) {
    if self.active_version().as_deref() == Some(version) {
      return;
    }
    for namespace in CacheNamespace::all_for(version) {
      if let Err(e) = self.storage.delete_namespace(&namespace.name) {
        warn!(namespace = %namespace.name, error = %e, "failed to discard partial install");
      }
    }
  }

  /// Make `version` current: delete every other version's namespaces, then start serving.
  pub fn activate(&self, version: &str) -> Activation {
    for namespace in CacheNamespace::all_for(version) {
      if let Err(e) = self.storage.create_namespace(&namespace) {
        warn!(namespace = %namespace.name, error = %e, "failed to create namespace");
      }
    }

    let existing = self.storage.list_namespaces().unwrap_or_else(|e| {
      warn!(error = %e, "failed to list cache namespaces, skipping cleanup");
      Vec::new()
    });

    let mut deleted = Vec::new();
    for namespace in existing.into_iter().filter(|ns| ns.version != version) {
      match self.storage.delete_namespace(&namespace.name) {
        Ok(()) => deleted.push(namespace.name),
        Err(e) => warn!(namespace = %namespace.name, error = %e, "failed to delete stale namespace"),
      }
    }

    if let Err(e) = self.storage.set_active_version(version) {
      warn!(version, error = %e, "failed to persist active cache version");
    }
    match self.active.write() {
      Ok(mut active) => *active = Some(version.to_string()),
      Err(poisoned) => *poisoned.into_inner() = Some(version.to_string()),
    }

    info!(version, deleted = deleted.len(), "cache version activated");
    Activation {
      version: version.to_string(),
      deleted,
    }
  }

  /// Serve a request according to its classification.
  pub async fn fetch(&self, request: &ApiRequest) -> SyncResult<CacheResult<ApiResponse>> {
    if !request.is_idempotent() {
      return self.pipeline.send(request).await.map(CacheResult::bypass);
    }
    let Some(version) = self.active_version() else {
      return self.pipeline.send(request).await.map(CacheResult::bypass);
    };

    let strategy = self.rules.classify(request);
    let route = Route {
      namespace: CacheNamespace::new(strategy.asset_class(), &version).name,
      key: RequestKey::for_request(request),
      strategy,
    };

    match strategy {
      Strategy::CacheFirst => self.cache_first(request, &route).await,
      Strategy::NetworkFirst => self.network_first(request, &route).await,
      Strategy::CacheFirstWithRefresh | Strategy::StaleWhileRevalidate => {
        self.serve_and_revalidate(request, &route).await
      }
    }
  }

  /// Wait for every outstanding background revalidation to finish.
  pub async fn settle(&self) {
    let mut tasks = std::mem::take(&mut *self.lock_tasks());
    while tasks.join_next().await.is_some() {}
  }

  async fn cache_first(
    &self,
    request: &ApiRequest,
    route: &Route,
  ) -> SyncResult<CacheResult<ApiResponse>> {
    if let Some(entry) = self.lookup(route) {
      return Ok(CacheResult::from_cache(entry.to_response(), entry.stored_at));
    }

    let response = self.pipeline.send(request).await?;
    store_response(self.storage.as_ref(), route, &request.url, &response);
    Ok(CacheResult::from_network(response))
  }

  async fn network_first(
    &self,
    request: &ApiRequest,
    route: &Route,
  ) -> SyncResult<CacheResult<ApiResponse>> {
    match self.pipeline.send(request).await {
      Ok(response) => {
        store_response(self.storage.as_ref(), route, &request.url, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(SyncError::NetworkUnavailable(reason)) => match self.lookup(route) {
        Some(entry) => {
          info!(url = %request.url, %reason, "network unavailable, serving cached response");
          Ok(CacheResult::offline(entry.to_response(), entry.stored_at))
        }
        None => Err(SyncError::NetworkUnavailable(reason)),
      },
      Err(e) => Err(e),
    }
  }

  /// Shared by cache-first-with-refresh (images) and stale-while-revalidate;
  /// they differ only in the namespace their entries land in.
  async fn serve_and_revalidate(
    &self,
    request: &ApiRequest,
    route: &Route,
  ) -> SyncResult<CacheResult<ApiResponse>> {
    if let Some(entry) = self.lookup(route) {
      self.revalidate_in_background(request, route);
      return Ok(CacheResult::from_cache(entry.to_response(), entry.stored_at));
    }

    let response = self.pipeline.send(request).await?;
    store_response(self.storage.as_ref(), route, &request.url, &response);
    Ok(CacheResult::from_network(response))
  }

  fn revalidate_in_background(&self, request: &ApiRequest, route: &Route) {
    let storage = Arc::clone(&self.storage);
    let pipeline = self.pipeline.clone();
    let request = request.clone();
    let route = route.clone();

    let mut tasks = self.lock_tasks();
    // Reap finished revalidations so the set doesn't grow without bound
    while tasks.try_join_next().is_some() {}
    tasks.spawn(async move {
      match pipeline.send(&request).await {
        Ok(response) => store_response(storage.as_ref(), &route, &request.url, &response),
        Err(e) => debug!(url = %request.url, error = %e, "background revalidation failed"),
      }
    });
  }

  fn lookup(&self, route: &Route) -> Option<CacheEntry> {
    match self.storage.get_entry(&route.namespace, &route.key) {
      Ok(Some(entry)) => {
        debug!(key = %route.key, namespace = %route.namespace, "cache hit");
        Some(entry)
      }
      Ok(None) => {
        debug!(key = %route.key, namespace = %route.namespace, "cache miss");
        None
      }
      Err(e) => {
        warn!(namespace = %route.namespace, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
    self
      .revalidations
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Store a successful response; anything else leaves the previous entry in place.
fn store_response(storage: &dyn CacheStorage, route: &Route, url: &Url, response: &ApiResponse) {
  if !response.is_success() {
    return;
  }
  let entry = CacheEntry::from_response(route.key.clone(), url, route.strategy, response);
  if let Err(e) = storage.put_entry(&route.namespace, &entry) {
    warn!(namespace = %route.namespace, error = %e, "cache write failed, continuing uncached");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{NoopStorage, SqliteStorage};
  use crate::db::Database;
  use crate::test_support::{base_url, MockAuth, MockTransport};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )))
  }

  fn router_on(storage: Arc<dyn CacheStorage>, transport: Arc<MockTransport>) -> CacheRouter {
    let pipeline = AuthPipeline::new(transport, MockAuth::rejecting(), None);
    let rules = RouteRules::new(
      vec![base_url().join("/index.html").unwrap()],
      vec!["/api/vehicles".into()],
    );
    CacheRouter::new(storage, pipeline, rules)
  }

  fn active_router(transport: Arc<MockTransport>) -> CacheRouter {
    let router = router_on(storage(), transport);
    router.activate("v1");
    router
  }

  /// Returns "<path>#<n>" where n counts calls, so every fetch is distinguishable.
  fn counting_backend() -> Arc<MockTransport> {
    let counter = Arc::new(AtomicUsize::new(0));
    MockTransport::new(move |req| {
      let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
      async move { Ok(ApiResponse::new(200, format!("{}#{}", req.url.path(), n))) }
    })
  }

  fn get(path: &str) -> ApiRequest {
    ApiRequest::get(base_url().join(path).unwrap())
  }

  fn text(result: &CacheResult<ApiResponse>) -> String {
    String::from_utf8(result.data.body.clone()).unwrap()
  }

  #[tokio::test]
  async fn test_inactive_router_bypasses_cache() {
    let transport = counting_backend();
    let router = router_on(storage(), transport.clone());

    let first = router.fetch(&get("/index.html")).await.unwrap();
    let second = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Bypass);
    assert_eq!(text(&second), "/index.html#2");
  }

  #[tokio::test]
  async fn test_mutating_requests_bypass_cache() {
    let transport = counting_backend();
    let router = active_router(transport.clone());

    let post = ApiRequest::post(base_url().join("/api/vehicles").unwrap());
    router.fetch(&post).await.unwrap();
    let result = router.fetch(&post).await.unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Bypass);
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_cache_first_never_refetches_within_version() {
    let transport = counting_backend();
    let router = active_router(transport.clone());

    let first = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);
    for _ in 0..3 {
      let again = router.fetch(&get("/index.html")).await.unwrap();
      assert_eq!(again.source, crate::cache::CacheSource::Cache);
      assert_eq!(text(&again), "/index.html#1");
    }
    router.settle().await;
    assert_eq!(transport.calls_to("/index.html"), 1);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cached_without_waiting() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = {
      let calls = Arc::clone(&calls);
      MockTransport::new(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n > 0 {
            // Every revalidation hangs far longer than the test runs
            tokio::time::sleep(Duration::from_secs(3600)).await;
          }
          Ok(ApiResponse::new(200, "cached-body"))
        }
      })
    };
    let router = active_router(transport);

    router.fetch(&get("/manifest.json")).await.unwrap();
    let served = tokio::time::timeout(
      Duration::from_millis(200),
      router.fetch(&get("/manifest.json")),
    )
    .await
    .expect("stale-while-revalidate blocked on the network")
    .unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::Cache);
    assert_eq!(served.data.body, b"cached-body");
    // the revalidation was issued
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_background_refresh_overwrites_image_entry() {
    let transport = counting_backend();
    let router = active_router(transport.clone());

    let miss = router.fetch(&get("/photos/front.jpg")).await.unwrap();
    assert_eq!(miss.source, crate::cache::CacheSource::Network);
    assert_eq!(text(&miss), "/photos/front.jpg#1");

    let hit = router.fetch(&get("/photos/front.jpg")).await.unwrap();
    assert_eq!(hit.source, crate::cache::CacheSource::Cache);
    assert_eq!(text(&hit), "/photos/front.jpg#1");

    router.settle().await;
    let refreshed = router.fetch(&get("/photos/front.jpg")).await.unwrap();
    assert_eq!(text(&refreshed), "/photos/front.jpg#2");
    router.settle().await;
    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_entry() {
    let online = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let transport = {
      let online = Arc::clone(&online);
      MockTransport::new(move |_| {
        let online = online.load(Ordering::SeqCst);
        async move {
          if online {
            Ok(ApiResponse::new(200, "v1"))
          } else {
            Err(SyncError::NetworkUnavailable("offline".into()))
          }
        }
      })
    };
    let router = active_router(transport);

    router.fetch(&get("/about")).await.unwrap();
    online.store(false, Ordering::SeqCst);
    let served = router.fetch(&get("/about")).await.unwrap();
    router.settle().await;
    assert_eq!(served.data.body, b"v1");
    assert_eq!(router.fetch(&get("/about")).await.unwrap().data.body, b"v1");
  }

  #[tokio::test]
  async fn test_network_first_prefers_live_and_falls_back_offline() {
    let online = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let counter = Arc::new(AtomicUsize::new(0));
    let transport = {
      let online = Arc::clone(&online);
      MockTransport::new(move |_| {
        let online = online.load(Ordering::SeqCst);
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          if online {
            Ok(ApiResponse::new(200, format!("live-{}", n)))
          } else {
            Err(SyncError::NetworkUnavailable("offline".into()))
          }
        }
      })
    };
    let router = active_router(transport);

    let first = router.fetch(&get("/api/vehicles/42")).await.unwrap();
    let second = router.fetch(&get("/api/vehicles/42")).await.unwrap();
    assert_eq!(second.source, crate::cache::CacheSource::Network);
    assert_eq!(first.data.body, b"live-1");
    assert_eq!(second.data.body, b"live-2");

    online.store(false, Ordering::SeqCst);
    let offline = router.fetch(&get("/api/vehicles/42")).await.unwrap();
    assert_eq!(offline.source, crate::cache::CacheSource::Offline);
    assert_eq!(offline.data.body, b"live-2");
    assert!(offline.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_without_cache_surfaces_error() {
    let router = active_router(MockTransport::offline());
    let err = router.fetch(&get("/api/vehicles/42")).await.unwrap_err();
    assert!(matches!(err, SyncError::NetworkUnavailable(_)));
  }

  #[tokio::test]
  async fn test_error_statuses_are_not_cached() {
    let counter = Arc::new(AtomicUsize::new(0));
    let transport = MockTransport::new(move |_| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok(ApiResponse::new(503, "busy"))
        } else {
          Ok(ApiResponse::new(200, "ok"))
        }
      }
    });
    let router = active_router(transport.clone());

    let first = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(first.data.status, 503);
    let second = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(second.data.body, b"ok");
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_activating_v2_deletes_v1_and_keeps_v2_entries() {
    let release = Arc::new(std::sync::Mutex::new("v1-index"));
    let transport = {
      let release = Arc::clone(&release);
      MockTransport::new(move |_| {
        let body = *release.lock().unwrap();
        async move { Ok(ApiResponse::new(200, body)) }
      })
    };
    let storage = storage();
    let router = router_on(storage.clone(), transport.clone());

    assert_eq!(router.install("v1").await.unwrap(), 1);
    router.activate("v1");

    *release.lock().unwrap() = "v2-index";
    router.install("v2").await.unwrap();
    // v1 keeps serving until v2 is activated
    assert_eq!(
      router.fetch(&get("/index.html")).await.unwrap().data.body,
      b"v1-index"
    );

    let activation = router.activate("v2");
    let mut deleted = activation.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["api-v1", "images-v1", "misc-v1", "static-v1"]);
    assert!(storage
      .list_namespaces()
      .unwrap()
      .iter()
      .all(|ns| ns.version == "v2"));

    let calls_before = transport.call_count();
    let served = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(served.source, crate::cache::CacheSource::Cache);
    assert_eq!(served.data.body, b"v2-index");
    assert_eq!(transport.call_count(), calls_before);
  }

  #[tokio::test]
  async fn test_failed_install_discards_new_version() {
    let storage = storage();
    let router = router_on(storage.clone(), MockTransport::offline());
    router.activate("v1");

    assert!(router.install("v2").await.is_err());
    assert!(storage
      .list_namespaces()
      .unwrap()
      .iter()
      .all(|ns| ns.version == "v1"));
    assert_eq!(router.active_version().as_deref(), Some("v1"));
  }

  /// SQLite storage whose entry writes always fail.
  struct FailingWrites(Arc<SqliteStorage>);

  impl CacheStorage for FailingWrites {
    fn create_namespace(&self, namespace: &CacheNamespace) -> color_eyre::Result<()> {
      self.0.create_namespace(namespace)
    }

    fn list_namespaces(&self) -> color_eyre::Result<Vec<CacheNamespace>> {
      self.0.list_namespaces()
    }

    fn delete_namespace(&self, name: &str) -> color_eyre::Result<()> {
      self.0.delete_namespace(name)
    }

    fn get_entry(&self, namespace: &str, key: &RequestKey) -> color_eyre::Result<Option<CacheEntry>> {
      self.0.get_entry(namespace, key)
    }

    fn put_entry(&self, _namespace: &str, _entry: &CacheEntry) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("disk full"))
    }

    fn active_version(&self) -> color_eyre::Result<Option<String>> {
      self.0.active_version()
    }

    fn set_active_version(&self, version: &str) -> color_eyre::Result<()> {
      self.0.set_active_version(version)
    }
  }

  #[tokio::test]
  async fn test_install_write_failure_discards_new_version() {
    let inner = storage();
    let router = router_on(Arc::new(FailingWrites(inner.clone())), counting_backend());
    router.activate("v1");

    let err = router.install("v2").await.unwrap_err();
    assert!(matches!(err, SyncError::StorageFailure(_)));
    assert!(inner
      .list_namespaces()
      .unwrap()
      .iter()
      .all(|ns| ns.version != "v2"));
    assert_eq!(router.active_version().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_active_version_survives_restart() {
    let storage = storage();
    let transport = counting_backend();
    router_on(storage.clone(), transport.clone()).activate("v3");

    let restarted = router_on(storage, transport);
    assert_eq!(restarted.active_version().as_deref(), Some("v3"));
  }

  #[tokio::test]
  async fn test_degraded_storage_still_serves_network() {
    let transport = counting_backend();
    let router = router_on(Arc::new(NoopStorage), transport.clone());
    router.activate("v1");

    let first = router.fetch(&get("/index.html")).await.unwrap();
    let second = router.fetch(&get("/index.html")).await.unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);
    assert_eq!(text(&second), "/index.html#2");
  }
}
