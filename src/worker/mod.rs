//! The worker that sits at the interception boundary.
//!
//! One [`ServiceWorker`] exists per deployed version. It reacts to three
//! events: install (prime the cache), activate (retire older namespaces and
//! claim clients) and intercepted requests (classify, then run a strategy).
//! [`Registration`] owns the workers and decides which one gets requests.

pub mod classify;
pub mod clients;
pub mod lifecycle;
mod registration;

use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheNamespace, CacheResult, CacheStorage, RequestIdentity};
use crate::error::WorkerError;
use crate::net::{Network, Request, ResponseSnapshot};

use classify::{classify, RequestClassification};
use clients::Clients;
use lifecycle::{transition, LifecycleEvent};

pub use lifecycle::WorkerState;
pub use registration::{InstallOutcome, Registration, RegistrationStatus};

/// Deploy-time constants for one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
  pub namespace: CacheNamespace,
  /// Assets that must be cached before the version can activate
  pub core_assets: Vec<Url>,
  /// Paths under this prefix are static assets
  pub static_prefix: String,
  /// Page served to navigations when offline
  pub offline_url: Url,
  /// Take over from the active version as soon as install completes
  pub skip_waiting: bool,
}

impl WorkerSettings {
  /// The same settings bound to another namespace.
  pub fn for_namespace(&self, namespace: CacheNamespace) -> Self {
    Self {
      namespace,
      ..self.clone()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub namespace: String,
  pub primed: usize,
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub namespace: String,
  /// Older namespaces that were removed
  pub deleted: Vec<String>,
  /// Older namespaces that could not be removed
  pub retained: Vec<String>,
  /// Set when older namespaces could not even be listed; any of them may
  /// still be stored
  pub cleanup_error: Option<String>,
  /// Clients that switched to this version
  pub claimed: usize,
}

impl ActivationReport {
  /// Whether every older namespace is known to be gone.
  pub fn is_clean(&self) -> bool {
    self.retained.is_empty() && self.cleanup_error.is_none()
  }
}

/// What the worker did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// The worker answered (or failed to answer) the request.
  Responded(Result<CacheResult<ResponseSnapshot>, WorkerError>),
  /// Not claimed; the caller performs the request natively.
  Passthrough,
}

/// A single worker version.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  settings: WorkerSettings,
  offline_page: RequestIdentity,
  cache: CacheLayer<S, N>,
  clients: Arc<Clients>,
  state: RwLock<WorkerState>,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// A freshly registered worker, about to install.
  pub fn new(settings: WorkerSettings, cache: CacheLayer<S, N>, clients: Arc<Clients>) -> Self {
    Self::with_state(settings, cache, clients, WorkerState::Installing)
  }

  /// A worker recovered from persisted state.
  pub(crate) fn with_state(
    settings: WorkerSettings,
    cache: CacheLayer<S, N>,
    clients: Arc<Clients>,
    state: WorkerState,
  ) -> Self {
    Self {
      offline_page: RequestIdentity::get(&settings.offline_url),
      settings,
      cache,
      clients,
      state: RwLock::new(state),
    }
  }

  pub fn namespace(&self) -> &CacheNamespace {
    &self.settings.namespace
  }

  pub async fn state(&self) -> WorkerState {
    *self.state.read().await
  }

  /// Install: prime the namespace with every core asset.
  ///
  /// All assets are fetched first and must answer 2xx; only then is the
  /// namespace created and filled in one batch. On failure nothing is
  /// written and the worker becomes redundant.
  pub async fn on_install(&self) -> Result<InstallReport, WorkerError> {
    let mut state = self.state.write().await;
    if *state != WorkerState::Installing {
      return Err(WorkerError::InvalidTransition {
        state: *state,
        action: "install",
      });
    }

    let namespace = &self.settings.namespace.name;
    info!(%namespace, assets = self.settings.core_assets.len(), "installing");

    match self.prime().await {
      Ok(primed) => {
        *state = transition(*state, LifecycleEvent::Installed)?;
        info!(%namespace, primed, "installed");
        Ok(InstallReport {
          namespace: namespace.clone(),
          primed,
          skip_waiting: self.settings.skip_waiting,
        })
      }
      Err(reason) => {
        *state = transition(*state, LifecycleEvent::InstallFailed)?;
        warn!(%namespace, %reason, "install failed");
        Err(WorkerError::CachePrimingFailed {
          namespace: namespace.clone(),
          reason,
        })
      }
    }
  }

  async fn prime(&self) -> Result<usize, String> {
    let network = self.cache.network();
    let fetches = self.settings.core_assets.iter().map(|url| async move {
      let response = network
        .fetch(&Request::get(url.clone()))
        .await
        .map_err(|e| e.to_string())?;
      if !response.is_ok() {
        return Err(format!("{} returned {}", url, response.status));
      }
      Ok::<_, String>((RequestIdentity::get(url), response))
    });

    let entries = try_join_all(fetches).await?;
    self
      .cache
      .storage()
      .put_all(&self.settings.namespace.name, &entries)
      .map_err(|e| e.to_string())?;

    Ok(entries.len())
  }

  /// Activate: make this namespace current, then delete every other one and
  /// claim all open clients.
  ///
  /// If the namespace cannot be made current nothing else happens and the
  /// worker goes back to waiting.
  pub async fn on_activate(&self) -> Result<ActivationReport, WorkerError> {
    let mut state = self.state.write().await;
    *state = transition(*state, LifecycleEvent::Activate)?;

    let namespace = self.settings.namespace.name.as_str();
    let storage = self.cache.storage();
    info!(%namespace, "activating");

    if let Err(e) = storage.set_current(namespace) {
      *state = transition(*state, LifecycleEvent::ActivateFailed)?;
      warn!(%namespace, error = %e, "activation failed");
      return Err(e.into());
    }

    // Only now that the new namespace is current may old ones go
    let mut deleted = Vec::new();
    let mut retained = Vec::new();
    let mut cleanup_error = None;
    match storage.list_namespaces() {
      Ok(existing) => {
        for name in existing.into_iter().filter(|name| name != namespace) {
          match storage.delete_namespace(&name) {
            Ok(_) => {
              debug!(namespace = %name, "deleted old namespace");
              deleted.push(name);
            }
            Err(e) => {
              warn!(namespace = %name, error = %e, "could not delete old namespace");
              retained.push(name);
            }
          }
        }
      }
      Err(e) => {
        warn!(%namespace, error = %e, "could not list old namespaces");
        cleanup_error = Some(e.to_string());
      }
    }

    let claimed = self.clients.claim(namespace);
    *state = transition(*state, LifecycleEvent::Activated)?;
    info!(%namespace, deleted = deleted.len(), claimed, "active");

    Ok(ActivationReport {
      namespace: namespace.to_string(),
      deleted,
      retained,
      cleanup_error,
      claimed,
    })
  }

  /// Handle an intercepted request.
  pub async fn on_intercepted_request(&self, request: Request) -> FetchOutcome {
    if !self.state().await.can_intercept() {
      return FetchOutcome::Passthrough;
    }

    let classification = classify(&request, &self.settings.static_prefix);
    let key = match (classification, RequestIdentity::for_request(&request)) {
      (RequestClassification::Passthrough, _) | (_, None) => {
        debug!(method = %request.method, url = %request.url, "passthrough");
        return FetchOutcome::Passthrough;
      }
      (_, Some(key)) => key,
    };

    let namespace = self.settings.namespace.name.as_str();
    debug!(%key, ?classification, "intercepted");

    let result = match classification {
      RequestClassification::Document => {
        self
          .cache
          .network_first(namespace, &key, &request, &self.offline_page)
          .await
      }
      _ => {
        self
          .cache
          .stale_while_revalidate(namespace, &key, &request)
          .await
      }
    };

    FetchOutcome::Responded(result)
  }

  /// Replaced by a newer version or abandoned mid-install.
  pub async fn supersede(&self) {
    let mut state = self.state.write().await;
    let from = *state;
    if let Ok(next) = transition(from, LifecycleEvent::Superseded) {
      debug!(namespace = %self.settings.namespace, %from, "redundant");
      *state = next;
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::{CacheSource, CachedResponse, SqliteStorage, StorageError};
  use std::collections::BTreeSet;
  use crate::net::mock::ScriptedNetwork;
  use reqwest::header::{HeaderValue, ACCEPT};
  use reqwest::Method;
  use std::time::Duration;

  pub const ORIGIN: &str = "https://nexo.test";

  pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  pub fn settings(version: u32, assets: &[&str]) -> WorkerSettings {
    WorkerSettings {
      namespace: CacheNamespace::new("nexo-static", version),
      core_assets: assets.iter().map(|p| url(p)).collect(),
      static_prefix: "/static/".to_string(),
      offline_url: url("/offline/"),
      skip_waiting: true,
    }
  }

  /// Routes every core asset of the default manifest.
  pub fn online_network() -> Arc<ScriptedNetwork> {
    let network = ScriptedNetwork::new();
    network.route(&format!("{ORIGIN}/"), 200, "home");
    network.route(&format!("{ORIGIN}/offline/"), 200, "offline page");
    network.route(&format!("{ORIGIN}/static/css/theme.css"), 200, "theme v1");
    Arc::new(network)
  }

  pub const MANIFEST: &[&str] = &["/", "/offline/", "/static/css/theme.css"];

  fn worker(
    network: &Arc<ScriptedNetwork>,
    settings: WorkerSettings,
  ) -> (ServiceWorker<SqliteStorage, ScriptedNetwork>, Arc<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let cache = CacheLayer::new(Arc::clone(&storage), Arc::clone(network));
    (ServiceWorker::new(settings, cache, Arc::new(Clients::new())), storage)
  }

  async fn active_worker(
    network: &Arc<ScriptedNetwork>,
  ) -> (ServiceWorker<SqliteStorage, ScriptedNetwork>, Arc<SqliteStorage>) {
    let (worker, storage) = worker(network, settings(3, MANIFEST));
    worker.on_install().await.unwrap();
    worker.on_activate().await.unwrap();
    (worker, storage)
  }

  fn body(outcome: FetchOutcome) -> (CacheSource, Vec<u8>) {
    match outcome {
      FetchOutcome::Responded(Ok(result)) => (result.source, result.data.body),
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_install_primes_every_manifest_asset() {
    let network = online_network();
    let (worker, storage) = worker(&network, settings(3, MANIFEST));

    let report = worker.on_install().await.unwrap();

    assert_eq!(report.primed, 3);
    assert_eq!(worker.state().await, WorkerState::Waiting);
    for path in MANIFEST {
      let cached = storage
        .get("nexo-static-v3", &RequestIdentity::get(&url(path)))
        .unwrap();
      assert!(cached.is_some(), "{} not primed", path);
    }
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = online_network();
    let (worker, storage) = worker(&network, settings(3, &["/", "/static/js/missing.js"]));

    let err = worker.on_install().await.unwrap_err();

    assert!(matches!(err, WorkerError::CachePrimingFailed { .. }));
    assert_eq!(worker.state().await, WorkerState::Redundant);
    assert!(storage.list_namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_fails_offline() {
    let network = online_network();
    network.set_online(false);
    let (worker, storage) = worker(&network, settings(3, MANIFEST));

    assert!(worker.on_install().await.is_err());
    assert!(storage.list_namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_twice_is_rejected() {
    let network = online_network();
    let (worker, _) = worker(&network, settings(3, MANIFEST));
    worker.on_install().await.unwrap();

    let err = worker.on_install().await.unwrap_err();
    assert!(matches!(err, WorkerError::InvalidTransition { .. }));
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let network = online_network();
    let (worker, _) = worker(&network, settings(3, MANIFEST));

    assert!(worker.on_activate().await.is_err());
    assert_eq!(worker.state().await, WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_activate_deletes_other_namespaces() {
    let network = online_network();
    let (worker, storage) = worker(&network, settings(3, MANIFEST));
    storage.open("nexo-static-v2").unwrap();
    storage.open("nexo-pages-v1").unwrap();

    worker.on_install().await.unwrap();
    let report = worker.on_activate().await.unwrap();

    assert_eq!(report.deleted, vec!["nexo-pages-v1", "nexo-static-v2"]);
    assert!(report.is_clean());
    assert_eq!(
      storage.list_namespaces().unwrap().into_iter().collect::<Vec<_>>(),
      vec!["nexo-static-v3".to_string()]
    );
    assert_eq!(storage.current().unwrap().as_deref(), Some("nexo-static-v3"));
    assert_eq!(worker.state().await, WorkerState::Active);
  }

  /// Store whose namespace listing always fails.
  struct UnlistableStorage(SqliteStorage);

  impl CacheStorage for UnlistableStorage {
    fn open(&self, namespace: &str) -> Result<(), StorageError> {
      self.0.open(namespace)
    }

    fn get(
      &self,
      namespace: &str,
      key: &RequestIdentity,
    ) -> Result<Option<CachedResponse>, StorageError> {
      self.0.get(namespace, key)
    }

    fn put(
      &self,
      namespace: &str,
      key: &RequestIdentity,
      response: &ResponseSnapshot,
    ) -> Result<(), StorageError> {
      self.0.put(namespace, key, response)
    }

    fn put_all(
      &self,
      namespace: &str,
      entries: &[(RequestIdentity, ResponseSnapshot)],
    ) -> Result<(), StorageError> {
      self.0.put_all(namespace, entries)
    }

    fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError> {
      self.0.delete_namespace(namespace)
    }

    fn list_namespaces(&self) -> Result<BTreeSet<String>, StorageError> {
      Err(StorageError::Poisoned)
    }

    fn current(&self) -> Result<Option<String>, StorageError> {
      self.0.current()
    }

    fn set_current(&self, namespace: &str) -> Result<(), StorageError> {
      self.0.set_current(namespace)
    }

    fn entry_count(&self, namespace: &str) -> Result<usize, StorageError> {
      self.0.entry_count(namespace)
    }
  }

  #[tokio::test]
  async fn test_activate_reports_namespaces_it_could_not_list() {
    let network = online_network();
    let storage = Arc::new(UnlistableStorage(SqliteStorage::open_in_memory().unwrap()));
    storage.open("nexo-static-v2").unwrap();
    let cache = CacheLayer::new(Arc::clone(&storage), Arc::clone(&network));
    let worker = ServiceWorker::new(settings(3, MANIFEST), cache, Arc::new(Clients::new()));

    worker.on_install().await.unwrap();
    let report = worker.on_activate().await.unwrap();

    assert!(!report.is_clean());
    assert!(report.cleanup_error.is_some());
    assert!(report.deleted.is_empty());
    assert_eq!(storage.current().unwrap().as_deref(), Some("nexo-static-v3"));
    assert_eq!(storage.0.list_namespaces().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_waiting_worker_does_not_intercept() {
    let network = online_network();
    let (worker, _) = worker(&network, settings(3, MANIFEST));
    worker.on_install().await.unwrap();

    let outcome = worker
      .on_intercepted_request(Request::get(url("/static/css/theme.css")))
      .await;
    assert!(matches!(outcome, FetchOutcome::Passthrough));
  }

  #[tokio::test]
  async fn test_document_from_network_is_cached() {
    let network = online_network();
    network.route(&format!("{ORIGIN}/article"), 200, "article");
    let (worker, storage) = active_worker(&network).await;

    let request = Request::get(url("/article")).navigation();
    let (source, data) = body(worker.on_intercepted_request(request).await);

    assert_eq!(source, CacheSource::Network);
    assert_eq!(data, b"article");
    let cached = storage
      .get("nexo-static-v3", &RequestIdentity::get(&url("/article")))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"article");
  }

  #[tokio::test]
  async fn test_document_offline_uses_cached_copy() {
    let network = online_network();
    network.route(&format!("{ORIGIN}/article"), 200, "article");
    let (worker, _) = active_worker(&network).await;
    body(worker.on_intercepted_request(Request::get(url("/article")).navigation()).await);

    network.set_online(false);
    let (source, data) =
      body(worker.on_intercepted_request(Request::get(url("/article")).navigation()).await);

    assert_eq!(source, CacheSource::Offline);
    assert_eq!(data, b"article");
  }

  #[tokio::test]
  async fn test_document_offline_without_cache_gets_offline_page() {
    let network = online_network();
    let (worker, _) = active_worker(&network).await;
    network.set_online(false);

    let (source, data) =
      body(worker.on_intercepted_request(Request::get(url("/new-page")).navigation()).await);

    assert_eq!(source, CacheSource::OfflinePage);
    assert_eq!(data, b"offline page");
  }

  #[tokio::test]
  async fn test_static_asset_served_stale_then_refreshed() {
    let network = online_network();
    let (worker, storage) = active_worker(&network).await;
    network.route(&format!("{ORIGIN}/static/css/theme.css"), 200, "theme v2");
    network.hold();

    let outcome = tokio::time::timeout(
      Duration::from_secs(1),
      worker.on_intercepted_request(Request::get(url("/static/css/theme.css"))),
    )
    .await
    .unwrap();
    let (source, data) = body(outcome);
    assert_eq!(source, CacheSource::CacheStale);
    assert_eq!(data, b"theme v1");

    network.release();
    let key = RequestIdentity::get(&url("/static/css/theme.css"));
    let mut refreshed = false;
    for _ in 0..200 {
      let cached = storage.get("nexo-static-v3", &key).unwrap().unwrap();
      if cached.response.body == b"theme v2" {
        refreshed = true;
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(refreshed);
  }

  #[tokio::test]
  async fn test_non_get_never_touches_cache_or_network() {
    let network = online_network();
    let (worker, storage) = active_worker(&network).await;
    let calls_before = network.calls().len();
    let entries_before = storage.entry_count("nexo-static-v3").unwrap();

    let request = Request::get(url("/static/css/theme.css"))
      .with_method(Method::POST)
      .with_header(ACCEPT, HeaderValue::from_static("text/html"));
    let outcome = worker.on_intercepted_request(request).await;

    assert!(matches!(outcome, FetchOutcome::Passthrough));
    assert_eq!(network.calls().len(), calls_before);
    assert_eq!(storage.entry_count("nexo-static-v3").unwrap(), entries_before);
  }

  #[tokio::test]
  async fn test_unclassified_get_passes_through() {
    let network = online_network();
    let (worker, _) = active_worker(&network).await;

    let outcome = worker
      .on_intercepted_request(Request::get(url("/api/news")))
      .await;
    assert!(matches!(outcome, FetchOutcome::Passthrough));
  }

  #[tokio::test]
  async fn test_supersede() {
    let network = online_network();
    let (worker, _) = active_worker(&network).await;
    worker.supersede().await;
    assert_eq!(worker.state().await, WorkerState::Redundant);
  }
}
