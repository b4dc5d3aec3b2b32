//! Cache layer that orchestrates the caching strategies with network fetching.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::{CacheStorage, StorageError};
use super::types::{CacheResult, CachedResponse, RequestIdentity};
use crate::error::WorkerError;
use crate::net::{Network, Request, ResponseSnapshot};

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the interception boundary and the network,
/// providing the two response strategies with offline support. Storage and
/// network are shared, so clones are cheap and see the same cache.
/// Background refreshes are shared too; see [`CacheLayer::drain_refreshes`].
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  /// Create a new cache layer over the given storage and network.
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Network-first, for documents.
  ///
  /// 1. Fetch from network; on success write through and return it
  /// 2. On failure, return the cached copy of the same request
  /// 3. Failing that, navigations get the offline page (or a synthetic 503
  ///    if the page itself was never cached)
  /// 4. Anything else fails with `NetworkUnavailable`
  pub async fn network_first(
    &self,
    namespace: &str,
    key: &RequestIdentity,
    request: &Request,
    offline_page: &RequestIdentity,
  ) -> Result<CacheResult<ResponseSnapshot>, WorkerError> {
    let error = match self.network.fetch(request).await {
      Ok(fresh) => {
        self.write_through(namespace, key, &fresh);
        return Ok(CacheResult::from_network(fresh));
      }
      Err(e) => e,
    };
    debug!(%key, error = %error, "network failed, falling back to cache");

    if let Some(cached) = self.lookup(namespace, key) {
      return Ok(CacheResult::offline(cached.response, cached.cached_at));
    }

    if !request.is_navigation() {
      return Err(WorkerError::NetworkUnavailable {
        url: key.url().to_string(),
        source: error,
      });
    }

    match self.lookup(namespace, offline_page) {
      Some(page) => Ok(CacheResult::offline_page(page.response, Some(page.cached_at))),
      None => {
        warn!(%namespace, page = %offline_page, "offline page missing from cache");
        Ok(CacheResult::offline_page(
          ResponseSnapshot::offline(key.url()),
          None,
        ))
      }
    }
  }

  /// Stale-while-revalidate, for static assets.
  ///
  /// A refresh is always started. If a cached copy exists it is returned
  /// without waiting for the refresh; otherwise the refresh result is
  /// awaited and returned, or `ResourceUnavailable` if it failed too.
  pub async fn stale_while_revalidate(
    &self,
    namespace: &str,
    key: &RequestIdentity,
    request: &Request,
  ) -> Result<CacheResult<ResponseSnapshot>, WorkerError> {
    let cached = self.lookup(namespace, key);
    let refresh = self.spawn_revalidation(namespace, key, request);

    if let Some(cached) = cached {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match refresh.await {
      Ok(Some(fresh)) => Ok(CacheResult::from_network(fresh)),
      _ => Err(WorkerError::ResourceUnavailable {
        url: key.url().to_string(),
      }),
    }
  }

  /// Fetch and store in a background task. Dropping the receiver does not
  /// cancel the refresh; only [`CacheLayer::drain_refreshes`] giving up does.
  fn spawn_revalidation(
    &self,
    namespace: &str,
    key: &RequestIdentity,
    request: &Request,
  ) -> oneshot::Receiver<Option<ResponseSnapshot>> {
    let (done, refreshed) = oneshot::channel();
    let layer = self.clone();
    let namespace = namespace.to_string();
    let key = key.clone();
    let request = request.clone();

    let mut refreshes = self.refreshes();
    // Reap finished refreshes so the set only holds running ones
    while refreshes.try_join_next().is_some() {}

    refreshes.spawn(async move {
      let fresh = match layer.network.fetch(&request).await {
        Ok(fresh) => {
          layer.write_through(&namespace, &key, &fresh);
          Some(fresh)
        }
        Err(e) => {
          debug!(%key, error = %e, "revalidation failed, keeping cached copy");
          None
        }
      };
      let _ = done.send(fresh);
    });

    refreshed
  }

  /// Wait for running background refreshes, up to `timeout`.
  ///
  /// Must be awaited before the runtime shuts down, or pending refreshes
  /// are lost. Returns how many were still running when the wait gave up;
  /// those are aborted.
  pub async fn drain_refreshes(&self, timeout: Duration) -> usize {
    let mut pending = std::mem::take(&mut *self.refreshes());
    if pending.is_empty() {
      return 0;
    }

    debug!(pending = pending.len(), "waiting for background refreshes");
    let finished = tokio::time::timeout(timeout, async {
      while pending.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if finished {
      return 0;
    }
    let abandoned = pending.len();
    warn!(abandoned, "background refreshes did not finish in time");
    abandoned
  }

  fn refreshes(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.refreshes.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Cache read where a storage failure counts as a miss.
  fn lookup(&self, namespace: &str, key: &RequestIdentity) -> Option<CachedResponse> {
    self.storage.get(namespace, key).unwrap_or_else(|e| {
      warn!(%key, error = %e, "cache read failed");
      None
    })
  }

  /// Store a response. Failures are logged, the response is served anyway.
  fn write_through(&self, namespace: &str, key: &RequestIdentity, response: &ResponseSnapshot) {
    if !response.is_cacheable() {
      debug!(%key, status = response.status, "not caching partial response");
      return;
    }

    match self.storage.put(namespace, key, response) {
      Ok(()) => debug!(%key, %namespace, status = response.status, "cached"),
      Err(StorageError::UnknownNamespace(_)) => {
        debug!(%key, %namespace, "namespace retired, dropping write")
      }
      Err(e) => warn!(%key, %namespace, error = %e, "cache write failed"),
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}
