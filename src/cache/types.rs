//! Core types for the response cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::{Request, ResponseSnapshot};

/// Identity of a cached request: method plus URL without fragment.
///
/// Only GET identities can be built, so nothing else can reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  url: Url,
}

impl RequestIdentity {
  /// Identity for a request, or `None` for anything but GET.
  pub fn for_request(request: &Request) -> Option<Self> {
    (request.method == Method::GET).then(|| Self::get(&request.url))
  }

  /// Identity of a GET for `url`.
  pub fn get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { url }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 of the identity, used as the stable storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "GET {}", self.url)
  }
}

/// A versioned cache namespace, named `{prefix}-v{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheNamespace {
  pub name: String,
  pub version: u32,
}

impl CacheNamespace {
  pub fn new(prefix: &str, version: u32) -> Self {
    Self {
      name: format!("{}-v{}", prefix, version),
      version,
    }
  }

  /// Recover a namespace from a stored name. Names without a `-v{n}`
  /// suffix get version 0.
  pub fn from_name(name: &str) -> Self {
    let version = name
      .rsplit_once("-v")
      .and_then(|(_, v)| v.parse().ok())
      .unwrap_or(0);
    Self {
      name: name.to_string(),
      version,
    }
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// A snapshot read back from the store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: ResponseSnapshot,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Result from a strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached copy served while a refresh runs in the background.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
    }
  }

  /// Cached copy served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Offline fallback page; `cached_at` is `None` for the synthetic page.
  pub fn offline_page(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::OfflinePage,
      cached_at,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, refresh in progress
  CacheStale,
  /// Network unavailable, serving the cached copy of the same request
  Offline,
  /// Network unavailable and nothing cached, serving the offline page
  OfflinePage,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::CacheStale => "cache (revalidating)",
      Self::Offline => "cache (offline)",
      Self::OfflinePage => "offline page",
    };
    f.write_str(s)
  }
}
