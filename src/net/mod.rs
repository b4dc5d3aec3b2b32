//! Network access behind the interception boundary.
//!
//! Strategies and the lifecycle only see the [`Network`] trait; the binary
//! plugs in [`HttpNetwork`], tests plug in a scripted network.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

use std::future::Future;
use thiserror::Error;

pub use client::HttpNetwork;
pub use types::{Request, ResponseSnapshot};

/// A network call that never produced a response.
///
/// HTTP error statuses are not network errors; they come back as a
/// [`ResponseSnapshot`] like any other response.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("could not reach {url}")]
  Unreachable {
    url: String,
    #[source]
    source: Option<reqwest::Error>,
  },

  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("failed to build HTTP client: {0}")]
  Client(#[source] reqwest::Error),
}

/// Something that can perform a request and buffer its response.
pub trait Network: Send + Sync + 'static {
  fn fetch(
    &self,
    request: &Request,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send;
}
