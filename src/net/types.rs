//! Request and response types that cross the interception boundary.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::worker::clients::ClientId;

/// How the client runtime issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation to a new document
  Navigate,
  /// Anything loaded by an existing document (scripts, styles, fetch calls)
  #[default]
  Subresource,
}

/// An outgoing request captured from the client.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub mode: RequestMode,
  /// Client that issued the request, if known
  pub client_id: Option<ClientId>,
}

impl Request {
  /// A plain GET subresource request with no headers.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      mode: RequestMode::Subresource,
      client_id: None,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Mark as a top-level navigation. Navigations always accept HTML.
  pub fn navigation(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    if !self.headers.contains_key(ACCEPT) {
      self.headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
      );
    }
    self
  }

  pub fn from_client(mut self, client_id: ClientId) -> Self {
    self.client_id = Some(client_id);
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Whether any `Accept` header lists `text/html`.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|value| value.to_str().ok())
      .any(|value| value.to_ascii_lowercase().contains("text/html"))
  }
}

/// A fully buffered response, as returned by the network or stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  /// Final URL of the response (after redirects)
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  /// Last-resort response for a navigation when neither the network, the
  /// cache nor the offline page can answer.
  pub fn offline(url: &Url) -> Self {
    Self {
      url: url.to_string(),
      status: 503,
      status_text: "Offline".to_string(),
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: b"Offline".to_vec(),
    }
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Partial responses are never written to the cache.
  pub fn is_cacheable(&self) -> bool {
    self.status != 206
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }
}
