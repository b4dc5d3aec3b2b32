use reqwest::Method;

use crate::net::Request;

/// Which strategy, if any, handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClassification {
  /// Navigable HTML, served network-first
  Document,
  /// Under the static prefix, served stale-while-revalidate
  StaticAsset,
  /// Not intercepted; the client performs it natively
  Passthrough,
}

/// Classify a request. Rules are checked in order:
///
/// 1. Non-GET is never intercepted
/// 2. `Accept` includes `text/html` is a document
/// 3. Path under `static_prefix` is a static asset
/// 4. Everything else passes through
pub fn classify(request: &Request, static_prefix: &str) -> RequestClassification {
  if request.method != Method::GET {
    RequestClassification::Passthrough
  } else if request.accepts_html() {
    RequestClassification::Document
  } else if request.url.path().starts_with(static_prefix) {
    RequestClassification::StaticAsset
  } else {
    RequestClassification::Passthrough
  }
}
