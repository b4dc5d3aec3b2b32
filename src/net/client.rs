use std::time::Duration;

use tracing::debug;

use crate::config::Config;

use super::types::{Request, ResponseSnapshot};
use super::{Network, NetworkError};

/// HTTP network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("nexo-sw/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(NetworkError::Client)?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    debug!(method = %request.method, url = %request.url, "network fetch");

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone())
      .send()
      .await
      .map_err(|e| transport_error(request, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|value| (name.as_str().to_string(), value.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| transport_error(request, e))?;

    Ok(ResponseSnapshot {
      url,
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

fn transport_error(request: &Request, source: reqwest::Error) -> NetworkError {
  let url = request.url.to_string();
  if source.is_connect() || source.is_timeout() {
    NetworkError::Unreachable {
      url,
      source: Some(source),
    }
  } else {
    NetworkError::Transport { url, source }
  }
}
