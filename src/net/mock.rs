//! Scripted in-process network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use super::types::{Request, ResponseSnapshot};
use super::{Network, NetworkError};

/// Serves canned responses by URL.
///
/// Unknown URLs answer 404 while online. `hold` parks every fetch until
/// `release` is called, which lets tests control network latency.
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, ResponseSnapshot>>,
  online: AtomicBool,
  gate: watch::Sender<bool>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    let (gate, _) = watch::channel(true);
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      gate,
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn route(&self, url: &str, status: u16, body: &str) {
    let response = ResponseSnapshot {
      url: url.to_string(),
      status,
      status_text: String::new(),
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: body.as_bytes().to_vec(),
    };
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn hold(&self) {
    self.gate.send_replace(false);
  }

  pub fn release(&self) {
    self.gate.send_replace(true);
  }

  /// URLs fetched so far, in call order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    let mut gate = self.gate.subscribe();
    let _ = gate.wait_for(|open| *open).await;

    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable { url, source: None });
    }

    let routed = self.routes.lock().unwrap().get(&url).cloned();
    Ok(routed.unwrap_or_else(|| ResponseSnapshot {
      url,
      status: 404,
      status_text: "Not Found".to_string(),
      headers: Vec::new(),
      body: Vec::new(),
    }))
  }
}
