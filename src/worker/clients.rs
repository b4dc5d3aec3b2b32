//! Open clients and the cache namespace that controls each of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
  fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

/// Clients known to the registration, each mapped to the namespace of the
/// worker controlling it, if any.
#[derive(Debug, Default)]
pub struct Clients {
  clients: Mutex<HashMap<ClientId, Option<String>>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new client. It is controlled by `controller` from the start,
  /// or stays uncontrolled until the next claim.
  pub fn open(&self, controller: Option<&str>) -> ClientId {
    let id = ClientId::next();
    self.lock().insert(id, controller.map(String::from));
    id
  }

  /// Forget a client. Returns whether it was open.
  pub fn close(&self, id: ClientId) -> bool {
    self.lock().remove(&id).is_some()
  }

  /// Whether requests from `id` belong to the worker serving `namespace`.
  /// Unknown clients are treated as uncontrolled.
  pub fn is_controlled_by(&self, id: ClientId, namespace: &str) -> bool {
    self
      .lock()
      .get(&id)
      .and_then(|controller| controller.as_deref())
      .is_some_and(|controller| controller == namespace)
  }

  /// Take control of every open client. Returns how many changed controller.
  pub fn claim(&self, namespace: &str) -> usize {
    let mut clients = self.lock();
    let mut claimed = 0;
    for controller in clients.values_mut() {
      if controller.as_deref() != Some(namespace) {
        *controller = Some(namespace.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Option<String>>> {
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_uncontrolled() {
    let clients = Clients::new();
    let id = clients.open(None);
    assert!(!clients.is_controlled_by(id, "nexo-static-v3"));
  }

  #[test]
  fn test_claim_takes_over_every_client() {
    let clients = Clients::new();
    let a = clients.open(None);
    let b = clients.open(Some("nexo-static-v2"));
    let c = clients.open(Some("nexo-static-v3"));

    assert_eq!(clients.claim("nexo-static-v3"), 2);
    for id in [a, b, c] {
      assert!(clients.is_controlled_by(id, "nexo-static-v3"));
    }
  }

  #[test]
  fn test_closed_client_is_forgotten() {
    let clients = Clients::new();
    let a = clients.open(Some("nexo-static-v3"));
    let b = clients.open(None);

    assert!(clients.close(a));
    assert!(!clients.close(a));
    assert!(!clients.is_controlled_by(a, "nexo-static-v3"));
    assert_eq!(clients.claim("nexo-static-v3"), 1);
    assert!(clients.is_controlled_by(b, "nexo-static-v3"));
  }
}
