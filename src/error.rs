use thiserror::Error;

use crate::cache::StorageError;
use crate::net::NetworkError;
use crate::worker::WorkerState;

/// Errors surfaced by the worker's event handlers.
///
/// A cache miss is never an error; strategies fall through to their next
/// source instead.
#[derive(Debug, Error)]
pub enum WorkerError {
  /// The network failed and neither the cache nor the offline page could stand in.
  #[error("network unavailable for {url}")]
  NetworkUnavailable {
    url: String,
    #[source]
    source: NetworkError,
  },

  /// A static asset is neither cached nor reachable.
  #[error("resource unavailable: {url}")]
  ResourceUnavailable { url: String },

  /// Install could not store the whole core asset manifest. The version is
  /// discarded; whatever was active before keeps serving.
  #[error("failed to prime cache {namespace}: {reason}")]
  CachePrimingFailed { namespace: String, reason: String },

  #[error("cannot {action} a worker that is {state}")]
  InvalidTransition {
    state: WorkerState,
    action: &'static str,
  },

  #[error("no installed version is waiting to activate")]
  NoWaitingWorker,

  #[error(transparent)]
  Storage(#[from] StorageError),
}
