//! Owns the installing, waiting and active workers and routes requests.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::clients::{ClientId, Clients};
use super::{
  ActivationReport, FetchOutcome, InstallReport, ServiceWorker, WorkerSettings, WorkerState,
};
use crate::cache::{CacheLayer, CacheNamespace, CacheStorage};
use crate::error::WorkerError;
use crate::net::{Network, Request};

/// Result of [`Registration::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// This version is already active; nothing was fetched.
  AlreadyActive { namespace: String },
  Installed {
    install: InstallReport,
    /// Present when the new version took over immediately
    activation: Option<ActivationReport>,
  },
}

/// Which namespaces currently occupy each slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationStatus {
  pub installing: Option<String>,
  pub waiting: Option<String>,
  pub active: Option<String>,
}

struct Slots<S: CacheStorage, N: Network> {
  installing: Option<Arc<ServiceWorker<S, N>>>,
  waiting: Option<Arc<ServiceWorker<S, N>>>,
  active: Option<Arc<ServiceWorker<S, N>>>,
}

/// The registration of the worker for one origin.
///
/// A version only reaches `waiting` after a successful install, and only
/// the active version receives requests. Activation holds the slot lock, so
/// no request is routed while the active version changes.
pub struct Registration<S: CacheStorage, N: Network> {
  cache: CacheLayer<S, N>,
  clients: Arc<Clients>,
  slots: RwLock<Slots<S, N>>,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  /// An empty registration: nothing installed, nothing intercepted.
  pub fn new(cache: CacheLayer<S, N>) -> Self {
    Self {
      cache,
      clients: Arc::new(Clients::new()),
      slots: RwLock::new(Slots {
        installing: None,
        waiting: None,
        active: None,
      }),
    }
  }

  /// Rebuild the registration from what the store remembers.
  ///
  /// The current namespace becomes the active worker. A namespace for
  /// `settings` that exists but is not current was installed earlier and
  /// becomes the waiting worker.
  pub fn restore(cache: CacheLayer<S, N>, settings: &WorkerSettings) -> Result<Self, WorkerError> {
    let current = cache.storage().current()?;
    let namespaces = cache.storage().list_namespaces()?;
    let target = &settings.namespace.name;

    let mut registration = Self::new(cache);
    let restored = |settings: WorkerSettings, state| {
      Arc::new(ServiceWorker::with_state(
        settings,
        registration.cache.clone(),
        Arc::clone(&registration.clients),
        state,
      ))
    };

    let active = current.as_deref().map(|name| {
      restored(
        settings.for_namespace(CacheNamespace::from_name(name)),
        WorkerState::Active,
      )
    });
    let waiting = (current.as_ref() != Some(target) && namespaces.contains(target))
      .then(|| restored(settings.clone(), WorkerState::Waiting));

    debug!(active = ?current, waiting = waiting.is_some(), "restored registration");

    let slots = registration.slots.get_mut();
    slots.active = active;
    slots.waiting = waiting;
    Ok(registration)
  }

  pub fn cache(&self) -> &CacheLayer<S, N> {
    &self.cache
  }

  /// Install a new version.
  ///
  /// On success the version waits, unless it asked to skip waiting or no
  /// version is active yet, in which case it is activated straight away.
  /// On failure whatever was active keeps serving.
  pub async fn install(&self, settings: WorkerSettings) -> Result<InstallOutcome, WorkerError> {
    let (has_active, already_active) = {
      let slots = self.slots.read().await;
      let active = slots.active.as_ref().map(|w| w.namespace().name.clone());
      (
        active.is_some(),
        active.filter(|name| *name == settings.namespace.name),
      )
    };
    if let Some(namespace) = already_active {
      info!(%namespace, "already active");
      return Ok(InstallOutcome::AlreadyActive { namespace });
    }

    let worker = Arc::new(ServiceWorker::new(
      settings,
      self.cache.clone(),
      Arc::clone(&self.clients),
    ));

    let abandoned = self.slots.write().await.installing.replace(Arc::clone(&worker));
    if let Some(abandoned) = abandoned {
      abandoned.supersede().await;
    }

    let result = worker.on_install().await;

    let replaced = {
      let mut slots = self.slots.write().await;
      if slots
        .installing
        .as_ref()
        .is_some_and(|w| Arc::ptr_eq(w, &worker))
      {
        slots.installing = None;
      }
      if result.is_ok() {
        slots.waiting.replace(Arc::clone(&worker))
      } else {
        None
      }
    };
    if let Some(replaced) = replaced {
      replaced.supersede().await;
    }

    let install = result?;
    let activation = if install.skip_waiting || !has_active {
      Some(self.activate().await?)
    } else {
      info!(namespace = %install.namespace, "waiting for activation");
      None
    };

    Ok(InstallOutcome::Installed {
      install,
      activation,
    })
  }

  /// Promote the waiting version to active. The previous active version
  /// becomes redundant.
  pub async fn activate(&self) -> Result<ActivationReport, WorkerError> {
    let mut slots = self.slots.write().await;
    let worker = slots.waiting.take().ok_or(WorkerError::NoWaitingWorker)?;

    match worker.on_activate().await {
      Ok(report) => {
        if let Some(previous) = slots.active.replace(worker) {
          previous.supersede().await;
        }
        Ok(report)
      }
      Err(e) => {
        slots.waiting = Some(worker);
        Err(e)
      }
    }
  }

  /// Delete every namespace that no installing, waiting or active version
  /// owns. Cleans up after an activation that could not remove them all.
  pub async fn prune(&self) -> Result<Vec<String>, WorkerError> {
    let slots = self.slots.read().await;
    let owned: Vec<&str> = [&slots.installing, &slots.waiting, &slots.active]
      .into_iter()
      .flatten()
      .map(|w| w.namespace().name.as_str())
      .collect();

    let storage = self.cache.storage();
    let mut deleted = Vec::new();
    for name in storage.list_namespaces()? {
      if owned.contains(&name.as_str()) {
        continue;
      }
      storage.delete_namespace(&name)?;
      info!(namespace = %name, "pruned namespace");
      deleted.push(name);
    }
    Ok(deleted)
  }

  /// Route an intercepted request to the active version.
  ///
  /// Requests are not claimed when nothing is active or when they come from
  /// a client that the active version does not control.
  pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
    let Some(worker) = self.slots.read().await.active.clone() else {
      return FetchOutcome::Passthrough;
    };

    if let Some(client) = request.client_id {
      if !self.clients.is_controlled_by(client, &worker.namespace().name) {
        debug!(%client, url = %request.url, "uncontrolled client");
        return FetchOutcome::Passthrough;
      }
    }

    worker.on_intercepted_request(request).await
  }

  /// Register a client; it is controlled by the active version, if any.
  pub async fn open_client(&self) -> ClientId {
    let active = self
      .slots
      .read()
      .await
      .active
      .as_ref()
      .map(|w| w.namespace().name.clone());
    self.clients.open(active.as_deref())
  }

  /// Forget a client once it is gone. Returns whether it was open.
  pub fn close_client(&self, id: ClientId) -> bool {
    self.clients.close(id)
  }

  pub async fn status(&self) -> RegistrationStatus {
    let slots = self.slots.read().await;
    let name = |w: &Option<Arc<ServiceWorker<S, N>>>| w.as_ref().map(|w| w.namespace().name.clone());
    RegistrationStatus {
      installing: name(&slots.installing),
      waiting: name(&slots.waiting),
      active: name(&slots.active),
    }
  }
}
