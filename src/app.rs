use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Method;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::net::{HttpNetwork, Network, Request, ResponseSnapshot};
use crate::worker::{ActivationReport, FetchOutcome, InstallOutcome, Registration, WorkerSettings};

/// A single request to push through the interception boundary.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  /// Absolute URL or path relative to the origin
  pub target: String,
  pub method: String,
  pub accept: Option<String>,
  pub navigate: bool,
  pub include_body: bool,
}

/// Main application state
pub struct App {
  config: Config,
  settings: WorkerSettings,
  network: Arc<HttpNetwork>,
  registration: Registration<SqliteStorage, HttpNetwork>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let settings = config.worker_settings()?;
    let storage = Arc::new(SqliteStorage::open(config.cache.database.as_deref())?);
    let network = Arc::new(HttpNetwork::new(&config)?);
    let cache = CacheLayer::new(storage, Arc::clone(&network));
    let registration = Registration::restore(cache, &settings)?;

    Ok(Self {
      config,
      settings,
      network,
      registration,
    })
  }

  fn storage(&self) -> &SqliteStorage {
    self.registration.cache().storage()
  }

  /// Install the configured version. With `wait`, a new version stays
  /// waiting while another one is active.
  pub async fn install(&self, wait: bool) -> Result<()> {
    let settings = WorkerSettings {
      skip_waiting: self.settings.skip_waiting && !wait,
      ..self.settings.clone()
    };

    match self.registration.install(settings).await? {
      InstallOutcome::AlreadyActive { namespace } => {
        println!("{} is already active", namespace);
        for name in self.registration.prune().await? {
          println!("  deleted {}", name);
        }
      }
      InstallOutcome::Installed {
        install,
        activation,
      } => {
        println!("installed {} ({} assets)", install.namespace, install.primed);
        match activation {
          Some(report) => return print_activation(&report),
          None => println!("waiting; run `nexo-sw activate` to take over"),
        }
      }
    }

    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    let report = self.registration.activate().await?;
    print_activation(&report)
  }

  /// Let background cache refreshes finish before the runtime goes away.
  pub async fn shutdown(&self) {
    let timeout = Duration::from_secs(self.config.request_timeout_secs);
    self.registration.cache().drain_refreshes(timeout).await;
  }

  pub async fn fetch(&self, fetch: FetchRequest) -> Result<()> {
    let request = self.build_request(&fetch)?;

    let result = match self.registration.handle_fetch(request.clone()).await {
      FetchOutcome::Responded(result) => result?,
      FetchOutcome::Passthrough => {
        let response = self.network.fetch(&request).await?;
        print_response(&response, "passthrough", fetch.include_body)?;
        return Ok(());
      }
    };

    print_result(&result, fetch.include_body)
  }

  fn build_request(&self, fetch: &FetchRequest) -> Result<Request> {
    let url = self.config.resolve(&fetch.target)?;
    let method = Method::from_bytes(fetch.method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", fetch.method, e))?;

    let mut request = Request::get(url).with_method(method);
    if let Some(accept) = &fetch.accept {
      let value = HeaderValue::from_str(accept)
        .map_err(|e| eyre!("Invalid Accept header '{}': {}", accept, e))?;
      request = request.with_header(ACCEPT, value);
    }
    if fetch.navigate {
      request = request.navigation();
    }

    Ok(request)
  }

  pub async fn status(&self) -> Result<()> {
    let status = self.registration.status().await;
    let storage = self.storage();

    println!("configured: {}", self.settings.namespace);
    println!(
      "active:     {}",
      status.active.as_deref().unwrap_or("(none)")
    );
    println!(
      "waiting:    {}",
      status.waiting.as_deref().unwrap_or("(none)")
    );

    println!("namespaces:");
    for name in storage.list_namespaces()? {
      println!("  {} ({} entries)", name, storage.entry_count(&name)?);
    }

    Ok(())
  }
}

/// Old namespaces that survived activation make the command fail, even
/// though the new version is already serving. Running `install` again
/// retries the cleanup.
fn print_activation(report: &ActivationReport) -> Result<()> {
  println!("activated {}", report.namespace);
  for name in &report.deleted {
    println!("  deleted {}", name);
  }
  for name in &report.retained {
    println!("  could not delete {}", name);
  }
  if report.is_clean() {
    return Ok(());
  }

  let reason = match &report.cleanup_error {
    Some(reason) => format!("old namespaces could not be listed: {}", reason),
    None => format!("{} old namespace(s) remain", report.retained.len()),
  };
  Err(eyre!(
    "{} is active but {}; run `nexo-sw install` to retry cleanup",
    report.namespace,
    reason
  ))
}

fn print_result(result: &CacheResult<ResponseSnapshot>, include_body: bool) -> Result<()> {
  let source = match (result.source, result.cached_at) {
    (CacheSource::Network, _) | (_, None) => result.source.to_string(),
    (source, Some(cached_at)) => format!("{}, cached {}", source, cached_at.to_rfc3339()),
  };
  print_response(&result.data, &source, include_body)
}

fn print_response(response: &ResponseSnapshot, source: &str, include_body: bool) -> Result<()> {
  println!("{} {} [{}]", response.status, response.status_text, source);
  println!("url: {}", response.url);
  if let Some(content_type) = response.header("content-type") {
    println!("content-type: {}", content_type);
  }
  println!("{} bytes", response.body.len());

  if include_body {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;
  }

  Ok(())
}
