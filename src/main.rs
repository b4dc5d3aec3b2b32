mod app;
mod cache;
mod config;
mod error;
mod logging;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nexo-sw")]
#[command(about = "Offline-first request cache for the Nexo web client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nexo-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database to use instead of the configured one
  #[arg(long)]
  db: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and prime its cache
  Install {
    /// Stay waiting if another version is active
    #[arg(long)]
    wait: bool,
  },
  /// Activate the waiting version
  Activate,
  /// Send one request through the worker
  Fetch {
    /// URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Accept header (use text/html for documents)
    #[arg(long)]
    accept: Option<String>,
    /// Treat as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Write the response body to stdout
    #[arg(short = 'b', long)]
    include_body: bool,
  },
  /// Show active and waiting versions and stored namespaces
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(db) = args.db {
    config::Config {
      cache: config::CacheConfig {
        database: Some(db),
        ..config.cache
      },
      ..config
    }
  } else {
    config
  };

  let app = app::App::new(config)?;
  let result = match args.command {
    Command::Install { wait } => app.install(wait).await,
    Command::Activate => app.activate().await,
    Command::Fetch {
      url,
      method,
      accept,
      navigate,
      include_body,
    } => {
      app
        .fetch(app::FetchRequest {
          target: url,
          method,
          accept,
          navigate,
          include_body,
        })
        .await
    }
    Command::Status => app.status().await,
  };

  // Refreshes started by `fetch` die with the runtime unless awaited here
  app.shutdown().await;
  result
}
