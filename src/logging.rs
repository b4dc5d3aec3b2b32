use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: stderr plus a daily log file.
///
/// The filter comes from `NEXO_SW_LOG` when set. Keep the returned guard
/// alive until exit or buffered file output is lost.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = log_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "nexo-sw.log"));

  let default_filter = if verbose { "nexo_sw=debug,info" } else { "info" };
  let filter = EnvFilter::try_from_env("NEXO_SW_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("nexo-sw").join("logs"))
}
