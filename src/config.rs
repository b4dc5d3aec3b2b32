use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CacheNamespace;
use crate::worker::WorkerSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin that relative manifest and offline URLs are resolved against
  pub origin: String,
  pub cache: CacheConfig,
  /// Core asset manifest, cached on install
  pub core_assets: Vec<String>,
  /// Paths under this prefix are served stale-while-revalidate
  pub static_prefix: String,
  /// Page served to navigations when offline
  pub offline_url: String,
  /// Activate a new version as soon as it is installed
  pub skip_waiting: bool,
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace name prefix; the full name is `{prefix}-v{version}`
  pub prefix: String,
  /// Bump on every deployed change to the core assets
  pub version: u32,
  /// SQLite file (default: $XDG_DATA_HOME/nexo-sw/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "nexo-static".to_string(),
      version: 3,
      database: None,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000/".to_string(),
      cache: CacheConfig::default(),
      core_assets: [
        "/",
        "/offline/",
        "/static/css/theme.css",
        "/static/js/app.js",
        "/static/icons/favicon.ico",
        "/static/icons/favicon.svg",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      static_prefix: "/static/".to_string(),
      offline_url: "/offline/".to_string(),
      skip_waiting: true,
      request_timeout_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nexo-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nexo-sw/config.yaml
  ///
  /// Without a file the built-in defaults are used. `NEXO_SW_ORIGIN`
  /// overrides the origin either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(origin) = Self::origin_override()? {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("nexo-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nexo-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if !config.static_prefix.starts_with('/') {
      return Err(eyre!(
        "static_prefix must start with '/', got '{}'",
        config.static_prefix
      ));
    }
    Ok(config)
  }

  /// Origin from NEXO_SW_ORIGIN, if set.
  fn origin_override() -> Result<Option<String>> {
    match std::env::var("NEXO_SW_ORIGIN") {
      Ok(value) => {
        Url::parse(&value).map_err(|e| eyre!("Invalid NEXO_SW_ORIGIN '{}': {}", value, e))?;
        Ok(Some(value))
      }
      Err(_) => Ok(None),
    }
  }

  pub fn namespace(&self) -> CacheNamespace {
    CacheNamespace::new(&self.cache.prefix, self.cache.version)
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    let origin =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  /// Settings for the configured worker version. Duplicate manifest
  /// entries are dropped, keeping the first occurrence.
  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    let mut core_assets: Vec<Url> = Vec::with_capacity(self.core_assets.len());
    for asset in &self.core_assets {
      let url = self.resolve(asset)?;
      if !core_assets.contains(&url) {
        core_assets.push(url);
      }
    }

    Ok(WorkerSettings {
      namespace: self.namespace(),
      core_assets,
      static_prefix: self.static_prefix.clone(),
      offline_url: self.resolve(&self.offline_url)?,
      skip_waiting: self.skip_waiting,
    })
  }
}
