use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "CATALOG_API_URL";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub mutations: MutationConfig,
  pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
  /// Root of the catalog API, e.g. `http://localhost:3001/api`
  pub base_url: String,
  /// Per-request timeout
  pub timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3001/api".to_string(),
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  /// Age after which an entry is refetched on read
  pub stale_time_ms: u64,
  /// Extra attempts for a failed read
  pub retry: u32,
  pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: 10_000,
      retry: 1,
      retry_delay_ms: 1_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MutationConfig {
  /// Queue mutations touching the same keys instead of letting them interleave
  pub serialize: bool,
}

impl Default for MutationConfig {
  fn default() -> Self {
    Self { serialize: true }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
  pub bind: String,
  /// Probability that a mutating request fails with a synthetic 500
  pub failure_rate: f64,
  /// Artificial delay added to every response
  pub latency_ms: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: "127.0.0.1:3001".to_string(),
      failure_rate: 0.15,
      latency_ms: 0,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./catalog.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/catalog/config.yaml
  ///
  /// Without any file the defaults are used. `CATALOG_API_URL` overrides the
  /// API base URL in every case.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.with_env_overrides(std::env::var(API_URL_ENV).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("catalog.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("catalog").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn with_env_overrides(mut self, api_url: Option<String>) -> Self {
    if let Some(url) = api_url.filter(|url| !url.trim().is_empty()) {
      self.api.base_url = url;
    }
    self
  }
}
