use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_IN_MEMORY_LIMIT, DEFAULT_PERSISTED_LIMIT};

const DEFAULT_API_BASE: &str = "https://api.statsigcdn.com/v2/";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL that `download_config_specs/{sdk_key}.json` is joined onto
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_base_url() -> String {
  DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
  /// SQLite file, falls back to memory if access is denied
  #[default]
  Sqlite,
  /// Process memory only
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackendKind,
  /// Database file (default: $XDG_DATA_HOME/specsync/storage.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_in_memory_limit")]
  pub in_memory_limit: usize,
  #[serde(default = "default_persisted_limit")]
  pub persisted_limit: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      in_memory_limit: default_in_memory_limit(),
      persisted_limit: default_persisted_limit(),
    }
  }
}

fn default_in_memory_limit() -> usize {
  DEFAULT_IN_MEMORY_LIMIT
}

fn default_persisted_limit() -> usize {
  DEFAULT_PERSISTED_LIMIT
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./specsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/specsync/config.yaml
  ///
  /// Falls back to defaults when no file is found and no path was given.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("specsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("specsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the sdk key from the environment.
  ///
  /// Checks SPECSYNC_SDK_KEY.
  pub fn sdk_key_from_env() -> Result<String> {
    std::env::var("SPECSYNC_SDK_KEY")
      .map_err(|_| eyre!("SDK key not found. Set the SPECSYNC_SDK_KEY environment variable."))
  }
}
