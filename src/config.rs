use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::descriptor::QueryDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the collection API, e.g. "https://ops.example.com"
  pub base_url: String,
  /// Per-request timeout in seconds. Expiry surfaces as a transport error.
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
  /// Rows requested per page
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  /// Minutes before fresh cache entries are refetched on read
  #[serde(default = "default_stale_after_minutes")]
  pub stale_after_minutes: u64,
}

impl Default for DefaultsConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      stale_after_minutes: default_stale_after_minutes(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_page_size() -> u32 {
  25
}

fn default_stale_after_minutes() -> u64 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./refcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/refcache/config.yaml
  /// 4. ~/.config/refcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/refcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("refcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("refcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks REFCACHE_API_TOKEN first, then REFERRALOPS_API_TOKEN as
  /// fallback. The token never lives in the config file.
  pub fn get_api_token() -> Result<String> {
    std::env::var("REFCACHE_API_TOKEN")
      .or_else(|_| std::env::var("REFERRALOPS_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "API token not found. Set REFCACHE_API_TOKEN or REFERRALOPS_API_TOKEN environment variable."
        )
      })
  }

  /// How long a cache entry stays fresh.
  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.defaults.stale_after_minutes as i64)
  }

  /// Descriptor for a resource using the configured page size.
  pub fn descriptor(&self, resource: &str) -> QueryDescriptor {
    QueryDescriptor::new(resource, self.defaults.page_size)
  }
}
