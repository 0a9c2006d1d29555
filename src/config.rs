use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub intercept: InterceptConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the realtime database (e.g. "https://reels.example.firebaseio.com")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// SQLite file for cached entries (defaults to the data directory)
  pub path: Option<PathBuf>,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Oldest entries by write time are evicted past this count
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      default_ttl_secs: default_ttl_secs(),
      max_entries: default_max_entries(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_max_entries() -> usize {
  1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterceptConfig {
  /// Origin the application shell is served from
  #[serde(default = "default_origin")]
  pub origin: String,
  /// Build identifier for the shell asset namespace
  #[serde(default = "default_version")]
  pub shell_version: String,
  /// Version of the dynamic API response namespace
  #[serde(default = "default_version")]
  pub data_version: String,
  /// Requests whose full URL matches are treated as dynamic data
  #[serde(default = "default_api_pattern")]
  pub api_pattern: String,
  /// Shell assets cached on install, relative to `origin`
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Asset served to navigations when both cache and network miss
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      shell_version: default_version(),
      data_version: default_version(),
      api_pattern: default_api_pattern(),
      manifest: default_manifest(),
      offline_fallback: default_offline_fallback(),
    }
  }
}

fn default_origin() -> String {
  "http://localhost:5173".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_api_pattern() -> String {
  r"(/api/|api\.themoviedb\.org|\.firebaseio\.com)".to_string()
}

fn default_manifest() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/manifest.json".to_string(),
  ]
}

fn default_offline_fallback() -> String {
  "/index.html".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./reelsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/reelsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/reelsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("reelsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("reelsync").join("config.yaml");
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
    regex::Regex::new(&config.intercept.api_pattern)
      .map_err(|e| eyre!("Invalid intercept.api_pattern: {}", e))?;
    Ok(config)
  }

  /// Get the remote auth token from environment variables.
  ///
  /// Checks REELSYNC_TOKEN first, then REELSYNC_AUTH. Absent means anonymous access.
  pub fn get_auth_token() -> Option<String> {
    std::env::var("REELSYNC_TOKEN")
      .or_else(|_| std::env::var("REELSYNC_AUTH"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
