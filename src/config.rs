use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::queue::EvictionPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: Url,
  #[serde(default = "default_submission_path")]
  pub submission_path: String,
  #[serde(default = "default_login_path")]
  pub login_path: String,
  #[serde(default = "default_refresh_path")]
  pub refresh_path: String,
  #[serde(default = "default_logout_path")]
  pub logout_path: String,
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Account used by `login` when none is given on the command line
  pub username: Option<String>,
}

fn default_submission_path() -> String {
  "/api/vehicles".to_string()
}

fn default_login_path() -> String {
  "/api/v1/auth/login".to_string()
}

fn default_refresh_path() -> String {
  "/api/v1/auth/refresh".to_string()
}

fn default_logout_path() -> String {
  "/api/v1/auth/logout".to_string()
}

fn default_health_path() -> String {
  "/api/health".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Current cache generation; bump it to install a fresh set of namespaces
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Paths fetched on install and served cache-first
  #[serde(default)]
  pub precache: Vec<String>,
  /// Path prefixes served network-first
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      precache: Vec::new(),
      api_prefixes: default_api_prefixes(),
    }
  }
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_api_prefixes() -> Vec<String> {
  vec![
    "/api/vehicles".to_string(),
    "/api/v1/vehicles".to_string(),
    "/api/v1/analysis".to_string(),
  ]
}

/// Eviction limits; `null` disables a limit.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: Option<u32>,
  /// Matches the backend's refresh token lifetime
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: Option<i64>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      max_age_hours: default_max_age_hours(),
    }
  }
}

fn default_max_attempts() -> Option<u32> {
  Some(10)
}

fn default_max_age_hours() -> Option<i64> {
  Some(168)
}

impl QueueConfig {
  pub fn eviction_policy(&self) -> EvictionPolicy {
    EvictionPolicy {
      max_attempts: self.max_attempts,
      max_age: self.max_age_hours.and_then(chrono::Duration::try_hours),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Periodic drain interval; `null` or 0 disables periodic wakes
  #[serde(default = "default_interval_secs")]
  pub interval_secs: Option<u64>,
  #[serde(default = "default_probe_secs")]
  pub probe_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
      probe_secs: default_probe_secs(),
    }
  }
}

fn default_interval_secs() -> Option<u64> {
  Some(300)
}

fn default_probe_secs() -> u64 {
  15
}

impl SyncConfig {
  pub fn interval(&self) -> Option<Duration> {
    self
      .interval_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }

  pub fn probe_period(&self) -> Duration {
    Duration::from_secs(self.probe_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Defaults to `<data dir>/logs`
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./capsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/capsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/capsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("capsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("capsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if let Some(hours) = self.queue.max_age_hours {
      if hours <= 0 || chrono::Duration::try_hours(hours).is_none() {
        return Err(eyre!(
          "queue.max_age_hours must be a positive number of hours, got {}",
          hours
        ));
      }
    }
    Ok(())
  }

  /// Resolve a path against the API base URL.
  pub fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .api
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint path '{}': {}", path, e))
  }

  /// Get the login password from the environment.
  ///
  /// Checks CAPSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("CAPSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the CAPSYNC_PASSWORD environment variable."))
  }
}
