use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::actions::ActionSpec;
use crate::auth::GateConfig;
use crate::cache::{CacheConfig, EvictionPolicy};
use crate::loyalty::ClientConfig;
use crate::sync::{AdaptiveInterval, SyncConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncSection,
  #[serde(default)]
  pub step_up: StepUpSection,
  #[serde(default)]
  pub role: RoleSection,
  /// Directory for daily log files; logs go to stderr only when unset
  pub log_dir: Option<PathBuf>,
  /// Action catalogue shown by `role`
  #[serde(default)]
  pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api".to_string(),
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
  /// Oldest cached value a background poll may serve
  pub cache_max_age_ms: u64,
  pub capacity: usize,
  pub eviction: EvictionPolicy,
  pub poll_interval_ms: u64,
  /// Ceiling for the widened poll interval
  pub max_poll_interval_ms: u64,
  /// Unchanged polls before the interval widens
  pub widen_after: u32,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      cache_max_age_ms: 90_000,
      capacity: 100,
      eviction: EvictionPolicy::Fifo,
      poll_interval_ms: 30_000,
      max_poll_interval_ms: 120_000,
      widen_after: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepUpSection {
  pub max_attempts: u32,
}

impl Default for StepUpSection {
  fn default() -> Self {
    Self {
      max_attempts: crate::auth::MAX_PIN_ATTEMPTS,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoleSection {
  pub cache_ttl_ms: u64,
}

impl Default for RoleSection {
  fn default() -> Self {
    Self {
      cache_ttl_ms: 5 * 60 * 1000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./loyalty-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/loyalty-sync/config.yaml
  ///
  /// Every section has defaults, so running without a file is fine.
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
      None => {
        debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("loyalty-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("loyalty-sync").join("config.yaml");
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

    config.validate()?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.poll_interval_ms == 0 {
      return Err(eyre!("sync.poll_interval_ms must be greater than zero"));
    }
    if self.sync.max_poll_interval_ms < self.sync.poll_interval_ms {
      return Err(eyre!(
        "sync.max_poll_interval_ms ({}) is below sync.poll_interval_ms ({})",
        self.sync.max_poll_interval_ms,
        self.sync.poll_interval_ms
      ));
    }
    Ok(())
  }

  /// Get the bearer token from environment variables.
  ///
  /// Checks LOYALTY_SYNC_TOKEN first, then LOYALTY_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("LOYALTY_SYNC_TOKEN")
      .or_else(|_| std::env::var("LOYALTY_TOKEN"))
      .map_err(|_| {
        eyre!("Bearer token not found. Set LOYALTY_SYNC_TOKEN or LOYALTY_TOKEN environment variable.")
      })
  }

  pub fn client_config(&self) -> Result<ClientConfig> {
    let base_url = Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {}: {}", self.api.base_url, e))?;

    Ok(ClientConfig {
      base_url,
      timeout: Duration::from_millis(self.api.timeout_ms),
    })
  }

  pub fn sync_config(&self) -> SyncConfig {
    SyncConfig {
      cache: CacheConfig {
        capacity: self.sync.capacity,
        policy: self.sync.eviction,
        default_ttl: millis(self.sync.cache_max_age_ms),
      },
      cache_max_age: millis(self.sync.cache_max_age_ms),
      request_timeout: Duration::from_millis(self.api.timeout_ms),
    }
  }

  pub fn gate_config(&self) -> GateConfig {
    GateConfig {
      max_attempts: self.step_up.max_attempts,
      ..GateConfig::default()
    }
  }

  pub fn role_ttl(&self) -> chrono::Duration {
    millis(self.role.cache_ttl_ms)
  }

  pub fn poll_interval(&self) -> AdaptiveInterval {
    AdaptiveInterval::new(
      Duration::from_millis(self.sync.poll_interval_ms),
      Duration::from_millis(self.sync.max_poll_interval_ms),
      self.sync.widen_after,
    )
  }
}

fn millis(ms: u64) -> chrono::Duration {
  chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_load_full_config() {
    let file = write_config(
      r#"
api:
  base_url: https://loyalty.example.com/api
  timeout_ms: 5000
sync:
  cache_max_age_ms: 60000
  capacity: 20
  eviction: lru
  poll_interval_ms: 15000
  max_poll_interval_ms: 60000
  widen_after: 2
step_up:
  max_attempts: 5
role:
  cache_ttl_ms: 120000
log_dir: /var/log/loyalty-sync
actions:
  - id: refund
    label: Refund
    allowed_roles: [admin]
    requires_step_up: true
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.sync.eviction, EvictionPolicy::Lru);
    assert_eq!(config.gate_config().max_attempts, 5);
    assert_eq!(config.role_ttl(), chrono::Duration::minutes(2));
    assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/loyalty-sync")));
    assert!(config.actions[0].requires_step_up);

    let sync = config.sync_config();
    assert_eq!(sync.cache.capacity, 20);
    assert_eq!(sync.cache_max_age, chrono::Duration::seconds(60));
    assert_eq!(sync.request_timeout, Duration::from_secs(5));

    let client = config.client_config().unwrap();
    assert_eq!(client.base_url.as_str(), "https://loyalty.example.com/api");
    assert_eq!(config.poll_interval().current(), Duration::from_secs(15));
  }

  #[test]
  fn test_partial_config_uses_defaults() {
    let file = write_config("sync:\n  capacity: 5\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.sync.capacity, 5);
    assert_eq!(config.sync.poll_interval_ms, 30_000);
    assert_eq!(config.step_up.max_attempts, 3);
    assert_eq!(config.api.timeout_ms, 10_000);
    assert!(config.log_dir.is_none());
    assert!(config.actions.is_empty());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/loyalty-sync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    let file = write_config("sync: [not, a, map]\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
  }

  #[test]
  fn test_zero_poll_interval_is_rejected() {
    let file = write_config("sync:\n  poll_interval_ms: 0\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("poll_interval_ms must be greater than zero"));

    let file = write_config("sync:\n  poll_interval_ms: 60000\n  max_poll_interval_ms: 1000\n");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_invalid_base_url_is_an_error() {
    let file = write_config("api:\n  base_url: not a url\n");
    let config = Config::load(Some(file.path())).unwrap();
    assert!(config.client_config().is_err());
  }
}
