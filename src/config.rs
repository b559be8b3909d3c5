use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin every relative request and fixed endpoint is resolved against
  pub base_url: Url,
  /// Database file (default: $XDG_DATA_HOME/offsync/offsync.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When false, every store is a no-op and requests always hit the network
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Per-store overrides of the built-in eviction limits, keyed by store name
  #[serde(default)]
  pub limits: BTreeMap<String, StoreLimits>,
  /// App-shell paths fetched and stored on install
  #[serde(default, deserialize_with = "deserialize_paths")]
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      limits: BTreeMap::new(),
      precache: vec!["/".to_string()],
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct StoreLimits {
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<i64>,
}

/// Paths are stored with a leading slash so they join against the base URL's root.
fn deserialize_paths<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| {
        let s = s.trim();
        if s.starts_with('/') {
          s.to_string()
        } else {
          format!("/{}", s)
        }
      })
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How long success/error stays visible before the indicator returns to idle
  #[serde(default = "default_status_display_secs")]
  pub status_display_secs: u64,
  /// Minimum interval requested for periodic content sync
  #[serde(default = "default_periodic_interval_secs")]
  pub periodic_interval_secs: u64,
  /// How often the connectivity probe runs
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Whether the host delivers one-shot "connectivity restored" triggers
  #[serde(default = "default_true")]
  pub background_sync: bool,
  /// Whether the host delivers periodic triggers
  #[serde(default = "default_true")]
  pub periodic_sync: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      status_display_secs: default_status_display_secs(),
      periodic_interval_secs: default_periodic_interval_secs(),
      probe_interval_secs: default_probe_interval_secs(),
      background_sync: true,
      periodic_sync: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  /// Failed-request records older than this are dropped unconditionally
  #[serde(default = "default_max_age_days")]
  pub max_age_days: i64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_age_days: default_max_age_days(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_connect_timeout_secs")]
  pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      connect_timeout_secs: default_connect_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive; OFFSYNC_LOG overrides it
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for the rolling log file (default: next to the database)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_status_display_secs() -> u64 {
  3
}

fn default_periodic_interval_secs() -> u64 {
  12 * 60 * 60
}

fn default_probe_interval_secs() -> u64 {
  30
}

fn default_max_age_days() -> i64 {
  7
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_connect_timeout_secs() -> u64 {
  10
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// `base_url` overrides the file's value. With no file at all, a base URL
  /// alone is enough to run on defaults.
  pub fn load(explicit_path: Option<&Path>, base_url: Option<Url>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match (path, base_url) {
      (Some(p), base_url) => Self::load_from_path(&p, base_url),
      (None, Some(url)) => Ok(Self::with_base_url(url)),
      (None, None) => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 or pass --base-url."
      )),
    }
  }

  /// Defaults for everything except the origin.
  pub fn with_base_url(base_url: Url) -> Self {
    Self {
      base_url,
      database: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      retry: RetryConfig::default(),
      http: HttpConfig::default(),
      log: LogConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path, base_url: Option<Url>) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse_with(&contents, base_url)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  #[cfg(test)]
  fn parse(contents: &str) -> Result<Self> {
    Self::parse_with(contents, None)
  }

  /// Parse a config document. A `base_url` given here replaces the file's,
  /// and the file may then leave it out.
  fn parse_with(contents: &str, base_url: Option<Url>) -> Result<Self> {
    let mut value = if contents.trim().is_empty() {
      serde_yaml::Value::Null
    } else {
      serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?
    };
    if value.is_null() {
      value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    let map = value
      .as_mapping_mut()
      .ok_or_else(|| eyre!("Expected a mapping at the top level"))?;
    if let Some(url) = base_url {
      map.insert("base_url".into(), url.as_str().into());
    }
    if !map.contains_key("base_url") {
      return Err(eyre!("base_url is not set; add it to the file or pass --base-url"));
    }

    let config: Self = serde_yaml::from_value(value).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync.probe_interval_secs must be at least 1"));
    }
    if self.sync.periodic_interval_secs == 0 {
      return Err(eyre!("sync.periodic_interval_secs must be at least 1"));
    }
    Ok(())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.directory {
      return Ok(dir.clone());
    }
    let db_path = self.database_path()?;
    Ok(
      db_path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs")),
    )
  }

  /// Resolve a path or absolute URL against `base_url`.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .base_url
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }
}
