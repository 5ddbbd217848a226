use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the application is really served from
  pub upstream: Option<Url>,
  /// Local address the agent listens on
  pub listen: SocketAddr,
  pub cache: CacheConfig,
  pub routing: RoutingConfig,
  pub documents: DocumentsConfig,
  /// Essential assets fetched into the static partition at install
  pub precache: Vec<String>,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      upstream: None,
      listen: SocketAddr::from(([127, 0, 0, 1], 4380)),
      cache: CacheConfig::default(),
      routing: RoutingConfig::default(),
      documents: DocumentsConfig::default(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
        "/images/placeholder.svg".to_string(),
      ],
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version token embedded in every partition name
  pub version: String,
  /// SQLite file (default: $XDG_DATA_HOME/fieldcache/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  pub api_prefix: String,
  /// API read endpoints whose responses are kept for offline use (prefix match)
  pub cacheable_api: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      cacheable_api: vec![
        "/api/standards".to_string(),
        "/api/organizations".to_string(),
        "/api/calibration-blocks".to_string(),
      ],
    }
  }
}

impl RoutingConfig {
  pub fn is_api(&self, path: &str) -> bool {
    path.starts_with(&self.api_prefix)
  }

  pub fn is_cacheable_api(&self, path: &str) -> bool {
    self.cacheable_api.iter().any(|p| path.starts_with(p.as_str()))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
  /// Document served to navigations that cannot be satisfied at all
  pub offline: String,
  /// Application shell, used when the offline document is missing
  pub shell: String,
  /// Image served when an image can be neither fetched nor found in cache
  pub placeholder_image: String,
}

impl Default for DocumentsConfig {
  fn default() -> Self {
    Self {
      offline: "/offline.html".to_string(),
      shell: "/index.html".to_string(),
      placeholder_image: "/images/placeholder.svg".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag that starts a replay of the offline queue
  pub tag: String,
  /// How often the background retry probes the origin while work is pending
  pub probe_interval_secs: u64,
  /// Drop a queued request after this many failed replays (unbounded if unset)
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-queue".to_string(),
      probe_interval_secs: 30,
      max_attempts: None,
    }
  }
}

impl SyncConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Request timeout; the transport default applies when unset
  pub timeout_secs: Option<u64>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldcache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
    let local = PathBuf::from("fieldcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Upstream origin, required before the agent can forward anything.
  pub fn upstream(&self) -> Result<&Url> {
    self.upstream.as_ref().ok_or_else(|| {
      eyre!("No upstream origin configured. Set `upstream` in fieldcache.yaml or pass --upstream.")
    })
  }
}
