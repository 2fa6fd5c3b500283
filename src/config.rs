use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub probe: ProbeConfig,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Portal origin, e.g. "https://portal.example.org"
  pub base_url: Option<String>,
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      request_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
  /// Liveness endpoint, relative to the base URL
  pub path: String,
  pub timeout_ms: u64,
  pub interval_secs: u64,
}

impl Default for ProbeConfig {
  fn default() -> Self {
    Self {
      path: "/api/ping".to_string(),
      timeout_ms: 3000,
      interval_secs: 30,
    }
  }
}

impl ProbeConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefixes served network-first with a cached fallback
  pub read_endpoints: Vec<String>,
  /// Paths whose writes are queued while offline
  pub write_endpoints: Vec<String>,
  /// File extensions served cache-first (case-insensitive, no dot)
  #[serde(deserialize_with = "deserialize_lowercase")]
  pub asset_extensions: Vec<String>,
  /// Path fragments marking static assets
  pub asset_path_markers: Vec<String>,
  /// Asset extensions that fall back to the offline image
  #[serde(deserialize_with = "deserialize_lowercase")]
  pub image_extensions: Vec<String>,
  pub offline_page: String,
  pub offline_image: String,
  /// Paths fetched and stored by `install`
  pub precache: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      read_endpoints: strings(&["/api/news", "/api/projects", "/api/leaders", "/api/events"]),
      write_endpoints: strings(&["/api/feedback"]),
      asset_extensions: strings(&[
        "js", "css", "png", "jpg", "jpeg", "svg", "gif", "webp", "ico", "woff", "woff2", "ttf",
        "eot", "mp3", "mp4",
      ]),
      asset_path_markers: strings(&["/assets/"]),
      image_extensions: strings(&["png", "jpg", "jpeg", "svg", "gif", "webp"]),
      offline_page: "/offline.html".to_string(),
      offline_image: "/offline-image.png".to_string(),
      precache: strings(&[
        "/",
        "/index.html",
        "/offline.html",
        "/offline-image.png",
        "/manifest.json",
      ]),
    }
  }
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Database file; defaults to $XDG_DATA_HOME/outpost/cache.db
  pub path: Option<PathBuf>,
  /// Active cache namespace. Entries of other namespaces are purged on install.
  pub name: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      name: "portal-cache-v1".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when OUTPOST_LOG is unset
  pub level: String,
  /// Log directory; defaults to $XDG_STATE_HOME/outpost (or the data dir)
  pub dir: Option<PathBuf>,
  /// Write a daily log file
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
      file: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
  ///
  /// Without a file, `server_override` alone is enough to run.
  pub fn load(explicit_path: Option<&Path>, server_override: Option<&str>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match (path, server_override) {
      (Some(p), _) => Self::load_from_path(&p)?,
      (None, Some(_)) => Config::default(),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/outpost/config.yaml \
           or pass --server.\nSee outpost.example.yaml for the format."
        ))
      }
    };

    if let Some(server) = server_override {
      config.server.base_url = Some(server.to_string());
    }
    config.base_url()?;
    Ok(config)
  }

  /// Defaults pointed at `base_url`.
  pub fn for_server(base_url: &str) -> Self {
    let mut config = Config::default();
    config.server.base_url = Some(base_url.to_string());
    config
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// The portal origin, parsed.
  pub fn base_url(&self) -> Result<Url> {
    let raw = self
      .server
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("server.base_url is not set"))?;
    let url = Url::parse(raw).map_err(|e| eyre!("Invalid server.base_url '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("server.base_url must be http or https, got '{}'", raw));
    }
    Ok(url)
  }

  pub fn probe_url(&self) -> Result<Url> {
    let base = self.base_url()?;
    base
      .join(&self.probe.path)
      .map_err(|e| eyre!("Invalid probe.path '{}': {}", self.probe.path, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.server.request_timeout_secs)
  }
}
