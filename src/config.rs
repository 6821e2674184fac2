use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Version of the cache bucket shipped with this build. Changing it rotates the cache.
pub const CACHE_NAME: &str = "povesti-magice-v1.0.0";

/// Assets fetched and stored at install time.
pub const URLS_TO_CACHE: &[&str] = &[
  "/",
  "/index.html",
  "/manifest.json",
  "/icon-192.png",
  "/icon-512.png",
];

/// Document served for any request that fails on the network.
pub const OFFLINE_FALLBACK: &str = "/index.html";

/// Page opened by the `explore` notification action.
pub const ROOT_PAGE: &str = "/";

pub const SYNC_TAG: &str = "background-sync";

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Name of the live cache bucket
  pub cache_name: String,
  /// Origin the agent serves; asset paths resolve against it
  pub origin: String,
  /// Root-relative paths precached on install
  pub precache: Vec<String>,
  /// Root-relative path served when the network fails
  pub offline_fallback: String,
  /// Page opened from the explore action
  pub root_page: String,
  /// Background sync tag that triggers the sync hook
  pub sync_tag: String,
  /// Database location (defaults to the user data directory)
  pub database: Option<PathBuf>,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: CACHE_NAME.to_string(),
      origin: DEFAULT_ORIGIN.to_string(),
      precache: URLS_TO_CACHE.iter().map(|s| s.to_string()).collect(),
      offline_fallback: OFFLINE_FALLBACK.to_string(),
      root_page: ROOT_PAGE.to_string(),
      sync_tag: SYNC_TAG.to_string(),
      database: None,
      notifications: NotificationConfig::default(),
    }
  }
}

/// Fixed parts of push notifications
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  /// Body used when a push carries no payload
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  /// Vibration pattern in milliseconds (on, off, on, ...)
  pub vibrate: Vec<u32>,
  pub explore_title: String,
  pub close_title: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Povești cu Final Schimbat".to_string(),
      default_body: "Ai exerciții noi de rezolvat!".to_string(),
      icon: "/icon-192.png".to_string(),
      badge: "/icon-192.png".to_string(),
      vibrate: vec![100, 50, 100],
      explore_title: "Începe Exercițiile".to_string(),
      close_title: "Închide".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-agent/config.yaml
  ///
  /// Without a file the built-in constants are used.
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
    let local = PathBuf::from("offline-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-agent").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.origin_url()?;
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a root-relative path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }
}
