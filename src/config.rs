use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the site being controlled; requests elsewhere are cross-origin
  pub origin: Url,
  /// Partition name prefix, e.g. "app" gives "app-v1" and "app-images-v1"
  pub cache_prefix: String,
  /// Version token appended to partition names. Bump it to invalidate every
  /// cached entry on the next activation.
  pub version: String,
  /// Critical assets stored at install time
  pub precache: Vec<String>,
  /// Path suffixes that mark a request as an image
  pub image_extensions: Vec<String>,
  pub dynamic: DynamicConfig,
  /// Document served to failed navigations with nothing cached
  pub offline_path: String,
  /// Cache database location (default: $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
  /// Log directory (default: $XDG_DATA_HOME/swcache/logs)
  pub log_dir: Option<PathBuf>,
  pub user_agent: Option<String>,
}

/// Markers for API/dynamic content that should stay network-first.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
  /// Any path containing this segment
  pub path_segment: String,
  /// Any path ending with this suffix
  pub suffix: String,
}

impl Default for DynamicConfig {
  fn default() -> Self {
    Self {
      path_segment: "/api/".to_string(),
      suffix: ".json".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8080").expect("static origin is valid"),
      cache_prefix: "app".to_string(),
      version: "v1".to_string(),
      precache: ["/", "/index.html", "/favicon.ico", "/placeholder.svg"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      image_extensions: [".png", ".jpg", ".jpeg", ".webp", ".svg", ".gif"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      dynamic: DynamicConfig::default(),
      offline_path: "/offline.html".to_string(),
      database: None,
      log_dir: None,
      user_agent: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
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
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
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

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.cache_prefix.trim().is_empty() {
      return Err(eyre!("cache_prefix must not be empty"));
    }
    if !self.offline_path.starts_with('/') {
      return Err(eyre!(
        "offline_path must be an absolute path, got {}",
        self.offline_path
      ));
    }
    Ok(())
  }

  /// Partition for precached and general assets.
  pub fn general_cache(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  /// Partition for images.
  pub fn image_cache(&self) -> String {
    format!("{}-images-{}", self.cache_prefix, self.version)
  }

  /// Resolve a site path (or absolute URL) against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
  }

  /// Precache list resolved against the origin, deduplicated, in order.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let mut urls: Vec<Url> = Vec::with_capacity(self.precache.len());
    for path in &self.precache {
      let url = self.resolve(path)?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }
    Ok(urls)
  }

  pub fn offline_url(&self) -> Result<Url> {
    self.resolve(&self.offline_path)
  }

  /// Scope key under which lifecycle state is recorded.
  pub fn scope(&self) -> String {
    self.origin.origin().ascii_serialization()
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  pub fn log_path(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }

  fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_partition_names() {
    let config = Config::default();
    assert_eq!(config.general_cache(), "app-v1");
    assert_eq!(config.image_cache(), "app-images-v1");
  }

  #[test]
  fn test_version_bump_renames_both_partitions() {
    let config = Config::from_yaml("cache_prefix: cvv-iedc\nversion: v2\n").unwrap();
    assert_eq!(config.general_cache(), "cvv-iedc-v2");
    assert_eq!(config.image_cache(), "cvv-iedc-images-v2");
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml("origin: https://club.example.org\n").unwrap();
    assert_eq!(config.origin.as_str(), "https://club.example.org/");
    assert_eq!(config.offline_path, "/offline.html");
    assert_eq!(config.dynamic.path_segment, "/api/");
    assert_eq!(config.image_extensions.len(), 6);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_precache_list_resolves_without_duplicates() {
    let mut config = Config::default();
    let urls = config.precache_urls().unwrap();
    let paths: Vec<&str> = urls.iter().map(|u| u.path()).collect();
    assert_eq!(
      paths,
      vec!["/", "/index.html", "/favicon.ico", "/placeholder.svg"]
    );

    config.precache.push("index.html".to_string());
    config.precache.push("/offline.html".to_string());
    let paths: Vec<String> = config
      .precache_urls()
      .unwrap()
      .iter()
      .map(|u| u.path().to_string())
      .collect();
    assert_eq!(paths.len(), 5);
    assert_eq!(paths.last().map(String::as_str), Some("/offline.html"));
  }

  #[test]
  fn test_validate_rejects_bad_values() {
    let config = Config::from_yaml("version: ''\n").unwrap();
    assert!(config.validate().is_err());

    let config = Config::from_yaml("offline_path: offline.html\n").unwrap();
    assert!(config.validate().is_err());

    let config = Config::from_yaml("origin: ftp://example.org\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/swcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_scope_is_origin_serialization() {
    let config = Config::from_yaml("origin: https://club.example.org/base/\n").unwrap();
    assert_eq!(config.scope(), "https://club.example.org");
  }
}
