use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Listen address, e.g. "0.0.0.0:3000"
  #[serde(default = "default_addr")]
  pub addr: String,
  /// SQLite database file
  #[serde(default = "default_database")]
  pub database: PathBuf,
  /// Flat file backing temporary/demo tickets
  #[serde(default = "default_fallback_file")]
  pub fallback_file: PathBuf,
  /// Public directory for uploaded attachments
  #[serde(default = "default_uploads_dir")]
  pub uploads_dir: PathBuf,
  /// Substitute the demo identity for unauthenticated callers
  #[serde(default)]
  pub dev_mode: bool,
  /// Also log to this file (non-blocking) when set
  pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      addr: default_addr(),
      database: default_database(),
      fallback_file: default_fallback_file(),
      uploads_dir: default_uploads_dir(),
      dev_mode: false,
      log_file: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
  /// Base URL of the API server
  #[serde(default = "default_base_url")]
  pub base_url: String,
  /// Session identity sent with every request
  pub user: Option<String>,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      user: None,
    }
  }
}

impl ClientConfig {
  /// Session identity for outgoing requests.
  ///
  /// Checks the APPSHADE_USER environment variable first, then the
  /// configured value.
  pub fn session_user(&self) -> Option<String> {
    std::env::var("APPSHADE_USER").ok().or_else(|| self.user.clone())
  }
}

fn default_addr() -> String {
  "0.0.0.0:3000".to_string()
}

fn default_database() -> PathBuf {
  PathBuf::from("appshade.db")
}

fn default_fallback_file() -> PathBuf {
  PathBuf::from("temp-tickets.json")
}

fn default_uploads_dir() -> PathBuf {
  PathBuf::from("public/uploads")
}

fn default_base_url() -> String {
  "http://localhost:3000".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./appshade.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/appshade/config.yaml
  /// 4. ~/.config/appshade/config.yaml
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
        "No configuration file found. Create one at ~/.config/appshade/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("appshade.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("appshade").join("config.yaml");
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
}
