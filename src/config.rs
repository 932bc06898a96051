use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Generation compiled into the agent. Bump it to invalidate every cached entry.
pub const GENERATION: &str = "alexiaflix-cache-v2";

/// App Shell pre-cached at install time.
pub const APP_SHELL: &[&str] = &[
  ".",
  "index.html",
  "manifest.json",
  "Web/Images/AlexiaFlix - Logo/AlexiaFlix - Logo 2.png",
  "Web/Images/AlexiaFlix - Logo/AlexiaFlix - Logo 2.ico",
  "Web/Images/AlexiaFlix - Logo/CatGPT.jpg",
  "Audios/Musiques/Launch.mp3",
  "https://cdn.tailwindcss.com",
  "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.5.1/css/all.min.css",
  "https://fonts.googleapis.com/css2?family=Montserrat:wght@700&family=Poppins:wght@300;400;500;600;700&display=swap",
];

/// Live media and generative API traffic is never cached.
pub const BYPASS_PATTERNS: &[&str] = &["generativelanguage.googleapis.com", "1drv.ms"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub agent: AgentConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

/// Immutable policy shared by the cache manager and the interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
  /// Name of the current cache generation
  pub generation: String,
  /// Locators pre-cached at install, in order
  pub manifest: Vec<String>,
  /// URL substrings exempt from interception
  #[serde(default = "default_bypass_patterns")]
  pub bypass_patterns: Vec<String>,
  /// Cached locator served when a network fetch fails
  #[serde(default)]
  pub offline_fallback: Option<String>,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      generation: GENERATION.to_string(),
      manifest: APP_SHELL.iter().map(|s| s.to_string()).collect(),
      bypass_patterns: default_bypass_patterns(),
      offline_fallback: None,
    }
  }
}

fn default_bypass_patterns() -> Vec<String> {
  BYPASS_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl AgentConfig {
  /// Whether a request URL matches one of the bypass patterns.
  pub fn is_bypassed(&self, url: &str) -> bool {
    self
      .bypass_patterns
      .iter()
      .any(|pattern| !pattern.is_empty() && url.contains(pattern.as_str()))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  /// Base that relative locators resolve against
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
      user_agent: None,
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:8000/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database file (default: $XDG_DATA_HOME/shellcache/cache.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to the compiled-in defaults when no file exists.
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
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn validate(&self) -> Result<()> {
    if self.agent.generation.trim().is_empty() {
      return Err(eyre!("agent.generation must not be empty"));
    }
    if let Some(i) = self.agent.manifest.iter().position(|l| l.trim().is_empty()) {
      return Err(eyre!("agent.manifest entry {} is empty", i));
    }
    self.base_url()?;
    Ok(())
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.network.base_url)
      .map_err(|e| eyre!("Invalid network.base_url '{}': {}", self.network.base_url, e))
  }
}
