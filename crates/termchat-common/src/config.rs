use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = ".termchat/config.toml";
const DEFAULT_KEY_FILE: &str = ".termchat/key.json";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful terminal assistant. Keep responses concise and use plain text formatting suitable for terminal output. Avoid using markdown or other rich formatting.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermchatConfig {
    pub log_level: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub key_store: KeyStoreConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL the interactive client sends check-key and chat requests to.
    pub base_url: String,
    /// Listen address for `termchat serve`.
    pub bind: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            bind: "127.0.0.1:3000".to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model_id: String,
    pub api_key_env: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model_id: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStoreConfig {
    pub path: Option<PathBuf>,
}

impl KeyStoreConfig {
    /// `TERMCHAT_KEY_FILE` wins over the configured path, which wins over the home default.
    pub fn resolve_path(&self) -> PathBuf {
        if let Ok(path) = env::var("TERMCHAT_KEY_FILE")
            && !path.trim().is_empty()
        {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_KEY_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub description: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub about: String,
    #[serde(default)]
    pub social: Vec<SocialLink>,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            about: "A terminal-style chat interface: local commands up front, a streaming AI assistant behind them.".to_string(),
            social: vec![
                SocialLink {
                    label: "GitHub".to_string(),
                    url: "https://github.com/termchat".to_string(),
                },
                SocialLink {
                    label: "Website".to_string(),
                    url: "https://termchat.dev".to_string(),
                },
            ],
            projects: Vec::new(),
        }
    }
}

impl Default for TermchatConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            key_store: KeyStoreConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl TermchatConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("TERMCHAT_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        Self::load_or_create_at(&path).map(|(cfg, created)| (cfg, path, created))
    }

    pub fn load_or_create_at(path: &Path) -> Result<(Self, bool), ConfigError> {
        if path.exists() {
            let cfg = Self::load(path)?;
            return Ok((cfg, false));
        }

        let cfg = Self::default();
        cfg.save(path)?;
        Ok((cfg, true))
    }

    pub fn validate_and_prepare(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.server.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server.base_url cannot be empty".to_string(),
            ));
        }
        if self.server.timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "server.timeout_ms must be positive".to_string(),
            ));
        }
        if self.model.model_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.model_id cannot be empty".to_string(),
            ));
        }
        if self.model.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.endpoint cannot be empty".to_string(),
            ));
        }
        if self.model.api_key_env.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.api_key_env cannot be empty".to_string(),
            ));
        }
        if self
            .profile
            .projects
            .iter()
            .any(|project| project.name.trim().is_empty())
        {
            return Err(ConfigError::ValidationFailed(
                "profile.projects entries need a name".to_string(),
            ));
        }
        let key_path = self.key_store.resolve_path();
        if let Some(parent) = key_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
