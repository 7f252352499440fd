//! HotPush Configuration Module
//! Handles loading and validating hotpush.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "hotpush.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub publish: PublishConfig,

    /// Directory the config was loaded from; relative paths resolve here
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL clients use to reach the endpoint; derived from host/port when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default = "default_releases_dir")]
    pub releases_dir: PathBuf,
    #[serde(default = "default_packages_dir")]
    pub packages_dir: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfig {
    /// How many previous releases get a delta package on publish
    #[serde(default = "default_diff_history")]
    pub diff_history: usize,
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: usize,
}

fn default_port() -> u16 {
    3850
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_releases_dir() -> PathBuf {
    PathBuf::from("releases")
}

fn default_packages_dir() -> PathBuf {
    PathBuf::from("packages")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("audit/audit.jsonl")
}

fn default_diff_history() -> usize {
    3
}

fn default_max_package_bytes() -> usize {
    256 * 1024 * 1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            releases_dir: default_releases_dir(),
            packages_dir: default_packages_dir(),
            audit_log: default_audit_log(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            diff_history: default_diff_history(),
            max_package_bytes: default_max_package_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let mut config: ServerConfig = serde_json::from_str(&content)?;
        config.base_dir = dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Load the config in `dir`, or fall back to defaults when there is none
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(dir) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default_for_dir(dir)),
            other => other,
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_dir(dir: &Path) -> Self {
        Self {
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            publish: PublishConfig::default(),
            base_dir: dir.to_path_buf(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish.max_package_bytes == 0 {
            return Err(ConfigError::Invalid(
                "publish.maxPackageBytes must be greater than zero".to_string(),
            ));
        }
        if let Some(url) = &self.api.public_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "api.publicUrl must be an http(s) URL, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.resolve(&self.storage.releases_dir)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.resolve(&self.storage.packages_dir)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.resolve(&self.storage.audit_log)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// Base URL without a trailing slash
    pub fn public_url(&self) -> String {
        match &self.api.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind_addr()),
        }
    }
}
