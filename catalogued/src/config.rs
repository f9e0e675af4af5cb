use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use catalogue_shared::protocol::{CATALOGUE_COLLECTION, VERSIONS_COLLECTION};
use crate::gateway::Collections;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Level for this crate's events, e.g. "info" or "debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Elasticsearch,
    /// In-process store, nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_catalogue_index")]
    pub catalogue_index: String,
    #[serde(default = "default_versions_index")]
    pub versions_index: String,
    /// Create both indices with their mappings at startup
    #[serde(default = "default_true")]
    pub create_indices: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline applied to every request's context
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How long /health reports shutting down before in-flight requests are cancelled
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_service_name() -> String {
    "catalogue".to_string()
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_catalogue_index() -> String {
    CATALOGUE_COLLECTION.to_string()
}

fn default_versions_index() -> String {
    VERSIONS_COLLECTION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "[::]:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: default_backend_url(),
            username: None,
            password: None,
            request_timeout_secs: default_backend_timeout(),
            catalogue_index: default_catalogue_index(),
            versions_index: default_versions_index(),
            create_indices: default_true(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl BackendConfig {
    pub fn collections(&self) -> Collections {
        Collections {
            entries: self.catalogue_index.clone(),
            versions: self.versions_index.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
