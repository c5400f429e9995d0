//! Relay configuration
//!
//! Loads server settings from an optional TOML file. Every field has a default, so a
//! missing file or a partial file is fine.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "bb-relay.toml";

/// Default WebSocket endpoint path
pub const DEFAULT_PATH: &str = "/bbService";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Listener settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Endpoint path clients must connect to
    pub path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// Root relay configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults if it does not exist
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: RelayConfig = toml::from_str(&content)?;
        config.server.path = normalize_path(&config.server.path);
        Ok(config)
    }

    /// Apply command line overrides on top of file values
    pub fn with_overrides(
        mut self,
        bind: Option<String>,
        port: Option<u16>,
        path: Option<String>,
    ) -> Self {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(path) = path {
            self.server.path = normalize_path(&path);
        }
        self
    }
}

/// Ensure an endpoint path starts with a single `/`
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}
