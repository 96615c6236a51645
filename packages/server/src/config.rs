//! Configuration module
//!
//! Server settings loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the Outpost Server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Agent and API credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Registry and request routing settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Credentials accepted from agents and API callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared static credential; also guards the relay API
    #[serde(default)]
    pub api_key: Option<String>,

    /// HS256 secret for signed agent tokens
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Lifetime of tokens minted by `outpost-server token`
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Agents silent for longer than this are dropped
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// How often the registry looks for silent agents
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Reply timeout for relayed requests that do not set one
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a new connection may take to authenticate
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Depth of the registry's command queue
    #[serde(default = "default_queue")]
    pub command_queue: usize,

    /// Depth of each agent's outbound queue
    #[serde(default = "default_queue")]
    pub outbound_queue: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_token_ttl() -> u64 {
    86_400
}

fn default_inactivity_timeout() -> u64 {
    90
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    60
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_queue() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            jwt_secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            request_timeout_secs: default_request_timeout(),
            auth_timeout_secs: default_auth_timeout(),
            command_queue: default_queue(),
            outbound_queue: default_queue(),
        }
    }
}

impl HubConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs.max(1))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth: AuthConfig::default(),
            hub: HubConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))
    }
}
