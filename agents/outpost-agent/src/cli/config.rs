//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Main configuration structure for the Outpost Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique identifier for this agent
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Display name shown by the server
    #[serde(default = "default_name")]
    pub name: String,

    /// Server connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Shell session settings
    #[serde(default)]
    pub shell: ShellConfig,

    /// File handler settings
    #[serde(default)]
    pub files: FilesConfig,

    /// Log handler settings
    #[serde(default)]
    pub logs: LogsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL of the server's agent endpoint
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Shared credential or signed agent token
    #[serde(default)]
    pub token: String,

    /// Delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Liveness ping interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Status push interval in seconds
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// How long to wait for the auth reply
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// How long to wait for the connection to open
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Stop the agent when the server rejects the credential
    #[serde(default = "default_true")]
    pub exit_on_auth_failure: bool,

    /// Retry delay after a rejected credential when not exiting
    #[serde(default = "default_auth_retry_interval")]
    pub auth_retry_interval_ms: u64,
}

/// Shell session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Interpreter to spawn; falls back to /bin/sh when unset and bash is missing
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Directory the session changes into before its first command
    #[serde(default)]
    pub initial_dir: Option<String>,

    /// Timeout used when a request does not carry one
    #[serde(default = "default_command_timeout")]
    pub default_timeout_secs: u64,

    /// Extra patterns rejected in addition to the built-in denylist
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

/// File handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Confine file operations to this directory
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Seconds without a chunk before an unfinished upload is restarted
    #[serde(default = "default_upload_idle_timeout")]
    pub upload_idle_timeout_secs: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: None,
            upload_idle_timeout_secs: default_upload_idle_timeout(),
        }
    }
}

/// Log handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Directories whose files may be listed and read
    #[serde(default = "default_log_dirs")]
    pub directories: Vec<PathBuf>,

    /// Upper bound on lines returned by one request
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
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

// Default value functions
fn default_agent_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_server_url() -> String {
    "ws://localhost:8080/ws/agent".to_string()
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    60
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_auth_retry_interval() -> u64 {
    60_000
}

fn default_command_timeout() -> u64 {
    300
}

fn default_log_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/log")]
}

fn default_upload_idle_timeout() -> u64 {
    600
}

fn default_max_lines() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            token: String::new(),
            reconnect_interval_ms: default_reconnect_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            status_interval_secs: default_status_interval(),
            auth_timeout_secs: default_auth_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            exit_on_auth_failure: true,
            auth_retry_interval_ms: default_auth_retry_interval(),
        }
    }
}

impl ServerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            initial_dir: None,
            default_timeout_secs: default_command_timeout(),
            blocked_patterns: Vec::new(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            directories: default_log_dirs(),
            max_lines: default_max_lines(),
        }
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
        Self::default_config()
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            agent_id: default_agent_id(),
            name: default_name(),
            server: ServerConfig::default(),
            shell: ShellConfig::default(),
            files: FilesConfig::default(),
            logs: LogsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}
