//! CLI Configuration
//!
//! Server URL and API key stored in ~/.outpost/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    /// Agent used when a command omits one
    pub default_agent: Option<String>,
}

impl Config {
    /// Get the config file path (~/.outpost/config.toml)
    pub fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".outpost").join("config.toml"))
    }

    /// Load config from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config at {}", path.display()))?;
        Ok(())
    }

    /// Server base URL without a trailing slash
    pub fn server_url(&self) -> &str {
        self.server_url
            .as_deref()
            .unwrap_or(DEFAULT_SERVER_URL)
            .trim_end_matches('/')
    }

    /// Agent named on the command line, else the configured default
    pub fn agent<'a>(&'a self, explicit: Option<&'a str>) -> Result<&'a str> {
        explicit
            .or(self.default_agent.as_deref())
            .context("No agent given and no default_agent configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_url(), "http://localhost:8080");
        assert!(config.agent(None).is_err());
        assert_eq!(config.agent(Some("web-01")).unwrap(), "web-01");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            server_url: Some("https://outpost.example.com/".to_string()),
            api_key: Some("k".to_string()),
            default_agent: Some("db-01".to_string()),
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server_url(), "https://outpost.example.com");
        assert_eq!(loaded.api_key.as_deref(), Some("k"));
        assert_eq!(loaded.agent(None).unwrap(), "db-01");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.api_key.is_none());
    }
}
