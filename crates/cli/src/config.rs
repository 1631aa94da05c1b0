//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server used when neither the flag, `RELAY_URL` nor the config file set one
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay base URL
    pub server_url: Option<String>,
    /// Reconnect attempts before a watch command gives up
    pub max_retries: Option<u32>,
}

impl Config {
    /// Load configuration from `~/.config/relayctl/config.json`, if present
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Get the configuration file path
    fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("relayctl").join("config.json"))
    }

    /// Flag or environment value first, then the file, then the default
    pub fn server_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.server_url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }

    pub fn max_retries(&self, flag: Option<u32>) -> Option<u32> {
        flag.or(self.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.server_url.is_none());
        assert_eq!(config.server_url(None), DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_file_values_yield_to_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server_url": "http://relay:9000", "max_retries": 3}}"#).unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server_url(None), "http://relay:9000");
        assert_eq!(
            config.server_url(Some("http://other:1".to_string())),
            "http://other:1"
        );
        assert_eq!(config.max_retries(None), Some(3));
        assert_eq!(config.max_retries(Some(7)), Some(7));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
