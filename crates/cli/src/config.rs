use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::reconciler::PollConfig;

/// CLI configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Base URL of the greenops server
    pub server_url: String,

    /// Seconds between status polls
    pub poll_interval_secs: u64,

    /// Polls before `wait` gives up
    pub max_poll_attempts: u32,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    /// Converged polls without counter movement before forcing completion
    pub stall_threshold: u32,

    /// Upper bound on a whole `wait`, whatever the poll budget says
    pub wait_timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3001".to_string(),
            poll_interval_secs: 5,
            max_poll_attempts: 60,
            request_timeout_secs: 60,
            stall_threshold: 3,
            wait_timeout_secs: 900,
        }
    }
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/greenops/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("greenops");
        Ok(config_dir)
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    /// Returns default config if the file does not exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if !config_path.exists() {
            debug!(?config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!(?config_path, "Loading config");
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config: {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", config_path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs.max(1))
    }

    /// Polling parameters, with optional per-command overrides.
    pub fn poll_config(
        &self,
        poll_interval_secs: Option<u64>,
        max_attempts: Option<u32>,
    ) -> PollConfig {
        let interval = poll_interval_secs.unwrap_or(self.poll_interval_secs);
        PollConfig {
            poll_interval: Duration::from_secs(interval),
            max_attempts: max_attempts.unwrap_or(self.max_poll_attempts).max(1),
            stall_threshold: self.stall_threshold.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.server_url, "http://localhost:3001");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.max_poll_attempts, 60);
        assert_eq!(config.stall_threshold, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let raw = "server_url = \"https://greenops.internal\"\nstall_threshold = 5\n";
        let config: CliConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server_url, "https://greenops.internal");
        assert_eq!(config.stall_threshold, 5);
        assert_eq!(config.wait_timeout_secs, 900);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("greenops-cli-test-missing/config.toml");
        let config = CliConfig::load(path.to_str()).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_poll_config_overrides() {
        let config = CliConfig::default();
        let poll = config.poll_config(Some(1), Some(0));
        assert_eq!(poll.poll_interval, Duration::from_secs(1));
        assert_eq!(poll.max_attempts, 1);
        assert_eq!(poll.stall_threshold, 3);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CliConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: CliConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
