//! Agent configuration
//!
//! Read from an optional TOML file and from `AGENT_*` environment
//! variables, the latter taking precedence.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use telemetry_lib::manager::ManagerConfig;

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

pub const DEFAULT_CONFIG_FILE: &str = "/etc/vm-telemetry/agent.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory holding one `<namespace>_<name>/vm.json` per VM
    #[serde(default = "default_vm_dir")]
    pub vm_dir: PathBuf,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Round timeout of the collector
    #[serde(default = "default_collection_timeout")]
    pub collection_timeout_secs: u64,

    /// Concurrent scrapes allowed per VM source
    #[serde(default = "default_max_requests_per_key")]
    pub max_requests_per_key: usize,

    #[serde(default = "default_channel_requests_per_second")]
    pub channel_requests_per_second: f64,

    #[serde(default = "default_channel_burst")]
    pub channel_burst: u32,

    #[serde(default = "default_channel_max_connect_attempts")]
    pub channel_max_connect_attempts: u32,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_vm_dir() -> PathBuf {
    PathBuf::from("/var/run/vm-telemetry/vms")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_collection_timeout() -> u64 {
    10
}

fn default_max_requests_per_key() -> usize {
    1
}

fn default_channel_requests_per_second() -> f64 {
    5.0
}

fn default_channel_burst() -> u32 {
    1
}

fn default_channel_max_connect_attempts() -> u32 {
    6
}

impl AgentConfig {
    /// Load from the file named by `AGENT_CONFIG_FILE` and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(Path::new(&file))
    }

    /// Load from `file` (if present) overridden by the environment
    pub fn load_from(file: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.refresh_interval_secs > 0, "refresh_interval_secs must be positive");
        anyhow::ensure!(
            self.collection_timeout_secs > 0,
            "collection_timeout_secs must be positive"
        );
        anyhow::ensure!(self.max_requests_per_key > 0, "max_requests_per_key must be positive");
        anyhow::ensure!(self.channel_burst > 0, "channel_burst must be positive");
        anyhow::ensure!(
            self.channel_requests_per_second > 0.0,
            "channel_requests_per_second must be positive"
        );
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.collection_timeout_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            requests_per_second: self.channel_requests_per_second,
            burst: self.channel_burst,
            max_connect_attempts: self.channel_max_connect_attempts,
            ..ManagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.collection_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_requests_per_key, 1);

        let manager = config.manager_config();
        assert_eq!(manager.burst, 1);
        assert_eq!(manager.max_connect_attempts, 6);
        assert_eq!(manager.initial_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_file_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "node_name = \"node-7\"\nvm_dir = \"/srv/vms\"\nrefresh_interval_secs = 30\nchannel_burst = 3\n",
        )
        .unwrap();

        let config = AgentConfig::load_from(&path).unwrap();
        assert_eq!(config.node_name, "node-7");
        assert_eq!(config.vm_dir, PathBuf::from("/srv/vms"));
        assert_eq!(config.refresh_interval_secs, 30);
        assert_eq!(config.channel_burst, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "channel_burst = 0\n").unwrap();

        assert!(AgentConfig::load_from(&path).is_err());
    }
}
