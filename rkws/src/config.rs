use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // ip:port the control-plane API listens on
    pub addr: String,
    // Xline endpoints
    pub xline_config: XlineConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(flatten)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// How the manager reaches the daemon running next to a workspace pod.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    // TLS server name presented when dialing a daemon
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            server_name: default_server_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Attempts a mark operation makes before giving up on write conflicts.
    #[serde(default = "default_mark_retries")]
    pub mark_retries: u32,
    #[serde(default)]
    pub workspace_classes: HashMap<String, WorkspaceClassConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            snapshot: SnapshotConfig::default(),
            mark_retries: default_mark_retries(),
            workspace_classes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl SnapshotConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms).max(self.poll_interval())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceClassConfig {
    #[serde(default)]
    pub pvc: PvcConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PvcConfig {
    /// Volume snapshot class used for workspaces of this class; the cluster
    /// default applies when unset.
    pub snapshot_class: Option<String>,
}

fn default_daemon_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_mark_retries() -> u32 {
    5
}

fn default_ready_timeout_secs() -> u64 {
    180
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_poll_interval_ms() -> u64 {
    5000
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
