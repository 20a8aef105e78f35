//! Configuration for a worker node.
//!
//! Loaded from a TOML file; every field has a default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, WorkerError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Other members of the cluster, reachable over the admin HTTP API
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Group (shard) this node replicates
    #[serde(default = "default_group_id")]
    pub group_id: u32,

    /// Admin URL of the node hosting the cluster's oracle, membership and
    /// id lease. Unset on that node itself.
    #[serde(default)]
    pub authority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// zstd level used for backup payloads (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// 32-byte AES-256 key; backups are encrypted when set
    #[serde(default)]
    pub encryption_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Attempts per group before a restore proposal is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between proposal attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Prefix events with their module path
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Colored output; turn off when logs go to a file or journald
    #[serde(default = "default_true")]
    pub ansi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub group_id: u32,
    pub url: String,
    /// Whether this peer currently leads its group's consensus log
    #[serde(default)]
    pub leader: bool,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "alpha-01".to_string())
}

fn default_group_id() -> u32 {
    1
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: default_node_id(),
            group_id: default_group_id(),
            authority: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            compression_level: default_compression_level(),
            encryption_key_file: None,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        RestoreConfig {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl RestoreConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| WorkerError::Config(e.to_string()))?;
        if config.restore.max_attempts == 0 {
            return Err(WorkerError::Config(
                "restore.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
