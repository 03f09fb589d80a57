//! Configuration management.

use crate::error::{KilnError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Persistent configuration for the KILN build service and daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the daemon listens on for WebSocket clients.
    pub listen_addr: String,
    /// Root directory for per-build workspaces.
    pub work_dir: String,
    /// Root directory for the filesystem-backed object store.
    pub object_store_dir: String,
    /// Docker Engine API endpoint. `DOCKER_HOST` overrides this at runtime.
    pub engine_host: String,
    /// Hard ceiling on total job duration, in seconds.
    pub job_timeout_secs: u64,
    /// Timeout applied to each resource download, in seconds.
    pub http_timeout_secs: u64,
    /// Timeout applied to each secret fetch, in seconds.
    pub secret_timeout_secs: u64,
    /// Timeout applied to each engine API call (excluding streamed builds).
    pub engine_timeout_secs: u64,
    /// Maximum size of a single inbound WebSocket message, in bytes.
    pub max_message_bytes: usize,
    /// Capacity of each per-connection send queue.
    pub send_queue_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7543".to_string(),
            work_dir: paths::workspace_dir().to_string_lossy().to_string(),
            object_store_dir: paths::object_store_dir().to_string_lossy().to_string(),
            engine_host: "tcp://127.0.0.1:2375".to_string(),
            job_timeout_secs: 3600,
            http_timeout_secs: 120,
            secret_timeout_secs: 10,
            engine_timeout_secs: 60,
            max_message_bytes: 1024 * 1024,
            send_queue_size: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from disk, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::InvalidSpec {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| KilnError::InvalidSpec {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidSpec {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| KilnError::io(path, e))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn secret_timeout(&self) -> Duration {
        Duration::from_secs(self.secret_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}
