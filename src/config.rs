//! Configuration management for the publish scheduler
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool configuration
    pub pool: PoolConfig,

    /// Dirty queue configuration
    pub queue: QueueConfig,

    /// Cluster coordination configuration
    pub cluster: ClusterConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent publish workers per partition
    pub workers: usize,

    /// Grace period given to in-flight tasks after cancellation, in seconds
    pub shutdown_grace_secs: u64,

    /// Minimum pages processed for a run to update the historical ETA baseline
    pub representative_min_pages: u64,
}

/// Dirty queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQLite database path for queue rows and phase history
    pub db_path: PathBuf,

    /// Bounded buffer size of the background row remover
    pub remover_buffer: usize,

    /// Number of handled keys deleted per grouped statement
    pub remover_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/publish_queue.db"),
            remover_buffer: 256,
            remover_batch: 64,
        }
    }
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address the coordination server binds to
    pub listen_addr: String,

    /// URL of the instance owning the pipeline, if not this one
    pub owner_url: Option<String>,

    /// Remote call timeout in seconds
    pub timeout_secs: u64,

    /// Retry count for failed remote calls
    pub retry_count: u32,

    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let workers = std::env::var("PRESSLINE_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(8);

        let shutdown_grace_secs = std::env::var("PRESSLINE_SHUTDOWN_GRACE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let representative_min_pages = std::env::var("PRESSLINE_REPRESENTATIVE_MIN_PAGES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(100);

        let db_path = std::env::var("PRESSLINE_DB_PATH")
            .unwrap_or_else(|_| String::from("data/publish_queue.db"))
            .into();

        let remover_buffer = std::env::var("PRESSLINE_REMOVER_BUFFER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(256);

        let remover_batch = std::env::var("PRESSLINE_REMOVER_BATCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(64);

        let listen_addr = std::env::var("PRESSLINE_LISTEN_ADDR")
            .unwrap_or_else(|_| String::from("127.0.0.1:7065"));

        let owner_url = std::env::var("PRESSLINE_OWNER_URL").ok();

        let timeout_secs = std::env::var("PRESSLINE_CLUSTER_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);

        let log_level =
            std::env::var("PRESSLINE_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format =
            std::env::var("PRESSLINE_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            pool: PoolConfig {
                workers,
                shutdown_grace_secs,
                representative_min_pages,
            },
            queue: QueueConfig {
                db_path,
                remover_buffer,
                remover_batch,
            },
            cluster: ClusterConfig {
                listen_addr,
                owner_url,
                timeout_secs,
                retry_count: 3,
                retry_delay_ms: 1000,
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            anyhow::bail!("pool.workers must be greater than 0");
        }

        if self.queue.remover_buffer == 0 {
            anyhow::bail!("queue.remover_buffer must be greater than 0");
        }

        if self.queue.remover_batch == 0 {
            anyhow::bail!("queue.remover_batch must be greater than 0");
        }

        if self.cluster.timeout_secs == 0 {
            anyhow::bail!("cluster.timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Get the worker shutdown grace period as Duration
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.pool.shutdown_grace_secs)
    }

    /// Get the cluster call timeout as Duration
    #[must_use]
    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig {
                workers: 8,
                shutdown_grace_secs: 30,
                representative_min_pages: 100,
            },
            queue: QueueConfig::default(),
            cluster: ClusterConfig {
                listen_addr: String::from("127.0.0.1:7065"),
                owner_url: None,
                timeout_secs: 10,
                retry_count: 3,
                retry_delay_ms: 1000,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.workers, 8);
    }

    #[test]
    fn test_invalid_worker_count() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config_default() {
        let queue = QueueConfig::default();
        assert_eq!(queue.db_path, PathBuf::from("data/publish_queue.db"));
        assert_eq!(queue.remover_buffer, 256);
        assert_eq!(queue.remover_batch, 64);
    }

    #[test]
    fn test_grace_period_conversion() {
        let config = Config::default();
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            [pool]
            workers = 4
            shutdown_grace_secs = 5
            representative_min_pages = 10

            [queue]
            db_path = "/tmp/press.db"
            remover_buffer = 32
            remover_batch = 8

            [cluster]
            listen_addr = "0.0.0.0:9000"
            timeout_secs = 3
            retry_count = 1
            retry_delay_ms = 100

            [logging]
            level = "debug"
            format = "json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.cluster.listen_addr, "0.0.0.0:9000");
        assert!(config.cluster.owner_url.is_none());
        assert!(config.validate().is_ok());
    }
}
