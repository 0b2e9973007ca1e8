//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/candor/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/candor/` (~/.config/candor/)
//! - Data: `$XDG_DATA_HOME/candor/` (~/.local/share/candor/)
//! - State/Logs: `$XDG_STATE_HOME/candor/` (~/.local/state/candor/)
//!
//! The queue database lives in the data directory. The host application is
//! responsible for encryption-at-rest of that directory; candor assumes the
//! capability is present and does not manage keys.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Queue and batching configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Collector upload configuration
    #[serde(default)]
    pub uploader: UploaderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue, batching, and retention configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Events per upload batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum queued events before enqueue returns QueueFull
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds between periodic flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Seconds between maintenance sweeps (retention, GC, trim)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Days to keep processed events before deletion
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Days to keep dedup tombstones after their event is delivered
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: i64,

    /// Failed-attempt count at which an event is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Base for the per-event retry backoff, in seconds
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: i64,

    /// Ceiling for the per-event retry backoff, in seconds
    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_queue_size: default_max_queue_size(),
            flush_interval_secs: default_flush_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            retention_days: default_retention_days(),
            tombstone_retention_days: default_tombstone_retention_days(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base(),
            retry_cap_secs: default_retry_cap(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_flush_interval() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_retention_days() -> i64 {
    7
}

fn default_tombstone_retention_days() -> i64 {
    30
}

fn default_max_retries() -> i64 {
    10
}

fn default_retry_base() -> i64 {
    2
}

fn default_retry_cap() -> i64 {
    3600
}

impl PipelineConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err(Error::Config(
                "pipeline.batch_size must be between 1 and 500".to_string(),
            ));
        }
        if self.max_queue_size < self.batch_size {
            return Err(Error::Config(
                "pipeline.max_queue_size must be at least pipeline.batch_size".to_string(),
            ));
        }
        if self.retry_base_secs <= 0 || self.retry_cap_secs < self.retry_base_secs {
            return Err(Error::Config(
                "pipeline retry backoff requires 0 < retry_base_secs <= retry_cap_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Collector upload configuration
///
/// When enabled, candor uploads queued events to the collector in batches.
/// When disabled, events accumulate locally (subject to retention and
/// capacity limits) and flushes are no-ops.
#[derive(Debug, Deserialize, Clone)]
pub struct UploaderConfig {
    /// Enable/disable uploads
    #[serde(default)]
    pub enabled: bool,

    /// Collector base URL (e.g. `https://collector.example.com`)
    pub server_url: Option<String>,

    /// Stable device identifier sent with every batch
    pub device_id: Option<String>,

    /// API key (from device registration)
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_uploader_timeout")]
    pub timeout_secs: u64,

    /// Delivery attempts per upload call (including the first)
    #[serde(default = "default_uploader_max_attempts")]
    pub max_attempts: u32,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            device_id: None,
            api_key: None,
            timeout_secs: default_uploader_timeout(),
            max_attempts: default_uploader_max_attempts(),
        }
    }
}

fn default_uploader_timeout() -> u64 {
    30
}

fn default_uploader_max_attempts() -> u32 {
    3
}

impl UploaderConfig {
    /// Check if the uploader is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.server_url.is_some() && self.device_id.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.server_url.is_none() {
            return Err(Error::Config(
                "uploader.server_url is required when uploader is enabled".to_string(),
            ));
        }
        if self.device_id.is_none() {
            return Err(Error::Config(
                "uploader.device_id is required when uploader is enabled".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "uploader.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.pipeline.validate()?;
        config.uploader.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/candor/config.toml` (~/.config/candor/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("candor").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    ///
    /// `$XDG_DATA_HOME/candor/` (~/.local/share/candor/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("candor")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/candor/` (~/.local/state/candor/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("candor")
    }

    /// Returns the queue database file path
    ///
    /// `$XDG_DATA_HOME/candor/queue.db` (~/.local/share/candor/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/candor/candor.log` (~/.local/state/candor/candor.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("candor.log")
    }
}
