//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the edge agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identity registered with the hub
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Hub the device belongs to
    #[serde(default = "default_hub_hostname")]
    pub hub_hostname: String,

    /// Cloud connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Local backup of the last good deployment
    #[serde(default)]
    pub backup: BackupConfig,

    /// Inbound stream settings
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Workload API used to encrypt the backup
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cloud connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL of the hub's device endpoint
    #[serde(default = "default_connection_url")]
    pub url: String,

    /// Reconnect interval in milliseconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Seconds between periodic state refreshes
    #[serde(default = "default_refresh_frequency")]
    pub refresh_frequency_secs: u64,

    /// Budget for one direct request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Path of the encrypted backup file
    #[serde(default = "default_backup_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Accept log streams; when off every stream is closed as unsupported
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_streams: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_workload_uri")]
    pub workload_uri: String,

    #[serde(default = "default_module_id")]
    pub module_id: String,

    #[serde(default)]
    pub generation_id: String,

    /// Defaults to the device id
    #[serde(default)]
    pub initialization_vector: Option<String>,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
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
fn default_device_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_hub_hostname() -> String {
    "localhost".to_string()
}

fn default_connection_url() -> String {
    "ws://localhost:8080/devices".to_string()
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_refresh_frequency() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    10
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("/var/lib/syntra/backup.json")
}

fn default_workload_uri() -> String {
    "http://localhost:15580".to_string()
}

fn default_module_id() -> String {
    "edgeAgent".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_connection_url(),
            reconnect_interval_ms: default_reconnect_interval(),
            refresh_frequency_secs: default_refresh_frequency(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path: default_backup_path(),
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_streams: default_max_concurrent(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            workload_uri: default_workload_uri(),
            module_id: default_module_id(),
            generation_id: String::new(),
            initialization_vector: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: default_docker_socket(),
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

impl ConnectionConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_frequency_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            device_id: default_device_id(),
            hub_hostname: default_hub_hostname(),
            connection: ConnectionConfig::default(),
            backup: BackupConfig::default(),
            streams: StreamsConfig::default(),
            encryption: EncryptionConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            bail!("device_id must not be empty");
        }
        let connection = &self.connection;
        if connection.reconnect_interval_ms == 0 {
            bail!("connection.reconnect_interval_ms must be greater than zero");
        }
        if connection.refresh_frequency_secs == 0 {
            bail!("connection.refresh_frequency_secs must be greater than zero");
        }
        if connection.request_timeout_secs == 0 {
            bail!("connection.request_timeout_secs must be greater than zero");
        }
        if connection.max_concurrent_requests == 0 {
            bail!("connection.max_concurrent_requests must be greater than zero");
        }
        if self.streams.max_concurrent_streams == 0 {
            bail!("streams.max_concurrent_streams must be greater than zero");
        }
        Ok(())
    }

    /// IV handed to the workload API
    pub fn initialization_vector(&self) -> &str {
        self.encryption
            .initialization_vector
            .as_deref()
            .unwrap_or(&self.device_id)
    }
}
