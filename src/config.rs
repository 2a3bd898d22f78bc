//! Configuration loading and types for the gateway.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section and field has a default, so an empty
//! file (or no file at all) yields a runnable in-memory gateway.

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::acl::Owner;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity reported as owner of every bucket.
    #[serde(default)]
    pub owner: OwnerConfig,

    /// Object store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Multipart upload settings.
    #[serde(default)]
    pub multipart: MultipartConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// AWS region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

impl ServerConfig {
    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bucket owner identity.
#[derive(Debug, Clone, Deserialize)]
pub struct OwnerConfig {
    #[serde(default = "default_owner_id")]
    pub id: String,

    #[serde(default = "default_owner_display_name")]
    pub display_name: String,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            id: default_owner_id(),
            display_name: default_owner_display_name(),
        }
    }
}

impl From<&OwnerConfig> for Owner {
    fn from(cfg: &OwnerConfig) -> Self {
        Owner::new(cfg.id.clone(), cfg.display_name.clone())
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type.  Only `memory` is available.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            max_size_bytes: 0,
        }
    }
}

/// Multipart upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartConfig {
    /// Minimum size of every part except the last (0 = no minimum).
    #[serde(default)]
    pub min_part_size: u64,

    /// Page size for ListParts when the request names none.
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: 0,
            max_parts: default_max_parts(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9012
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_owner_id() -> String {
    "s3gateway".to_string()
}

fn default_owner_display_name() -> String {
    "s3gateway".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_max_parts() -> usize {
    crate::multipart::DEFAULT_MAX_PARTS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
///
/// A missing file is not an error: the defaults are returned instead.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&contents)?;
    if config.storage.backend != "memory" {
        anyhow::bail!("unsupported storage backend: {}", config.storage.backend);
    }
    Ok(config)
}
