//! Configuration loading and types for bleepgate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: gateway behaviour, multipart emulation, the storage backend,
//! logging and metrics.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Facade settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Multipart upload emulation settings.
    #[serde(default)]
    pub multipart: MultipartConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Gateway facade configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// AWS region reported as every bucket's location (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Per-request deadline in seconds (0 = no deadline).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Page size used when a listing asks for 0 keys.
    #[serde(default = "default_max_keys")]
    pub default_max_keys: usize,

    /// Owner ID reported when a V2 listing asks for owners.
    #[serde(default = "default_owner")]
    pub owner: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            request_timeout_secs: default_request_timeout(),
            default_max_keys: default_max_keys(),
            owner: default_owner(),
        }
    }
}

/// Multipart upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartConfig {
    /// Sessions older than this are aborted by the collector.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Interval between collector runs (0 disables the collector).
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Minimum size of every part but the last (0 = no minimum).
    #[serde(default)]
    pub min_part_size: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            gc_interval_secs: default_gc_interval(),
            min_part_size: 0,
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
///
/// Metrics are recorded unconditionally; `metrics` controls whether the
/// Prometheus exporter is installed.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus exporter.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Exporter listen address.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            metrics_listen: default_metrics_listen(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory`, `local` or `manta`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// Manta storage configuration.
    #[serde(default)]
    pub manta: Option<MantaStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            memory: MemoryStorageConfig::default(),
            local: LocalStorageConfig::default(),
            manta: None,
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Manta storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MantaStorageConfig {
    /// Manta account owning the `/stor` tree.
    pub account: String,
    /// Service endpoint (defaults to the public Manta URL).
    #[serde(default)]
    pub endpoint: String,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_manta_timeout")]
    pub timeout_secs: u64,
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_keys() -> usize {
    1000
}

fn default_owner() -> String {
    "bleepgate".to_string()
}

fn default_stale_after() -> u64 {
    // Two weeks, the usual multipart expiry.
    14 * 24 * 3600
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_manta_timeout() -> u64 {
    60
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
