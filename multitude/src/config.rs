//! Configuration for the scrape proxy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use multitude_common::{Credentials, LoggingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::EvictionPolicy;

/// Paths served by the proxy itself; the telemetry path may not shadow them.
pub const RESERVED_PATHS: [&str; 2] = ["/health", "/targets"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Credentials combined with every target address.
    #[serde(default = "default_credentials")]
    pub credentials: Credentials,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Connection settings passed to every exporter.
    #[serde(default)]
    pub mongodb: MongodbConfig,

    /// Collector enable flags passed to every exporter.
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Cache eviction settings.
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_credentials() -> Credentials {
    Credentials::new("", "")
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:58080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for scrape requests (default: "/metrics").
    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,

    /// TLS / basic-auth web config file, passed through to exporters.
    #[serde(default)]
    pub tls_config: Option<PathBuf>,
}

fn default_listen() -> String {
    "0.0.0.0:58080".to_string()
}

fn default_telemetry_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            telemetry_path: default_telemetry_path(),
            tls_config: None,
        }
    }
}

/// Per-target connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongodbConfig {
    /// Replica set name in the connection string (default: "replset").
    #[serde(default = "default_replica_set")]
    pub replica_set: String,

    /// Connect directly to a single host.
    #[serde(default)]
    pub direct_connect: bool,

    /// Reuse one connection pool across scrapes.
    #[serde(default)]
    pub global_conn_pool: bool,

    /// Connection timeout in milliseconds (default: 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Comma-separated `db.collection` list for `$collStats`.
    #[serde(default)]
    pub collstats_colls: String,

    /// Comma-separated `db.collection` list for `$indexStats`.
    #[serde(default)]
    pub indexstats_colls: String,

    /// Disable heavy collectors above this many collections (0 = no limit).
    #[serde(default)]
    pub collstats_limit: u32,

    /// Autodiscover collections.
    #[serde(default)]
    pub discovering_mode: bool,

    /// Emit legacy-compatible metrics.
    #[serde(default)]
    pub compatible_mode: bool,

    /// Replace `-1` with `_DESC` in descending index names.
    #[serde(default)]
    pub override_descending_index: bool,
}

fn default_replica_set() -> String {
    "replset".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for MongodbConfig {
    fn default() -> Self {
        Self {
            replica_set: default_replica_set(),
            direct_connect: false,
            global_conn_pool: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            collstats_colls: String::new(),
            indexstats_colls: String::new(),
            collstats_limit: 0,
            discovering_mode: false,
            compatible_mode: false,
            override_descending_index: false,
        }
    }
}

/// Collector enable flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default)]
    pub diagnostic_data: bool,
    #[serde(default)]
    pub replicaset_status: bool,
    #[serde(default)]
    pub dbstats: bool,
    #[serde(default)]
    pub top_metrics: bool,
    #[serde(default)]
    pub index_stats: bool,
    #[serde(default)]
    pub coll_stats: bool,
    /// Enable every collector.
    #[serde(default)]
    pub collect_all: bool,
}

/// Cache eviction configuration. Nothing is evicted unless a limit is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Evict targets not scraped for this long (seconds).
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Keep at most this many targets, evicting least recently used first.
    #[serde(default)]
    pub max_targets: Option<usize>,

    /// How often to run the eviction sweep (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60 // 1 minute
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: None,
            max_targets: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl EvictionConfig {
    /// The policy applied by the periodic sweep.
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_targets: self.max_targets,
        }
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.web.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.web.listen
            )));
        }

        if !self.web.telemetry_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Telemetry path must start with /".to_string(),
            ));
        }

        if RESERVED_PATHS.contains(&self.web.telemetry_path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Telemetry path {} is reserved",
                self.web.telemetry_path
            )));
        }

        if self.mongodb.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.eviction.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }

        if self.eviction.max_targets == Some(0) {
            return Err(ConfigError::Validation(
                "max_targets must be > 0".to_string(),
            ));
        }

        if self.eviction.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "idle_timeout_secs must be > 0".to_string(),
            ));
        }

        multitude_common::parse_filter(&self.logging.level)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            credentials: default_credentials(),
            web: WebConfig::default(),
            mongodb: MongodbConfig::default(),
            collectors: CollectorsConfig::default(),
            eviction: EvictionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
