//! Configuration for the insight service

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`INSIGHT__HTTP_ADDR`, `INSIGHT__METRICS__NAMESPACE`, ...)
pub const ENV_PREFIX: &str = "INSIGHT";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for the HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Path of the counter store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Storage engine behind the counter store
    #[serde(default)]
    pub backend: BackendKind,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Verbose logging with source locations
    #[serde(default)]
    pub debug: bool,

    /// Upper bound on graceful shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Runtime worker threads, one per CPU when unset
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Naming of the exported counter family
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("insight.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_max_body_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Rocksdb,
    Sled,
    Memory,
}

/// Prometheus naming for the mirrored counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
    #[serde(default = "default_metrics_subsystem")]
    pub subsystem: String,
    #[serde(default = "default_metrics_name")]
    pub name: String,
}

fn default_metrics_namespace() -> String {
    "infinity".to_string()
}
fn default_metrics_subsystem() -> String {
    "insight".to_string()
}
fn default_metrics_name() -> String {
    "calls_sum".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_metrics_namespace(),
            subsystem: default_metrics_subsystem(),
            name: default_metrics_name(),
        }
    }
}

impl MetricsConfig {
    /// Fully qualified metric name, empty parts skipped
    pub fn full_name(&self) -> String {
        [&self.namespace, &self.subsystem, &self.name]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            db_path: default_db_path(),
            backend: BackendKind::default(),
            log_level: default_log_level(),
            debug: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
            worker_threads: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `INSIGHT__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::InvalidConfig(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() && self.backend != BackendKind::Memory {
            return Err(Error::InvalidConfig("db_path must not be empty".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(Error::InvalidConfig("max_body_bytes must be > 0".into()));
        }
        if self.worker_threads == Some(0) {
            return Err(Error::InvalidConfig("worker_threads must be > 0".into()));
        }
        if self.metrics.name.is_empty() {
            return Err(Error::InvalidConfig("metrics.name must not be empty".into()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Worker threads for the async runtime
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Level used when `RUST_LOG` is unset
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}
