//! Common utilities and types shared across insight

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;

pub use config::{BackendKind, Config, MetricsConfig};
pub use error::{Error, ErrorKind, Result};
pub use metrics::{CounterMirror, MetricsRegistry, MirrorSample};
