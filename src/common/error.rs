//! Error types for insight

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Validation Errors ===
    #[error("Invalid request: {0}")]
    Validation(String),

    // === Storage Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[cfg(feature = "sled-backend")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Counter overflow for app={app} type={counter_type}")]
    Overflow { app: String, counter_type: String },

    // === Corruption Errors ===
    #[error("Corrupted counter app={app} type={counter_type} value={value:?}: {reason}")]
    Corrupted {
        app: String,
        counter_type: String,
        value: String,
        reason: String,
    },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for logging and status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad identifier, reject the single request
    Validation,
    /// Transaction or I/O failure, other counters unaffected
    Store,
    /// Stored bytes are not a valid total, never coerced to zero
    Corruption,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Corrupted { .. } => ErrorKind::Corruption,
            _ => ErrorKind::Store,
        }
    }

    /// Corruption aborts bootstrap and must be surfaced loudly on live requests
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::RocksDb(e)
                if matches!(
                    e.kind(),
                    rocksdb::ErrorKind::Busy
                        | rocksdb::ErrorKind::TryAgain
                        | rocksdb::ErrorKind::TimedOut
                        | rocksdb::ErrorKind::ShutdownInProgress
                ) =>
            {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
