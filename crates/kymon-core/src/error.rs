use std::path::PathBuf;

use thiserror::Error;

/// Why a tick could not read the engine's queue state.
#[derive(Debug, Error)]
pub enum QueueSourceError {
    #[error("queue source unavailable: {0}")]
    Unavailable(String),
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed {endpoint} payload: {source}")]
    Malformed {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A configuration value that could not be used. Never fatal: the loader logs
/// it and falls back to the default.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file {} is not a JSON object", path.display())]
    NotAnObject { path: PathBuf },
    #[error("invalid value for {key}: expected {expected}, got {value}")]
    InvalidValue {
        key: String,
        expected: &'static str,
        value: String,
    },
}
