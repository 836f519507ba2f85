use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no configured device name contains {marker:?}")]
    NoMatchingDevice { marker: String },
    #[error("invalid finish time {value:?}, expected HH:MM")]
    InvalidFinishTime { value: String },
    #[error("unknown timezone {value:?}")]
    InvalidTimezone { value: String },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device connection is not available")]
    Disconnected,
    #[error("command {path} rejected: {reason}")]
    Rejected { path: &'static str, reason: String },
    #[error("failed to encode command payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PriceFeedError {
    #[error("price request failed: {0}")]
    Request(String),
    #[error("price response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedEventError {
    #[error("state delta is not valid json: {0}")]
    InvalidJson(String),
    #[error("state delta must be a json object, got {found}")]
    NotAnObject { found: &'static str },
}
