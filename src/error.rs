use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Counter store error: {0}")]
    Counter(#[from] CounterError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Unknown asset part '{part}' for plugin {plugin}")]
    UnknownAssetPart { plugin: String, part: String },

    #[error("Plugin {plugin} has no {asset} url")]
    MissingAsset { plugin: String, asset: &'static str },

    #[error("Origin request failed: {0}")]
    Origin(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(u64),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt counter value for {key}: {value}")]
    CorruptValue { key: String, value: String },

    #[error("Install count for {0} would overflow")]
    Overflow(String),
}

impl From<rusqlite::Error> for CounterError {
    fn from(err: rusqlite::Error) -> Self {
        CounterError::Database(err.to_string())
    }
}

/// Failure to obtain a usable manifest. Always absorbed by the cache engine.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Origin returned status {0}")]
    Status(u16),

    #[error("Malformed manifest: {reason}")]
    Malformed { reason: String, body: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Request(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl warp::reject::Reject for ProxyError {}
