use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub counters: CounterConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public address used when rewriting readme links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_address: Option<String>,
}

impl ServerConfig {
    pub fn base_address(&self) -> String {
        self.base_address
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
    #[serde(default)]
    pub background_refresh: bool,
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Pause before each asset request is handled.
    #[serde(default = "default_asset_delay")]
    pub asset_delay_ms: u64,
    #[serde(default = "default_max_tap_bytes")]
    pub max_tap_bytes: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest request body accepted for forwarding to an origin.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,
}

impl ProxyConfig {
    pub fn asset_delay(&self) -> Duration {
        Duration::from_millis(self.asset_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterConfig {
    #[serde(default)]
    pub backend: CounterBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    /// Shared secret for `/import`. Imports are disabled without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_address: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            refresh_interval_seconds: default_refresh_interval(),
            fetch_timeout_ms: default_fetch_timeout(),
            background_refresh: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            asset_delay_ms: default_asset_delay(),
            max_tap_bytes: default_max_tap_bytes(),
            connect_timeout_ms: default_connect_timeout(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5002
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("registry.json")
}

fn default_refresh_interval() -> u64 {
    100
}

fn default_fetch_timeout() -> u64 {
    10_000
}

fn default_asset_delay() -> u64 {
    2_000
}

fn default_max_tap_bytes() -> usize {
    1024 * 1024
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_max_request_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("installs.db")
}
