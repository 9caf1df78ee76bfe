// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation but ~2-3x slower)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default, faster) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./lreel.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Telemetry configuration (OpenTelemetry metrics).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// OTLP endpoint for metrics export (e.g. `http://localhost:4318/v1/metrics`).
    /// When unset, metrics are collected but not exported.
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enable: true, otlp_endpoint: None, otlp_headers: HashMap::new() }
    }
}

const fn default_true() -> bool {
    true
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for cross-origin requests.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests.
    /// Supports wildcards: "http://localhost:*" matches any port on localhost.
    /// Set to `["*"]` to allow all origins (not recommended for production).
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// HTTP server configuration for the gateway role.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    pub address: String,
    /// CORS configuration for cross-origin requests
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:4580".to_string(), cors: CorsConfig::default() }
    }
}

/// Coordination broker connection.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct BrokerConfig {
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".to_string() }
    }
}

/// Which object store backend to use.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    R2,
    /// In-process store; only meaningful for tests and local experiments.
    Memory,
}

/// Object storage configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// R2 account id (derives the endpoint when `endpoint_url` is unset).
    #[serde(default)]
    pub account_id: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, R2).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Recording record database connection.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct RecordsConfig {
    pub database_url: String,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        // mode=rwc so a fresh checkout can run without pre-creating the file
        Self { database_url: "sqlite://livereel.db?mode=rwc".to_string() }
    }
}

const fn default_max_message_bytes() -> usize {
    // Recorders send ~250KB chunks; leave generous headroom.
    16 * 1024 * 1024
}

/// Gateway-specific tuning.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct GatewayConfig {
    /// Maximum accepted websocket message size in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { max_message_bytes: default_max_message_bytes() }
    }
}

const fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

const fn default_heartbeat_ttl_ms() -> u64 {
    10_000
}

const fn default_segment_seconds() -> u32 {
    4
}

fn default_muxer_program() -> String {
    "ffmpeg".to_string()
}

fn default_temp_root() -> String {
    std::env::temp_dir().join("livereel").display().to_string()
}

/// Worker-specific tuning.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct WorkerConfig {
    /// Stable worker identity. A random UUID is generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Liveness key refresh cadence in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Liveness key TTL in milliseconds. Must exceed 2x the interval.
    #[serde(default = "default_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,
    /// Root under which per-stream muxer output directories are created.
    #[serde(default = "default_temp_root")]
    pub temp_root: String,
    /// Muxer binary, resolved on PATH.
    #[serde(default = "default_muxer_program")]
    pub muxer_program: String,
    /// Target HLS segment duration in seconds.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_ttl_ms: default_heartbeat_ttl_ms(),
            temp_root: default_temp_root(),
            muxer_program: default_muxer_program(),
            segment_seconds: default_segment_seconds(),
        }
    }
}

fn env_override_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).filter(|v| *v > 0)
}

impl WorkerConfig {
    /// Worker identity: `WORKER_ID` env var, then config, then a random UUID.
    pub fn resolved_worker_id(&self) -> String {
        std::env::var("WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.worker_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Heartbeat cadence: `HEARTBEAT_INTERVAL_MS` env var overrides config.
    pub fn resolved_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            env_override_u64("HEARTBEAT_INTERVAL_MS").unwrap_or(self.heartbeat_interval_ms),
        )
    }

    /// Heartbeat TTL: `HEARTBEAT_TTL_MS` env var overrides config.
    pub fn resolved_heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(env_override_u64("HEARTBEAT_TTL_MS").unwrap_or(self.heartbeat_ttl_ms))
    }
}

/// Root configuration for the Livereel server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub records: RecordsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// `LR_`-prefixed environment variables.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("LR_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_keep_heartbeat_ttl_above_interval() {
        let config = Config::default();
        assert_eq!(config.worker.heartbeat_interval_ms, 5_000);
        assert_eq!(config.worker.heartbeat_ttl_ms, 10_000);
        assert_eq!(config.worker.segment_seconds, 4);
        assert!(config.worker.heartbeat_ttl_ms > 2 * config.worker.heartbeat_interval_ms - 1);
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let toml_string = generate_default().unwrap();
        assert!(toml_string.contains("[worker]"));
        assert!(toml_string.contains("[broker]"));
    }

    #[test]
    fn worker_id_falls_back_to_uuid() {
        let config = WorkerConfig::default();
        let id = config.resolved_worker_id();
        assert!(!id.is_empty());
        // Two calls without a configured id must not collide.
        assert_ne!(id, config.resolved_worker_id());
    }
}
