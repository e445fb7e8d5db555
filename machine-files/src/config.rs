//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `MACHINE_FILES_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`, optional)
//! 2. **Environment variables** - Variables prefixed with `MACHINE_FILES_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `MACHINE_FILES_LIMITS__FILES__MAX_FILE_SIZE=1048576` sets `limits.files.max_file_size`.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use machine_files::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 8080
//! storage:
//!   backend:
//!     type: local
//!     path: /var/lib/machine-files
//!   retention: 90days
//! limits:
//!   files:
//!     max_file_size: 52428800
//!     max_concurrent_uploads: 16
//! identifiers:
//!   max_length: 64
//! cors:
//!   allowed_origins:
//!     - https://ops.example.com
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Upper bound for `identifiers.max_length`, keeps identifiers usable as header and log values
const MAX_IDENTIFIER_LENGTH_CEILING: usize = 1024;

/// Punctuation that can never be allowed in identifiers
const FORBIDDEN_PUNCTUATION: [char; 3] = ['/', '\\', '.'];

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "MACHINE_FILES_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) config file yields a working service that
/// stores files under `./data`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Blob storage backend and retention
    pub storage: StorageConfig,
    /// Resource limits for protecting system capacity
    pub limits: LimitsConfig,
    /// Machine identifier rules
    pub identifiers: IdentifierConfig,
    /// CORS settings for browser clients
    pub cors: CorsConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Where payloads are kept
    pub backend: StorageBackend,
    /// Evict records whose upload is older than this. `None` keeps files forever.
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,
    /// How often the retention sweeper runs (default: 1h)
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Files in a directory on local disk
    Local {
        /// Root directory of the store
        path: PathBuf,
    },
    /// Process memory; contents are lost on restart
    Memory,
}

/// Resource limits for protecting system capacity.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// File limits (size and upload concurrency)
    pub files: FileLimitsConfig,
}

/// File limits configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileLimitsConfig {
    /// Maximum payload size in bytes.
    /// Default: 100MB
    pub max_file_size: u64,
    /// Maximum number of concurrent uploads allowed system-wide.
    /// Set to 0 for unlimited.
    /// Default: 0 (unlimited)
    pub max_concurrent_uploads: usize,
    /// Maximum number of uploads that can wait in queue for a slot.
    /// When this limit is reached, new uploads receive HTTP 429 immediately.
    /// Set to 0 for unlimited waiting queue (not recommended).
    /// Default: 20
    pub max_waiting_uploads: usize,
    /// Maximum time to wait for an upload slot before returning HTTP 429.
    /// Zero rejects immediately when no slot is available.
    /// Default: 60s
    #[serde(with = "humantime_serde")]
    pub max_upload_wait: Duration,
}

/// Machine identifier rules.
///
/// ASCII letters and digits are always allowed. `allowed_punctuation` lists the extra characters
/// permitted on top of them; `/`, `\` and `.` are rejected at load time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentifierConfig {
    /// Maximum identifier length in characters (default: 128)
    pub max_length: usize,
    /// Extra characters allowed in identifiers (default: "-_")
    pub allowed_punctuation: String,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Allow credentials (cookies) in CORS requests
    pub allow_credentials: bool,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard", serialize_with = "serialize_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn serialize_wildcard<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("*")
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            identifiers: IdentifierConfig::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            retention: None,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for FileLimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024, // 100MB
            max_concurrent_uploads: 0,
            max_waiting_uploads: 20,
            max_upload_wait: Duration::from_secs(60),
        }
    }
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            max_length: 128,
            allowed_punctuation: "-_".to_string(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            // The upload page is served from a different origin than the API
            allowed_origins: vec![CorsOrigin::Wildcard],
            allow_credentials: false,
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.limits.files.max_file_size == 0 {
            return Err(invalid("limits.files.max_file_size must be greater than zero"));
        }

        if self.identifiers.max_length == 0 || self.identifiers.max_length > MAX_IDENTIFIER_LENGTH_CEILING {
            return Err(invalid(format!(
                "identifiers.max_length must be between 1 and {MAX_IDENTIFIER_LENGTH_CEILING}, got {}",
                self.identifiers.max_length
            )));
        }

        if let Some(bad) = self
            .identifiers
            .allowed_punctuation
            .chars()
            .find(|c| !c.is_ascii_punctuation() || FORBIDDEN_PUNCTUATION.contains(c))
        {
            return Err(invalid(format!(
                "identifiers.allowed_punctuation may only contain ASCII punctuation other than '/', '\\' and '.', found {bad:?}"
            )));
        }

        if self.cors.allow_credentials && self.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
            return Err(invalid(
                "cors.allow_credentials cannot be combined with a wildcard origin; list explicit origins instead",
            ));
        }

        if let Some(retention) = self.storage.retention {
            if retention.is_zero() {
                return Err(invalid("storage.retention must be greater than zero; omit it to keep files forever"));
            }
            if self.storage.sweep_interval.is_zero() {
                return Err(invalid("storage.sweep_interval must be greater than zero when retention is set"));
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables override specific values; MACHINE_FILES_CONFIG is the CLI's
            .merge(Env::prefixed("MACHINE_FILES_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Internal {
        operation: format!("Config validation: {}", message.into()),
    }
}
