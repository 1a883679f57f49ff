//! Configuration management for the tus upload server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::tus::types::DEFAULT_EXPIRY_HOURS;

/// Longest accepted upload lifetime (100 years), keeps expiry timestamps in range
pub const MAX_EXPIRY_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tus: TusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings owned by whoever constructs the protocol engine
#[derive(Debug, Clone, Deserialize)]
pub struct TusConfig {
    /// Root directory for upload data and registry records
    pub upload_path: PathBuf,

    /// Collection URL the HTTP layer mounts uploads under
    pub upload_url: String,

    /// Allow a create with a caller-chosen id to replace an existing upload
    pub allow_overwrite_files: bool,

    /// Largest upload accepted (`Tus-Max-Size`), unlimited when `None`
    pub max_size: Option<u64>,

    /// Largest PATCH body accepted
    pub max_chunk_size: usize,

    /// Lifetime of an upload from creation
    pub expiry_secs: u64,

    /// Interval between expiry sweeps
    pub sweep_interval_secs: u64,
}

impl TusConfig {
    /// Defaults rooted at `upload_path`
    pub fn new(upload_path: impl Into<PathBuf>) -> Self {
        Self {
            upload_path: upload_path.into(),
            upload_url: "/uploads".to_string(),
            allow_overwrite_files: false,
            max_size: None,
            max_chunk_size: 8 * 1024 * 1024,
            expiry_secs: (DEFAULT_EXPIRY_HOURS * 3600) as u64,
            sweep_interval_secs: 300,
        }
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_secs.min(MAX_EXPIRY_SECS) as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for TusConfig {
    fn default() -> Self {
        Self::new("./uploads")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 1080,
            },
            tus: TusConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT")?.unwrap_or(defaults.server.port),
            },
            tus: TusConfig {
                upload_path: env::var("TUS_UPLOAD_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.tus.upload_path),
                upload_url: env::var("TUS_UPLOAD_URL").unwrap_or(defaults.tus.upload_url),
                allow_overwrite_files: parse_bool("TUS_ALLOW_OVERWRITE_FILES")?
                    .unwrap_or(defaults.tus.allow_overwrite_files),
                max_size: parse_var("TUS_MAX_SIZE")?.or(defaults.tus.max_size),
                max_chunk_size: parse_var("TUS_MAX_CHUNK_SIZE")?
                    .unwrap_or(defaults.tus.max_chunk_size),
                expiry_secs: parse_expiry("TUS_EXPIRY_SECS")?.unwrap_or(defaults.tus.expiry_secs),
                sweep_interval_secs: parse_var("TUS_SWEEP_INTERVAL_SECS")?
                    .unwrap_or(defaults.tus.sweep_interval_secs),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

fn parse_expiry(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match parse_var::<u64>(var)? {
        Some(secs) if secs > MAX_EXPIRY_SECS => Err(ConfigError::InvalidValue {
            var,
            value: format!("{secs} (at most {MAX_EXPIRY_SECS} seconds)"),
        }),
        secs => Ok(secs),
    }
}

fn parse_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { var, value }),
        },
        Err(_) => Ok(None),
    }
}
