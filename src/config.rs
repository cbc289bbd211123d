//! `config.toml` loading. Every section and field has a default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::client::SchedulerConfig;
use crate::errors::{Result, UploadError};
use crate::network::QualityThresholds;
use crate::server::StoreConfig;
use crate::utils::{RetryConfig, RetryStrategy};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Partial sessions live here until finalize or expiry.
    pub temp_dir: PathBuf,
    pub blob_dir: PathBuf,
    pub public_base_url: String,
    /// Delay before the startup recovery sweep.
    #[serde(with = "duration_secs")]
    pub recovery_warmup: Duration,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            temp_dir: PathBuf::from("data/tmp"),
            blob_dir: PathBuf::from("data/blobs"),
            public_base_url: "http://127.0.0.1:8080/blobs".to_string(),
            recovery_warmup: Duration::from_secs(5),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub owner_id: String,
    /// Session records, one JSON file each.
    pub state_dir: PathBuf,
    pub concurrency: usize,
    /// bytes/s, unlimited when absent
    pub speed_limit: Option<u64>,
    pub chunk_size: u64,
    pub resumable_threshold: u64,
    pub max_consecutive_failures: u32,
    #[serde(with = "duration_secs")]
    pub backoff_initial: Duration,
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Attempts per control call (init, progress, finalize, cancel).
    pub request_attempts: u32,
    pub device_info: Option<String>,
    pub quality: QualityThresholds,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            server_url: "http://127.0.0.1:8080/".to_string(),
            owner_id: "local".to_string(),
            state_dir: PathBuf::from("data/client"),
            concurrency: scheduler.concurrency,
            speed_limit: None,
            chunk_size: scheduler.chunk_size,
            resumable_threshold: scheduler.resumable_threshold,
            max_consecutive_failures: scheduler.max_consecutive_failures,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            request_timeout: Duration::from_secs(60),
            request_attempts: 3,
            device_info: None,
            quality: scheduler.thresholds,
        }
    }
}

impl ClientConfig {
    fn backoff(&self) -> RetryStrategy {
        RetryStrategy::Exponential {
            initial: self.backoff_initial,
            multiplier: self.backoff_multiplier,
            max_delay: self.backoff_max,
        }
    }

    /// Retry policy for the HTTP transport's control calls.
    pub fn request_retry(&self) -> RetryConfig {
        RetryConfig::with_strategy(self.request_attempts, self.backoff())
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency.max(1),
            speed_limit: self.speed_limit.filter(|limit| *limit > 0),
            chunk_size: self.chunk_size,
            resumable_threshold: self.resumable_threshold,
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            backoff: self.backoff(),
            device_info: self.device_info.clone(),
            thresholds: self.quality,
            ..SchedulerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|err| UploadError::InvalidRequest(format!("invalid config: {err}")))
    }
}

/// Serde adapter storing a `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
