//! Layered configuration
//!
//! Defaults, then `wardstream.json`, then `WARDSTREAM_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(any(feature = "stream", feature = "telemetry"))]
use std::time::Duration;
use url::Url;
use wardstream_error::{Result, WardstreamError};

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "wardstream.json";

/// Stream endpoint override
pub const ENV_ENDPOINT: &str = "WARDSTREAM_ENDPOINT";
/// Telemetry endpoint override
pub const ENV_TELEMETRY_URL: &str = "WARDSTREAM_TELEMETRY_URL";
/// Fixed heartbeat interval override, in milliseconds
pub const ENV_HEARTBEAT_MS: &str = "WARDSTREAM_HEARTBEAT_MS";
/// Reconnect budget override
pub const ENV_MAX_RETRIES: &str = "WARDSTREAM_MAX_RETRIES";
/// Error queue file override
pub const ENV_QUEUE_PATH: &str = "WARDSTREAM_QUEUE_PATH";

/// Error queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Snapshot file
    pub path: PathBuf,
    /// Capacity
    pub max_queue_size: usize,
    /// Items per request
    pub batch_size: usize,
    /// Periodic sync cadence, seconds
    pub sync_interval_secs: u64,
    /// Optional byte quota for the snapshot
    pub quota_bytes: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("wardstream-errors.json"),
            max_queue_size: 100,
            batch_size: 10,
            sync_interval_secs: 30,
            quota_bytes: None,
        }
    }
}

/// User-facing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardstreamConfig {
    /// Server-push endpoint
    pub endpoint: String,
    /// Telemetry endpoint; errors stay queued locally when unset
    pub telemetry_url: Option<String>,
    /// Fixed heartbeat interval, replacing the adaptive table
    pub heartbeat_ms: Option<u64>,
    /// Reconnect budget
    pub max_retries: u32,
    /// Use the mobile presets
    pub mobile: bool,
    /// Quality probe cadence, seconds; 0 disables probing
    pub quality_probe_secs: u64,
    /// Error queue
    pub queue: QueueSettings,
}

impl Default for WardstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/stream".to_string(),
            telemetry_url: None,
            heartbeat_ms: None,
            max_retries: 5,
            mobile: false,
            quality_probe_secs: 30,
            queue: QueueSettings::default(),
        }
    }
}

impl WardstreamConfig {
    /// Reads `path`; a missing file yields the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                WardstreamError::Config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// File, then process environment, then validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Writes pretty-printed JSON to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Applies `WARDSTREAM_*` overrides read through `lookup`
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(url) = lookup(ENV_TELEMETRY_URL) {
            self.telemetry_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(ms) = lookup(ENV_HEARTBEAT_MS) {
            self.heartbeat_ms = Some(parse_number(ENV_HEARTBEAT_MS, &ms)?);
        }
        if let Some(retries) = lookup(ENV_MAX_RETRIES) {
            self.max_retries = parse_number(ENV_MAX_RETRIES, &retries)?;
        }
        if let Some(path) = lookup(ENV_QUEUE_PATH) {
            self.queue.path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Rejects unparsable URLs and zero sizes or intervals
    pub fn validate(&self) -> Result<()> {
        self.endpoint_url()?;
        self.telemetry_endpoint()?;

        if self.heartbeat_ms == Some(0) {
            return Err(WardstreamError::Config("heartbeat_ms must be non-zero".into()));
        }
        let queue = &self.queue;
        if queue.max_queue_size == 0 || queue.batch_size == 0 {
            return Err(WardstreamError::Config(
                "queue sizes must be non-zero".into(),
            ));
        }
        if queue.sync_interval_secs == 0 {
            return Err(WardstreamError::Config(
                "queue.sync_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Parsed stream endpoint
    pub fn endpoint_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint)
            .map_err(|e| WardstreamError::InvalidUrl(format!("{}: {}", self.endpoint, e)))
    }

    /// Parsed telemetry endpoint, if configured
    pub fn telemetry_endpoint(&self) -> Result<Option<Url>> {
        self.telemetry_url
            .as_deref()
            .map(|url| {
                Url::parse(url).map_err(|e| WardstreamError::InvalidUrl(format!("{}: {}", url, e)))
            })
            .transpose()
    }

    /// Stream client configuration
    #[cfg(feature = "stream")]
    pub fn stream_config(&self) -> Result<wardstream_stream::StreamConfig> {
        use wardstream_stream::{HeartbeatTable, StreamConfig};

        let endpoint = self.endpoint_url()?;
        let mut config = if self.mobile {
            StreamConfig::mobile(endpoint)
        } else {
            StreamConfig::new(endpoint)
        };

        config.backoff = config.backoff.clone().with_max_retries(self.max_retries);
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat = HeartbeatTable::uniform(Duration::from_millis(ms));
        }
        config.quality_probe_interval =
            Some(Duration::from_secs(self.quality_probe_secs)).filter(|d| !d.is_zero());
        config.validate()?;
        Ok(config)
    }

    /// Error queue configuration
    #[cfg(feature = "telemetry")]
    pub fn queue_config(&self) -> wardstream_telemetry::ErrorQueueConfig {
        wardstream_telemetry::ErrorQueueConfig::default()
            .with_max_queue_size(self.queue.max_queue_size)
            .with_batch_size(self.queue.batch_size)
            .with_sync_interval(Duration::from_secs(self.queue.sync_interval_secs))
    }

    /// File storage for the error queue
    #[cfg(feature = "telemetry")]
    pub fn queue_storage(&self) -> wardstream_telemetry::FileStorage {
        let storage = wardstream_telemetry::FileStorage::new(&self.queue.path);
        match self.queue.quota_bytes {
            Some(bytes) => storage.with_quota(bytes),
            None => storage,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| WardstreamError::Config(format!("{} must be a number, got '{}'", name, value)))
}
