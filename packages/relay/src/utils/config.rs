// packages/relay/src/utils/config.rs
//! Pipeline configuration
//!
//! Loaded from an optional `event-relay.toml` and then from `EVENT_RELAY_*`
//! environment variables. Every field has a default, so an empty
//! environment yields a working local-only pipeline.

use crate::recording::compressor::CompressionCodec;
use crate::utils::errors::{PipelineError, Result};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "EVENT_RELAY";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "event-relay.toml";

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding per-event queue records and archive segments
    pub queue_dir: Option<PathBuf>,

    /// Append-only audit log path
    pub audit_log_path: Option<PathBuf>,

    /// Remote collector endpoint; unset disables delivery
    pub collector_url: Option<String>,

    /// Bearer token sent to the collector
    pub collector_token: Option<String>,

    /// Events per delivery batch
    pub batch_size: usize,

    /// Delivery worker sleep between idle polls (milliseconds)
    pub flush_interval_ms: u64,

    /// Backoff base delay (milliseconds)
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub retry_max_delay_ms: u64,

    /// Retries per flush cycle after the first attempt
    pub max_retries: u32,

    /// Per-request HTTP timeout (milliseconds)
    pub request_timeout_ms: u64,

    /// In-memory pending queue capacity
    pub max_pending: usize,

    /// Queue record count that triggers compaction
    pub max_queue_files: usize,

    /// Queue byte size that triggers compaction
    pub max_queue_bytes: u64,

    /// Fraction of the thresholds a compaction pass drains down to
    pub compaction_low_water: f64,

    /// Compress archive segments
    pub compression: bool,

    /// Codec used when compression is on
    pub compression_codec: CompressionCodec,

    /// Archive retention window in days (0 disables age-based deletion)
    pub archive_retention_days: u64,

    /// Maximum number of archive segments kept (0 disables the cap)
    pub max_archives: usize,

    /// Coordination service REST endpoint
    pub lock_url: Option<String>,

    /// Coordination service token
    pub lock_token: Option<String>,

    /// Key holding the compaction lock on the coordination service
    pub lock_key: String,

    /// Lock TTL (milliseconds); also the stale age of a lock file
    pub lock_ttl_ms: u64,

    /// Recurring retention cleanup interval (seconds)
    pub retention_interval_secs: u64,

    /// Kill-switch for compaction and scheduled retention
    pub disable_compaction: bool,

    /// Size of the recent-events ring buffer
    pub recent_events_capacity: usize,

    /// Emit JSON logs (binary only)
    pub log_json: bool,

    /// Prometheus listener address (binary only)
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_dir: Some(PathBuf::from("./data/rate-limit-queue")),
            audit_log_path: Some(PathBuf::from("./data/rate-limit-events.log")),
            collector_url: None,
            collector_token: None,
            batch_size: 50,
            flush_interval_ms: 5_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_retries: 3,
            request_timeout_ms: 10_000,
            max_pending: 10_000,
            max_queue_files: 500,
            max_queue_bytes: 5 * 1024 * 1024, // 5 MiB
            compaction_low_water: 0.5,
            compression: true,
            compression_codec: CompressionCodec::Gzip,
            archive_retention_days: 30,
            max_archives: 50,
            lock_url: None,
            lock_token: None,
            lock_key: "event-relay:compaction-lock".to_string(),
            lock_ttl_ms: 30_000,
            retention_interval_secs: 24 * 60 * 60,
            disable_compaction: false,
            recent_events_capacity: 100,
            log_json: false,
            metrics_addr: None,
        }
    }
}

impl PipelineConfig {
    /// Load from the config file (if present) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(format!("{}_CONFIG", ENV_PREFIX))
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let builder = Config::builder()
            .add_source(File::from(Path::new(&path)).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Self::from_builder(builder)
    }

    fn from_builder(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Local-only configuration rooted at `dir` (handy for tests and tools)
    pub fn local(dir: &Path) -> Self {
        Self {
            queue_dir: Some(dir.join("queue")),
            audit_log_path: Some(dir.join("events.log")),
            ..Default::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }
        if self.max_pending == 0 {
            return Err(invalid("max_pending must be at least 1"));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("flush_interval_ms must be positive"));
        }
        if self.retry_base_delay_ms == 0 {
            return Err(invalid("retry_base_delay_ms must be positive"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(invalid("retry_max_delay_ms cannot be below retry_base_delay_ms"));
        }
        if self.max_queue_files == 0 || self.max_queue_bytes == 0 {
            return Err(invalid("queue thresholds must be positive"));
        }
        if !(self.compaction_low_water > 0.0 && self.compaction_low_water <= 1.0) {
            return Err(invalid("compaction_low_water must be in (0, 1]"));
        }
        if self.lock_ttl_ms == 0 {
            return Err(invalid("lock_ttl_ms must be positive"));
        }
        if self.retention_interval_secs == 0 {
            return Err(invalid("retention_interval_secs must be positive"));
        }
        for (name, url) in [("collector_url", self.collector_url()), ("lock_url", self.lock_url())] {
            if let Some(url) = url {
                let uri: hyper::Uri = url
                    .parse()
                    .map_err(|e| invalid(&format!("{} is not a valid URL: {}", name, e)))?;
                match uri.scheme_str() {
                    Some("http") | Some("https") => {}
                    _ => return Err(invalid(&format!("{} must be http or https", name))),
                }
            }
        }
        Ok(())
    }

    /// Queue directory, treating an empty path as unset
    pub fn queue_dir(&self) -> Option<&Path> {
        non_empty_path(self.queue_dir.as_deref())
    }

    /// Audit log path, treating an empty path as unset
    pub fn audit_log_path(&self) -> Option<&Path> {
        non_empty_path(self.audit_log_path.as_deref())
    }

    pub fn collector_url(&self) -> Option<&str> {
        non_empty_str(self.collector_url.as_deref())
    }

    pub fn collector_token(&self) -> Option<&str> {
        non_empty_str(self.collector_token.as_deref())
    }

    pub fn lock_url(&self) -> Option<&str> {
        non_empty_str(self.lock_url.as_deref())
    }

    pub fn lock_token(&self) -> Option<&str> {
        non_empty_str(self.lock_token.as_deref())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    /// Retention window, `None` when the age pass is disabled
    pub fn retention_window(&self) -> Option<Duration> {
        match self.archive_retention_days {
            0 => None,
            days => Some(Duration::from_secs(days * 24 * 60 * 60)),
        }
    }

    /// Codec actually applied to new archives
    pub fn effective_codec(&self) -> CompressionCodec {
        if self.compression {
            self.compression_codec
        } else {
            CompressionCodec::None
        }
    }
}

fn invalid(msg: &str) -> PipelineError {
    PipelineError::InvalidConfig(msg.to_string())
}

fn non_empty_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn non_empty_str(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_env(vars: &[(&str, &str)]) -> Result<PipelineConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let builder = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true).source(Some(map)));
        PipelineConfig::from_builder(builder)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert!(config.collector_url().is_none());
        assert_eq!(config.effective_codec(), CompressionCodec::Gzip);
    }

    #[test]
    fn test_env_overrides() {
        let config = from_env(&[
            ("EVENT_RELAY_COLLECTOR_URL", "https://collector.example.com/ingest"),
            ("EVENT_RELAY_COLLECTOR_TOKEN", "secret"),
            ("EVENT_RELAY_BATCH_SIZE", "10"),
            ("EVENT_RELAY_COMPRESSION", "false"),
            ("EVENT_RELAY_COMPRESSION_CODEC", "zstd"),
            ("EVENT_RELAY_MAX_ARCHIVES", "3"),
        ])
        .unwrap();

        assert_eq!(config.collector_url(), Some("https://collector.example.com/ingest"));
        assert_eq!(config.collector_token(), Some("secret"));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_archives, 3);
        assert_eq!(config.compression_codec, CompressionCodec::Zstd);
        assert_eq!(config.effective_codec(), CompressionCodec::None);
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config = PipelineConfig {
            collector_url: Some("  ".to_string()),
            queue_dir: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(config.collector_url().is_none());
        assert!(config.queue_dir().is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_batch = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let inverted_backoff = PipelineConfig {
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(inverted_backoff.validate().is_err());

        let bad_scheme = PipelineConfig {
            collector_url: Some("ftp://collector".to_string()),
            ..Default::default()
        };
        assert!(bad_scheme.validate().is_err());

        let bad_low_water = PipelineConfig {
            compaction_low_water: 0.0,
            ..Default::default()
        };
        assert!(bad_low_water.validate().is_err());
    }

    #[test]
    fn test_retention_window_disabled_at_zero() {
        let config = PipelineConfig {
            archive_retention_days: 0,
            ..Default::default()
        };
        assert!(config.retention_window().is_none());

        let config = PipelineConfig::default();
        assert_eq!(config.retention_window(), Some(Duration::from_secs(30 * 86_400)));
    }
}
