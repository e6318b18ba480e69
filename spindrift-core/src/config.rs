//! Centralized configuration for Spindrift.
//!
//! All tunable parameters are defined here so values are not hard-coded
//! across the engine.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Spindrift components.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    /// Piece download pipeline settings.
    pub download: DownloadConfig,
    /// Scheduler channel settings.
    pub scheduler: SchedulerConfig,
    /// Piece persistence settings.
    pub storage: StorageConfig,
    /// Intercepting proxy settings.
    pub proxy: ProxyConfig,
}

/// Piece download pipeline configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Worker pool size when the scheduler does not suggest one.
    pub default_parallel_count: u32,
    /// Re-enqueue budget per piece before the task gives up on the overlay.
    pub piece_retry_limit: u32,
    /// Timeout for one piece transfer.
    pub fetch_timeout: Duration,
    /// Verify piece bodies against their advertised MD5 while streaming.
    pub calculate_digest: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            default_parallel_count: 4,
            piece_retry_limit: 3,
            fetch_timeout: Duration::from_secs(30),
            calculate_digest: true,
        }
    }
}

/// Scheduler channel configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// First delay between piece metadata polls of a quiet peer.
    pub poll_interval: Duration,
    /// Ceiling for the exponential poll backoff.
    pub poll_interval_max: Duration,
    /// How long one peer may stay quiet before it is reported and the task
    /// waits for a new directive.
    pub piece_ready_timeout: Duration,
    /// How many times the directive stream is re-opened after transport
    /// errors before the task fails.
    pub stream_reopen_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            poll_interval_max: Duration::from_secs(4),
            piece_ready_timeout: Duration::from_secs(60),
            stream_reopen_limit: 3,
        }
    }
}

/// Piece persistence configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for task data.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Intercepting proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Filter applied when a request carries no `X-Dragonfly-Filter`.
    pub default_filter: String,
    /// Tag applied when a request carries no `X-Dragonfly-Biz`.
    pub default_tag: String,
    /// Log request and response headers of proxied requests.
    pub dump_http_content: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_filter: String::new(),
            default_tag: String::new(),
            dump_http_content: false,
        }
    }
}

impl SpindriftConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(count) = std::env::var("SPINDRIFT_PARALLEL_COUNT") {
            if let Ok(count) = count.parse::<u32>() {
                config.download.default_parallel_count = count;
            }
        }

        if let Ok(retries) = std::env::var("SPINDRIFT_PIECE_RETRIES") {
            if let Ok(retries) = retries.parse::<u32>() {
                config.download.piece_retry_limit = retries;
            }
        }

        if let Ok(timeout) = std::env::var("SPINDRIFT_FETCH_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.download.fetch_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(dir) = std::env::var("SPINDRIFT_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(filter) = std::env::var("SPINDRIFT_DEFAULT_FILTER") {
            config.proxy.default_filter = filter;
        }

        config
    }
}
