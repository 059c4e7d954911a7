//! Configuration for the WeatherFlow exporter.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use weatherflow_common::LoggingConfig;

use crate::catalog::{DEFAULT_PREFIX, is_valid_metric_name};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Metric naming and exposition settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Session lifecycle settings.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Upstream feed settings.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Metric filtering settings.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:6969").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the per-device scrape endpoint (default: "/scrape").
    #[serde(default = "default_scrape_path")]
    pub scrape_path: String,

    /// Path for the exporter's own metrics (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

/// Default listen port.
pub const DEFAULT_PORT: u16 = 6969;

fn default_listen() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_scrape_path() -> String {
    "/scrape".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            scrape_path: default_scrape_path(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl ServerConfig {
    /// Replace the port of the listen address, keeping its host.
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let mut addr: SocketAddr = self.listen.parse().map_err(|_| {
            ConfigError::Validation(format!("Invalid listen address: {}", self.listen))
        })?;
        addr.set_port(port);
        self.listen = addr.to_string();
        Ok(())
    }
}

/// Prometheus exposition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Metric name prefix (default: "weatherflow").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Attach observation timestamps to samples (default: true).
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            timestamps: true,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Evict a device session after this long without a scrape (seconds).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Longest accepted idle timeout (one week).
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Upstream WebSocket feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// WebSocket endpoint; the token is appended as a query parameter.
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// Also subscribe to rapid wind reports (default: true).
    #[serde(default = "default_true")]
    pub rapid_wind: bool,

    /// Delay before the first reconnect attempt (seconds).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Upper bound for the exponential reconnect delay (seconds).
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
}

fn default_feed_url() -> String {
    "wss://ws.weatherflow.com/swd/data".to_string()
}

/// Longest accepted reconnect delay (one hour).
pub const MAX_RECONNECT_DELAY_SECS: u64 = 3600;

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_delay() -> u64 {
    300 // 5 minutes
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            rapid_wind: true,
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
        }
    }
}

impl FeedConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

/// Metric filtering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns for metric names to include (empty = all).
    #[serde(default)]
    pub include_metrics: Vec<String>,

    /// Glob patterns for metric names to exclude.
    #[serde(default)]
    pub exclude_metrics: Vec<String>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        for path in [&self.server.scrape_path, &self.server.metrics_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Endpoint path must start with /: {}",
                    path
                )));
            }
        }

        if self.server.scrape_path == self.server.metrics_path {
            return Err(ConfigError::Validation(
                "scrape_path and metrics_path must differ".to_string(),
            ));
        }

        if !is_valid_metric_name(&self.prometheus.prefix) {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: {}",
                self.prometheus.prefix
            )));
        }

        if self.sessions.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.sessions.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::Validation(format!(
                "idle_timeout_secs must be <= {}",
                MAX_IDLE_TIMEOUT_SECS
            )));
        }

        if !self.feed.url.starts_with("ws://") && !self.feed.url.starts_with("wss://") {
            return Err(ConfigError::Validation(format!(
                "Feed url must use ws:// or wss://: {}",
                self.feed.url
            )));
        }

        if self.feed.reconnect_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "reconnect_delay_secs must be > 0".to_string(),
            ));
        }

        if self.feed.max_reconnect_delay_secs < self.feed.reconnect_delay_secs {
            return Err(ConfigError::Validation(
                "max_reconnect_delay_secs must be >= reconnect_delay_secs".to_string(),
            ));
        }

        if self.feed.max_reconnect_delay_secs > MAX_RECONNECT_DELAY_SECS {
            return Err(ConfigError::Validation(format!(
                "max_reconnect_delay_secs must be <= {}",
                MAX_RECONNECT_DELAY_SECS
            )));
        }

        for pattern in self
            .filters
            .include_metrics
            .iter()
            .chain(&self.filters.exclude_metrics)
        {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::Validation(format!(
                    "Invalid metric pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        Ok(())
    }
}
