//! Configuration management for Sentinel.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SentinelError};
use crate::metrics::MetricsSink;
use crate::ratelimit::{
    Algorithm, FixedWindowLimiter, OverLimitPolicy, RateLimiter, SlidingWindowLimiter, TimeWindow,
};
use crate::storage::Storage;

/// Prefix for environment overrides, e.g. `SENTINEL__LIMITER__ALGORITHM`.
const ENV_PREFIX: &str = "SENTINEL";

/// Main configuration for Sentinel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Counting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Whether rejected requests stay in the count
    #[serde(default)]
    pub over_limit: OverLimitPolicy,

    /// Rule applied when the caller does not give one
    #[serde(default)]
    pub default_rule: RuleConfig,
}

/// A limit and the window it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Number of requests allowed per unit of time
    #[serde(default = "default_requests_per_unit")]
    pub requests_per_unit: u64,

    /// The time unit
    #[serde(default = "default_unit")]
    pub unit: TimeWindow,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            requests_per_unit: default_requests_per_unit(),
            unit: default_unit(),
        }
    }
}

fn default_requests_per_unit() -> u64 {
    100
}

fn default_unit() -> TimeWindow {
    TimeWindow::Second
}

impl RuleConfig {
    /// Window length of this rule.
    pub fn window(&self) -> Duration {
        self.unit.duration()
    }
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Interval between expired-counter sweeps in milliseconds; 0 disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

impl StorageConfig {
    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to record allowed/blocked counters
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

impl SentinelConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `SENTINEL__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SentinelError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

impl LimiterConfig {
    /// Build the configured limiter over `store`.
    pub fn build(
        &self,
        store: Arc<dyn Storage>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<dyn RateLimiter> {
        match self.algorithm {
            Algorithm::FixedWindow => Arc::new(
                FixedWindowLimiter::new(store)
                    .with_metrics(metrics)
                    .with_policy(self.over_limit),
            ),
            Algorithm::SlidingWindow => Arc::new(
                SlidingWindowLimiter::new(store)
                    .with_metrics(metrics)
                    .with_policy(self.over_limit),
            ),
        }
    }
}
