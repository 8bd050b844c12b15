//! Configuration management for VitalWatch

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{MetricKind, ThresholdTable};

/// Prefix for environment overrides, e.g. `VITALWATCH__ALERTING__COOLDOWN=90s`
pub const ENV_PREFIX: &str = "VITALWATCH";

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Monitor configuration
    pub monitor: MonitorConfig,

    /// Alerting configuration
    pub alerting: AlertingConfig,

    /// Threshold table
    pub thresholds: ThresholdTable,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval.is_zero() {
            return Err(Error::config("monitor.poll_interval must be greater than zero"));
        }
        if self.monitor.fetch_window.is_zero() {
            return Err(Error::config("monitor.fetch_window must be greater than zero"));
        }
        if let Some(webhook) = &self.alerting.webhook {
            if webhook.url.trim().is_empty() {
                return Err(Error::config("alerting.webhook.url must not be empty"));
            }
        }
        self.thresholds.validate()
    }
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval of the polling fallback channel
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Look-back window for latest-sample queries
    #[serde(with = "humantime_serde")]
    pub fetch_window: Duration,

    /// Metrics observed when none are given explicitly
    pub metrics: Vec<MetricKind>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            fetch_window: Duration::from_secs(3600),
            metrics: MetricKind::ALL.to_vec(),
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Initial state of the auto-alert switch
    pub auto_alert_enabled: bool,

    /// Minimum time between two alerts for the same metric
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Per-metric cooldowns replacing the default
    pub cooldown_overrides: BTreeMap<MetricKind, humantime_serde::Serde<Duration>>,

    /// Run the emergency workflow when a critical alert is dispatched
    pub escalate_critical: bool,

    /// Optional webhook for alert delivery
    pub webhook: Option<WebhookConfig>,
}

impl AlertingConfig {
    /// Effective cooldown for a metric
    pub fn cooldown_for(&self, metric: MetricKind) -> Duration {
        self.cooldown_overrides
            .get(&metric)
            .map_or(self.cooldown, |d| **d)
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            auto_alert_enabled: true,
            cooldown: Duration::from_secs(120),
            cooldown_overrides: BTreeMap::new(),
            escalate_critical: true,
            webhook: None,
        }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL
    pub url: String,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_webhook_timeout")]
    pub timeout: Duration,
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
    /// Optional log file, written in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
