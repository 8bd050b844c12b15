//! Vital sample data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Physiological signal tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Beats per minute
    HeartRate,
    /// Steps counted in the sample interval
    StepCount,
    /// Peripheral oxygen saturation, in percent
    BloodOxygen,
    /// Breaths per minute
    RespirationRate,
}

impl MetricKind {
    /// Every metric, in a stable order
    pub const ALL: [MetricKind; 4] = [
        MetricKind::HeartRate,
        MetricKind::StepCount,
        MetricKind::BloodOxygen,
        MetricKind::RespirationRate,
    ];

    /// Stable snake_case identifier, also used as a metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartRate => "heart_rate",
            Self::StepCount => "step_count",
            Self::BloodOxygen => "blood_oxygen",
            Self::RespirationRate => "respiration_rate",
        }
    }

    /// Human-readable name
    pub fn display_name(self) -> &'static str {
        match self {
            Self::HeartRate => "heart rate",
            Self::StepCount => "step count",
            Self::BloodOxygen => "blood oxygen",
            Self::RespirationRate => "respiration rate",
        }
    }

    /// Unit the sample value is expressed in
    pub fn unit(self) -> &'static str {
        match self {
            Self::HeartRate => "bpm",
            Self::StepCount => "steps",
            Self::BloodOxygen => "%",
            Self::RespirationRate => "breaths/min",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::HeartRate => 0,
            Self::StepCount => 1,
            Self::BloodOxygen => 2,
            Self::RespirationRate => 3,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "heart_rate" | "hr" => Ok(Self::HeartRate),
            "step_count" | "steps" => Ok(Self::StepCount),
            "blood_oxygen" | "spo2" => Ok(Self::BloodOxygen),
            "respiration_rate" | "rr" => Ok(Self::RespirationRate),
            other => Err(Error::validation(format!("unknown metric '{other}'"))),
        }
    }
}

/// One timestamped physiological measurement
///
/// Samples are immutable once created; the value is guaranteed finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VitalSample {
    metric: MetricKind,
    value: f64,
    observed_at: DateTime<Utc>,
}

impl VitalSample {
    /// Create a sample, rejecting NaN and infinite values
    pub fn new(metric: MetricKind, value: f64, observed_at: DateTime<Utc>) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::validation(format!(
                "{metric} sample value must be finite, got {value}"
            )));
        }

        Ok(Self {
            metric,
            value,
            observed_at,
        })
    }

    /// Metric this sample measures
    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Measured value, in the metric's unit
    pub fn value(&self) -> f64 {
        self.value
    }

    /// When the measurement was taken
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}
