//! Threshold bands and the per-metric threshold table
//!
//! Every metric uses the same four optional boundaries. A value that lands
//! exactly on a boundary belongs to the stricter side:
//!
//! - `value <= critical_low` or `value >= critical_high` is [`VitalStatus::Critical`]
//! - otherwise `value <= warning_low` or `value >= warning_high` is [`VitalStatus::Warning`]
//! - otherwise [`VitalStatus::Normal`]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::classification::{Deviation, VitalStatus};
use super::sample::MetricKind;

/// Numeric boundaries partitioning one metric's values into severities
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdBand {
    /// Values at or below this are critical
    pub critical_low: Option<f64>,
    /// Values at or below this are a warning
    pub warning_low: Option<f64>,
    /// Values at or above this are a warning
    pub warning_high: Option<f64>,
    /// Values at or above this are critical
    pub critical_high: Option<f64>,
}

impl ThresholdBand {
    /// A band that classifies every value as normal
    pub const fn unbounded() -> Self {
        Self {
            critical_low: None,
            warning_low: None,
            warning_high: None,
            critical_high: None,
        }
    }

    /// Band with all four boundaries set
    pub const fn two_sided(
        critical_low: f64,
        warning_low: f64,
        warning_high: f64,
        critical_high: f64,
    ) -> Self {
        Self {
            critical_low: Some(critical_low),
            warning_low: Some(warning_low),
            warning_high: Some(warning_high),
            critical_high: Some(critical_high),
        }
    }

    /// Band that only guards against low values
    pub const fn low_only(critical_low: f64, warning_low: f64) -> Self {
        Self {
            critical_low: Some(critical_low),
            warning_low: Some(warning_low),
            warning_high: None,
            critical_high: None,
        }
    }

    /// Classify a value against this band
    pub fn classify(&self, value: f64) -> (VitalStatus, Option<Deviation>) {
        let at_or_below = |bound: Option<f64>| bound.is_some_and(|b| value <= b);
        let at_or_above = |bound: Option<f64>| bound.is_some_and(|b| value >= b);

        if at_or_below(self.critical_low) {
            (VitalStatus::Critical, Some(Deviation::Low))
        } else if at_or_above(self.critical_high) {
            (VitalStatus::Critical, Some(Deviation::High))
        } else if at_or_below(self.warning_low) {
            (VitalStatus::Warning, Some(Deviation::Low))
        } else if at_or_above(self.warning_high) {
            (VitalStatus::Warning, Some(Deviation::High))
        } else {
            (VitalStatus::Normal, None)
        }
    }

    /// Check boundaries are finite and ordered low to high
    pub fn validate(&self, metric: MetricKind) -> Result<()> {
        let bounds = [
            ("critical_low", self.critical_low),
            ("warning_low", self.warning_low),
            ("warning_high", self.warning_high),
            ("critical_high", self.critical_high),
        ];

        let mut previous: Option<(&str, f64)> = None;
        for (name, bound) in bounds {
            let Some(value) = bound else { continue };
            if !value.is_finite() {
                return Err(Error::validation(format!(
                    "{metric}: {name} must be finite"
                )));
            }
            if let Some((prev_name, prev)) = previous {
                if value < prev {
                    return Err(Error::validation(format!(
                        "{metric}: {name} ({value}) is below {prev_name} ({prev})"
                    )));
                }
            }
            previous = Some((name, value));
        }

        Ok(())
    }
}

/// Table-driven lookup of the band for each metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable {
    bands: BTreeMap<MetricKind, ThresholdBand>,
}

impl ThresholdTable {
    /// Empty table; every metric classifies as normal until a band is set
    pub fn empty() -> Self {
        Self {
            bands: BTreeMap::new(),
        }
    }

    /// Replace the band for a metric
    #[must_use]
    pub fn with_band(mut self, metric: MetricKind, band: ThresholdBand) -> Self {
        self.bands.insert(metric, band);
        self
    }

    /// Band for a metric; unbounded when none is configured
    pub fn band(&self, metric: MetricKind) -> ThresholdBand {
        self.bands
            .get(&metric)
            .copied()
            .unwrap_or_else(ThresholdBand::unbounded)
    }

    /// Iterate configured bands in metric order
    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, &ThresholdBand)> {
        self.bands.iter().map(|(metric, band)| (*metric, band))
    }

    /// Validate every configured band
    pub fn validate(&self) -> Result<()> {
        self.bands
            .iter()
            .try_for_each(|(metric, band)| band.validate(*metric))
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::empty()
            .with_band(
                MetricKind::HeartRate,
                ThresholdBand::two_sided(40.0, 50.0, 100.0, 130.0),
            )
            .with_band(MetricKind::BloodOxygen, ThresholdBand::low_only(90.0, 94.0))
            .with_band(
                MetricKind::RespirationRate,
                ThresholdBand::two_sided(8.0, 10.0, 24.0, 30.0),
            )
            .with_band(MetricKind::StepCount, ThresholdBand::unbounded())
    }
}
