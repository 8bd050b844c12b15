//! Classification data models

use std::fmt;

use serde::{Deserialize, Serialize};

use super::sample::{MetricKind, VitalSample};

/// Severity assigned to a sample
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum VitalStatus {
    /// Within the normal band
    #[default]
    Normal,
    /// Outside the normal band but not yet critical
    Warning,
    /// At or beyond a critical boundary
    Critical,
}

impl VitalStatus {
    /// Whether the status should page the user
    pub fn is_abnormal(self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// Lowercase label, also used as a metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for VitalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the normal band a value fell on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deviation {
    /// At or below a low boundary
    Low,
    /// At or above a high boundary
    High,
}

/// Result of classifying one sample; never mutated after creation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationEvent {
    sample: VitalSample,
    status: VitalStatus,
    deviation: Option<Deviation>,
}

impl ClassificationEvent {
    /// Create a classification event
    pub fn new(sample: VitalSample, status: VitalStatus, deviation: Option<Deviation>) -> Self {
        Self {
            sample,
            status,
            deviation,
        }
    }

    /// Metric of the classified sample
    pub fn metric(&self) -> MetricKind {
        self.sample.metric()
    }

    /// The classified sample
    pub fn sample(&self) -> &VitalSample {
        &self.sample
    }

    /// Assigned status
    pub fn status(&self) -> VitalStatus {
        self.status
    }

    /// Breached side, `None` when normal
    pub fn deviation(&self) -> Option<Deviation> {
        self.deviation
    }
}
