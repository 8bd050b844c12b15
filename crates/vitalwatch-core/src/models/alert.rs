//! Alert data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classification::VitalStatus;
use super::sample::MetricKind;

/// What started an emergency alert round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertTrigger {
    /// The user pressed the emergency button
    Manual,
    /// A critical reading escalated automatically
    Automatic {
        /// Metric whose reading escalated
        metric: MetricKind,
    },
}

impl AlertTrigger {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic { .. } => "automatic",
        }
    }
}

/// Accumulated state of the emergency alert workflow
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertStatus {
    /// Whether the current location has been shared
    pub is_location_shared: bool,

    /// Number of contact notification rounds performed
    pub contacts_notified: u32,

    /// Sum of recipients reported by the contact directory
    pub recipients_reached: usize,

    /// When the last round ran
    pub last_alert_at: Option<DateTime<Utc>>,

    /// What triggered the last round
    pub last_trigger: Option<AlertTrigger>,
}

/// Record of one notification dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Metric that triggered the alert
    pub metric: MetricKind,

    /// Severity sent to the user
    pub status: VitalStatus,

    /// Sample value that triggered the alert
    pub value: f64,

    /// When the attempt was made
    pub sent_at: DateTime<Utc>,

    /// Whether delivery succeeded
    pub success: bool,

    /// Error message if failed
    pub error: Option<String>,
}

/// Format the user-facing alert text
pub fn alert_message(metric: MetricKind, status: VitalStatus, value: f64) -> String {
    let label = match status {
        VitalStatus::Critical => "Critical",
        VitalStatus::Warning => "Abnormal",
        VitalStatus::Normal => "Normal",
    };

    format!(
        "{} {}: {:.0} {}",
        label,
        metric.display_name(),
        value,
        metric.unit()
    )
}
