//! Alert delivery to the tracing log

use tracing::{info, warn};

use crate::error::Result;
use crate::models::{alert_message, MetricKind, VitalStatus};

use super::NotificationDispatch;

/// Dispatch that writes alerts to the log instead of a device
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatch;

#[async_trait::async_trait]
impl NotificationDispatch for LogDispatch {
    async fn send_alert(&self, metric: MetricKind, severity: VitalStatus, value: f64) -> Result<()> {
        let message = alert_message(metric, severity, value);
        match severity {
            VitalStatus::Critical => warn!(metric = %metric, value, "{}", message),
            _ => info!(metric = %metric, value, "{}", message),
        }
        Ok(())
    }
}
