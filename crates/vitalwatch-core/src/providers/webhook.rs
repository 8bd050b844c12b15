//! Alert delivery over HTTP webhooks

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use crate::models::{alert_message, MetricKind, VitalStatus};

use super::NotificationDispatch;

/// Posts each alert as JSON to a configured URL
#[derive(Debug, Clone)]
pub struct WebhookDispatch {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatch {
    /// Create a webhook dispatcher stamping payloads with `clock`
    pub fn new(config: &WebhookConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            headers: config.headers.clone(),
            clock,
        })
    }
}

#[async_trait::async_trait]
impl NotificationDispatch for WebhookDispatch {
    async fn send_alert(&self, metric: MetricKind, severity: VitalStatus, value: f64) -> Result<()> {
        let payload = WebhookPayload {
            alert_id: Uuid::new_v4().to_string(),
            metric,
            severity,
            value,
            unit: metric.unit(),
            message: alert_message(metric, severity, value),
            sent_at: self.clock.now(),
        };

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::dispatch(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::dispatch(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!(metric = %metric, url = %self.url, "Webhook notification sent");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    alert_id: String,
    metric: MetricKind,
    severity: VitalStatus,
    value: f64,
    unit: &'static str,
    message: String,
    sent_at: DateTime<Utc>,
}
