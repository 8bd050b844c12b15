//! Cooldown-gated alert notification

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AlertingConfig;
use crate::models::{AlertTrigger, ClassificationEvent, DispatchRecord, MetricKind, VitalStatus};
use crate::providers::NotificationDispatch;

use super::orchestrator::AlertOrchestrator;

/// Writer side of the user's auto-alert toggle
#[derive(Debug)]
pub struct AutoAlertSwitch {
    tx: watch::Sender<bool>,
}

impl AutoAlertSwitch {
    /// Create a switch in the given state
    pub fn new(enabled: bool) -> Self {
        let (tx, _rx) = watch::channel(enabled);
        Self { tx }
    }

    /// Turn auto-alerting on or off
    pub fn set(&self, enabled: bool) {
        self.tx.send_replace(enabled);
    }

    /// Current state
    pub fn is_enabled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Read-only handle for the notifier
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Cooldown bookkeeping for one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooldownState {
    /// When the last alert was dispatched
    pub last_alert_at: Option<DateTime<Utc>>,
    /// Minimum time between two alerts
    pub cooldown: Duration,
}

impl CooldownState {
    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_alert_at?;
        // A clock that moved backwards keeps the whole window closed.
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.cooldown
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }
}

/// What the notifier did with a classification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// The user turned auto-alerting off
    AutoAlertDisabled,
    /// The reading was normal
    NotAbnormal,
    /// A previous alert for the metric is still cooling down
    Suppressed {
        /// Suppressed metric
        metric: MetricKind,
        /// Time left until the next alert may fire
        remaining: Duration,
    },
    /// An alert was delivered
    Dispatched(DispatchRecord),
    /// Delivery was attempted and failed; the window is still consumed
    DispatchFailed(DispatchRecord),
}

impl NotifyOutcome {
    /// Whether an alert was handed to the dispatcher
    pub fn attempted(&self) -> bool {
        matches!(self, Self::Dispatched(_) | Self::DispatchFailed(_))
    }

    /// Whether a critical alert claimed its window, which triggers the
    /// emergency workflow regardless of delivery
    pub fn escalates(&self) -> bool {
        match self {
            Self::Dispatched(record) | Self::DispatchFailed(record) => {
                record.status == VitalStatus::Critical
            }
            _ => false,
        }
    }
}

/// Rate-limits abnormal classifications into user-facing alerts
pub struct CooldownNotifier {
    dispatch: Arc<dyn NotificationDispatch>,
    auto_alert: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
    cooldowns: [Mutex<CooldownState>; 4],
    escalation: Option<Arc<AlertOrchestrator>>,
}

impl CooldownNotifier {
    /// Create a notifier
    pub fn new(
        config: &AlertingConfig,
        dispatch: Arc<dyn NotificationDispatch>,
        auto_alert: watch::Receiver<bool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cooldowns = MetricKind::ALL.map(|metric| {
            Mutex::new(CooldownState {
                last_alert_at: None,
                cooldown: config.cooldown_for(metric),
            })
        });

        Self {
            dispatch,
            auto_alert,
            clock,
            cooldowns,
            escalation: None,
        }
    }

    /// Run the emergency workflow whenever a critical alert is dispatched
    #[must_use]
    pub fn with_escalation(mut self, orchestrator: Arc<AlertOrchestrator>) -> Self {
        self.escalation = Some(orchestrator);
        self
    }

    /// Decide whether a classification pages the user
    pub async fn on_classification(&self, event: &ClassificationEvent) -> NotifyOutcome {
        let metric = event.metric();

        if !*self.auto_alert.borrow() {
            trace!(metric = %metric, "Auto-alert disabled");
            return NotifyOutcome::AutoAlertDisabled;
        }

        if !event.status().is_abnormal() {
            return NotifyOutcome::NotAbnormal;
        }

        let now = self.clock.now();
        if let Err(remaining) = self.try_acquire(metric, now) {
            metrics::counter!("vitalwatch_alerts_suppressed_total", "metric" => metric.as_str())
                .increment(1);
            debug!(
                metric = %metric,
                status = ?event.status(),
                remaining_secs = remaining.as_secs(),
                "Alert suppressed by cooldown"
            );
            return NotifyOutcome::Suppressed { metric, remaining };
        }

        let value = event.sample().value();
        let result = self
            .dispatch
            .send_alert(metric, event.status(), value)
            .await;

        let record = DispatchRecord {
            id: Uuid::new_v4(),
            metric,
            status: event.status(),
            value,
            sent_at: now,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };

        let outcome = match result {
            Ok(()) => {
                metrics::counter!(
                    "vitalwatch_alerts_dispatched_total",
                    "metric" => metric.as_str(),
                    "status" => event.status().as_str()
                )
                .increment(1);
                info!(
                    metric = %metric,
                    status = ?event.status(),
                    value,
                    alert_id = %record.id,
                    "Alert dispatched"
                );
                NotifyOutcome::Dispatched(record)
            }
            Err(e) => {
                error!(metric = %metric, error = %e, "Failed to dispatch alert");
                NotifyOutcome::DispatchFailed(record)
            }
        };

        // Contacts are reached even when the user notification could not be delivered.
        if outcome.escalates() {
            if let Some(orchestrator) = &self.escalation {
                orchestrator.send(AlertTrigger::Automatic { metric }).await;
            }
        }

        outcome
    }

    /// Snapshot of a metric's cooldown state
    pub fn cooldown_state(&self, metric: MetricKind) -> CooldownState {
        *self.cooldowns[metric.index()].lock()
    }

    /// Atomically check the window and claim it.
    ///
    /// The claim is written before dispatch, so a concurrent event for the
    /// same metric sees the window as taken.
    fn try_acquire(&self, metric: MetricKind, now: DateTime<Utc>) -> Result<(), Duration> {
        let mut state = self.cooldowns[metric.index()].lock();
        if let Some(remaining) = state.remaining(now) {
            return Err(remaining);
        }
        state.last_alert_at = Some(now);
        Ok(())
    }
}
