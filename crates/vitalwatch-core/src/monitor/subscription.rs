//! Per-metric subscription state owned by the monitor

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{MetricKind, VitalSample};
use crate::providers::SubscriptionHandle;

/// Delivery path a sample arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Data source push callback
    Push,
    /// Polling fallback timer
    Poll,
    /// Explicit refresh requested by the application
    OnDemand,
}

impl DeliveryChannel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::OnDemand => "on_demand",
        }
    }
}

/// Running polling task for one metric
pub(crate) struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Cancel the task and wait for it to exit
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        // A cancelled or panicked poller has nothing left to release.
        let _ = self.task.await;
    }

    /// Cancel without waiting; used from `Drop`
    pub(crate) fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Both delivery channels plus the staleness watermark for one metric
pub(crate) struct MonitorSubscription {
    pub(crate) generation: u64,
    pub(crate) push_handle: Option<SubscriptionHandle>,
    pub(crate) poll_handle: Option<PollHandle>,
    last_observed_at: Option<DateTime<Utc>>,
    last_sample: Option<VitalSample>,
}

impl MonitorSubscription {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            push_handle: None,
            poll_handle: None,
            last_observed_at: None,
            last_sample: None,
        }
    }

    /// Advance the watermark if `sample` is strictly newer.
    ///
    /// Returns `false` for duplicates and out-of-order deliveries, leaving the
    /// watermark untouched.
    pub(crate) fn accept(&mut self, sample: &VitalSample) -> bool {
        if self
            .last_observed_at
            .is_some_and(|last| sample.observed_at() <= last)
        {
            return false;
        }

        self.last_observed_at = Some(sample.observed_at());
        self.last_sample = Some(*sample);
        true
    }

    pub(crate) fn snapshot(&self, metric: MetricKind) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            metric,
            push_active: self.push_handle.is_some(),
            poll_active: self.poll_handle.is_some(),
            last_observed_at: self.last_observed_at,
            last_sample: self.last_sample,
        }
    }
}

/// Read-only view of one metric's subscription
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubscriptionSnapshot {
    /// Observed metric
    pub metric: MetricKind,
    /// Whether the push subscription was established
    pub push_active: bool,
    /// Whether the polling task is running
    pub poll_active: bool,
    /// Timestamp of the newest forwarded sample
    pub last_observed_at: Option<DateTime<Utc>>,
    /// Newest forwarded sample
    pub last_sample: Option<VitalSample>,
}
