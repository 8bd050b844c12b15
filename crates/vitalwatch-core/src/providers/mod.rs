//! Capabilities the engine consumes from the surrounding application
//!
//! The physiological data source, notification delivery, the contact list and
//! location sharing all live outside the engine. Each is reached through one
//! of the traits below so the engine can be built against real platform
//! services or against the in-memory doubles in [`memory`].

mod console;
pub mod memory;
mod webhook;

pub use console::LogDispatch;
pub use memory::{InMemoryDataSource, RecordingDispatch, RecordingLocation, StaticContactDirectory};
pub use webhook::WebhookDispatch;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{MetricKind, VitalSample, VitalStatus};

/// Callback invoked by the data source for every pushed sample or push error
pub type SampleCallback = Arc<dyn Fn(Result<VitalSample>) + Send + Sync>;

/// Outcome of an authorization request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Access granted for every requested metric
    Granted,
    /// The user declined
    Denied,
}

/// Opaque handle for a push subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    metric: MetricKind,
}

impl SubscriptionHandle {
    /// Create a fresh handle for a metric
    pub fn new(metric: MetricKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric,
        }
    }

    /// Handle identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribed metric
    pub fn metric(&self) -> MetricKind {
        self.metric
    }
}

/// Aggregation applied by [`DataSource::fetch_aggregate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    /// Sum of values (e.g. daily steps)
    Sum,
    /// Arithmetic mean
    Average,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
}

/// Live physiological data source
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Ask the user for read access to the given metrics
    async fn request_authorization(&self, metrics: &[MetricKind]) -> Result<Authorization>;

    /// Register a push callback for new samples of a metric
    async fn subscribe(&self, metric: MetricKind, on_sample: SampleCallback)
        -> Result<SubscriptionHandle>;

    /// Release a push subscription
    async fn unsubscribe(&self, handle: &SubscriptionHandle);

    /// Most recent sample of a metric observed within `window`
    async fn fetch_latest(&self, metric: MetricKind, window: Duration)
        -> Result<Option<VitalSample>>;

    /// Aggregate of a metric's samples observed within `window`
    async fn fetch_aggregate(
        &self,
        metric: MetricKind,
        window: Duration,
        op: AggregateOp,
    ) -> Result<Option<f64>>;
}

/// Delivery of user-facing alerts
#[async_trait::async_trait]
pub trait NotificationDispatch: Send + Sync {
    /// Deliver one alert
    async fn send_alert(&self, metric: MetricKind, severity: VitalStatus, value: f64) -> Result<()>;
}

/// The user's emergency contact list
#[async_trait::async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Notify every contact, returning how many were reached
    async fn notify_all(&self) -> Result<usize>;
}

/// Location sharing
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    /// Share the device's current location with emergency contacts
    async fn share_current_location(&self) -> Result<()>;
}
