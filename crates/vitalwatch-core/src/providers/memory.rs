//! In-process implementations of the engine's capabilities
//!
//! Used by the test suite and by the `simulate` and `alert` commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::models::{MetricKind, VitalSample, VitalStatus};

use super::{
    AggregateOp, Authorization, ContactDirectory, DataSource, LocationProvider,
    NotificationDispatch, SampleCallback, SubscriptionHandle,
};

#[derive(Default)]
struct SourceState {
    subscribers: HashMap<Uuid, (MetricKind, SampleCallback)>,
    history: Vec<VitalSample>,
}

/// Scriptable data source backed by an in-memory sample history
pub struct InMemoryDataSource {
    clock: Arc<dyn Clock>,
    state: Mutex<SourceState>,
    grant: AtomicBool,
    fail_fetches: AtomicBool,
    fail_subscribe: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    authorization_requests: AtomicUsize,
    fetches: AtomicUsize,
}

impl InMemoryDataSource {
    /// Create a source that grants access and uses the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a source whose fetch windows are measured against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SourceState::default()),
            grant: AtomicBool::new(true),
            fail_fetches: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
            authorization_requests: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Whether authorization requests are granted
    pub fn set_authorized(&self, granted: bool) {
        self.grant.store(granted, Ordering::SeqCst);
    }

    /// Make every fetch fail with a transient error
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make push subscription attempts fail
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delay every fetch, simulating a slow store
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    /// Store a sample without notifying subscribers; only polling will see it
    pub fn record(&self, sample: VitalSample) {
        self.state.lock().history.push(sample);
    }

    /// Store a sample and deliver it to every push subscriber of its metric
    pub fn push(&self, sample: VitalSample) {
        let callbacks = {
            let mut state = self.state.lock();
            state.history.push(sample);
            Self::callbacks_for(&state, sample.metric())
        };

        for callback in callbacks {
            callback(Ok(sample));
        }
    }

    /// Deliver a sample to subscribers without storing it, like a late or replayed delivery
    pub fn redeliver(&self, sample: VitalSample) {
        let callbacks = Self::callbacks_for(&self.state.lock(), sample.metric());
        for callback in callbacks {
            callback(Ok(sample));
        }
    }

    /// Deliver an error to every push subscriber of a metric
    pub fn push_error(&self, metric: MetricKind, message: &str) {
        let callbacks = Self::callbacks_for(&self.state.lock(), metric);
        for callback in callbacks {
            callback(Err(Error::data_source(message)));
        }
    }

    /// Number of live push subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Number of live push subscriptions for one metric
    pub fn subscriber_count_for(&self, metric: MetricKind) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|(m, _)| *m == metric)
            .count()
    }

    /// Number of authorization requests received
    pub fn authorization_requests(&self) -> usize {
        self.authorization_requests.load(Ordering::SeqCst)
    }

    /// Number of `fetch_latest` calls received
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn callbacks_for(state: &SourceState, metric: MetricKind) -> Vec<SampleCallback> {
        state
            .subscribers
            .values()
            .filter(|(m, _)| *m == metric)
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }

    fn in_window(&self, metric: MetricKind, window: Duration) -> Vec<VitalSample> {
        let now = self.clock.now();
        let since = chrono::Duration::from_std(window)
            .map(|w| now - w)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.state
            .lock()
            .history
            .iter()
            .filter(|s| s.metric() == metric && s.observed_at() >= since)
            .copied()
            .collect()
    }

    async fn simulate_fetch(&self) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::data_source("query timed out"));
        }
        Ok(())
    }
}

impl Default for InMemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataSource for InMemoryDataSource {
    async fn request_authorization(&self, metrics: &[MetricKind]) -> Result<Authorization> {
        self.authorization_requests.fetch_add(1, Ordering::SeqCst);
        debug!(?metrics, "Authorization requested");

        if self.grant.load(Ordering::SeqCst) {
            Ok(Authorization::Granted)
        } else {
            Ok(Authorization::Denied)
        }
    }

    async fn subscribe(
        &self,
        metric: MetricKind,
        on_sample: SampleCallback,
    ) -> Result<SubscriptionHandle> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::data_source("observer query rejected"));
        }

        let handle = SubscriptionHandle::new(metric);
        self.state
            .lock()
            .subscribers
            .insert(handle.id(), (metric, on_sample));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.state.lock().subscribers.remove(&handle.id());
    }

    async fn fetch_latest(
        &self,
        metric: MetricKind,
        window: Duration,
    ) -> Result<Option<VitalSample>> {
        self.simulate_fetch().await?;

        Ok(self
            .in_window(metric, window)
            .into_iter()
            .max_by_key(VitalSample::observed_at))
    }

    async fn fetch_aggregate(
        &self,
        metric: MetricKind,
        window: Duration,
        op: AggregateOp,
    ) -> Result<Option<f64>> {
        self.simulate_fetch().await?;

        let values: Vec<f64> = self
            .in_window(metric, window)
            .iter()
            .map(VitalSample::value)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }

        let result = match op {
            AggregateOp::Sum => values.iter().sum(),
            AggregateOp::Average => values.iter().sum::<f64>() / values.len() as f64,
            AggregateOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Ok(Some(result))
    }
}

/// An alert captured by [`RecordingDispatch`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentAlert {
    /// Alerted metric
    pub metric: MetricKind,
    /// Severity sent
    pub severity: VitalStatus,
    /// Triggering value
    pub value: f64,
}

/// Dispatch that records every alert instead of delivering it
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    sent: Mutex<Vec<SentAlert>>,
    fail: AtomicBool,
}

impl RecordingDispatch {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (attempts are still recorded)
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Alerts sent so far
    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().clone()
    }

    /// Number of alerts sent for a metric
    pub fn count_for(&self, metric: MetricKind) -> usize {
        self.sent.lock().iter().filter(|a| a.metric == metric).count()
    }
}

#[async_trait::async_trait]
impl NotificationDispatch for RecordingDispatch {
    async fn send_alert(&self, metric: MetricKind, severity: VitalStatus, value: f64) -> Result<()> {
        self.sent.lock().push(SentAlert {
            metric,
            severity,
            value,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::dispatch("notification service unavailable"));
        }
        Ok(())
    }
}

/// Contact directory with a fixed number of contacts
#[derive(Debug)]
pub struct StaticContactDirectory {
    contacts: usize,
    rounds: AtomicUsize,
}

impl StaticContactDirectory {
    /// Create a directory holding `contacts` entries
    pub fn new(contacts: usize) -> Self {
        Self {
            contacts,
            rounds: AtomicUsize::new(0),
        }
    }

    /// Number of notification rounds requested
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn notify_all(&self) -> Result<usize> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        Ok(self.contacts)
    }
}

/// Location provider that counts share requests
#[derive(Debug, Default)]
pub struct RecordingLocation {
    shares: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingLocation {
    /// Create a provider that succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent shares fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of share requests received
    pub fn shares(&self) -> usize {
        self.shares.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocationProvider for RecordingLocation {
    async fn share_current_location(&self) -> Result<()> {
        self.shares.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::internal("location services disabled"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sample(metric: MetricKind, value: f64, at: DateTime<Utc>) -> VitalSample {
        VitalSample::new(metric, value, at).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_latest_respects_window() {
        let clock = ManualClock::default();
        let source = InMemoryDataSource::with_clock(Arc::new(clock.clone()));
        let start = clock.now();

        source.record(sample(MetricKind::HeartRate, 70.0, start));
        clock.advance(chrono::Duration::minutes(10));

        let recent = source
            .fetch_latest(MetricKind::HeartRate, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(recent.map(|s| s.value()), Some(70.0));

        let stale = source
            .fetch_latest(MetricKind::HeartRate, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_fetch_aggregate() {
        let clock = ManualClock::default();
        let source = InMemoryDataSource::with_clock(Arc::new(clock.clone()));
        let now = clock.now();

        for steps in [1200.0, 800.0, 500.0] {
            source.record(sample(MetricKind::StepCount, steps, now));
        }

        let window = Duration::from_secs(86_400);
        let total = source
            .fetch_aggregate(MetricKind::StepCount, window, AggregateOp::Sum)
            .await
            .unwrap();
        let max = source
            .fetch_aggregate(MetricKind::StepCount, window, AggregateOp::Max)
            .await
            .unwrap();
        let none = source
            .fetch_aggregate(MetricKind::HeartRate, window, AggregateOp::Average)
            .await
            .unwrap();

        assert_eq!(total, Some(2500.0));
        assert_eq!(max, Some(1200.0));
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_push_reaches_only_matching_subscribers() {
        let source = InMemoryDataSource::new();
        let received = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&received);
        source
            .subscribe(
                MetricKind::HeartRate,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        source.push(sample(MetricKind::HeartRate, 80.0, Utc::now()));
        source.push(sample(MetricKind::BloodOxygen, 97.0, Utc::now()));

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
