//! Dual-channel monitor
//!
//! Every observed metric gets two independent delivery paths for the same
//! signal: a push subscription at the data source, which is near real-time
//! but may silently stop firing, and a polling task on a fixed interval,
//! which guarantees liveness. Both paths feed a single staleness gate so the
//! rest of the engine sees one stream of strictly newer samples per metric.

mod poller;
mod subscription;

pub use subscription::{DeliveryChannel, SubscriptionSnapshot};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::models::{MetricKind, VitalSample};
use crate::providers::{AggregateOp, Authorization, DataSource, SampleCallback};

use subscription::MonitorSubscription;

/// Counters describing what the staleness gate did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Samples forwarded to the evaluator
    pub forwarded: u64,
    /// Forwarded samples that came from an on-demand refresh
    pub on_demand: u64,
    /// Duplicate or out-of-order samples dropped
    pub stale: u64,
    /// Samples that arrived after observation stopped
    pub late: u64,
}

/// State shared between the monitor, its push callbacks and its pollers
pub(crate) struct Shared {
    observing: AtomicBool,
    generation: AtomicU64,
    subscriptions: Mutex<HashMap<MetricKind, MonitorSubscription>>,
    sample_tx: mpsc::UnboundedSender<VitalSample>,
    forwarded: AtomicU64,
    on_demand: AtomicU64,
    stale: AtomicU64,
    late: AtomicU64,
}

impl Shared {
    /// Run one delivery through the staleness gate.
    ///
    /// `generation` pins the delivery to the observation session that created
    /// its channel; `None` accepts the current session. The subscription lock
    /// is held while forwarding so per-metric order is preserved.
    pub(crate) fn ingest(
        &self,
        sample: VitalSample,
        generation: Option<u64>,
        channel: DeliveryChannel,
    ) -> bool {
        let metric = sample.metric();

        if !self.observing.load(Ordering::Acquire) {
            self.discard_late(metric, channel);
            return false;
        }

        let mut subscriptions = self.subscriptions.lock();
        let Some(subscription) = subscriptions.get_mut(&metric) else {
            self.discard_late(metric, channel);
            return false;
        };
        if generation.is_some_and(|g| g != subscription.generation) {
            self.discard_late(metric, channel);
            return false;
        }

        if !subscription.accept(&sample) {
            self.stale.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "vitalwatch_samples_dropped_total",
                "metric" => metric.as_str(),
                "reason" => "stale"
            )
            .increment(1);
            trace!(
                metric = %metric,
                channel = ?channel,
                observed_at = %sample.observed_at(),
                "Dropped stale sample"
            );
            return false;
        }

        if self.sample_tx.send(sample).is_err() {
            debug!(metric = %metric, "Sample receiver closed; dropping sample");
            return false;
        }

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        if channel == DeliveryChannel::OnDemand {
            self.on_demand.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "vitalwatch_samples_forwarded_total",
            "metric" => metric.as_str(),
            "channel" => channel.as_str()
        )
        .increment(1);
        debug!(
            metric = %metric,
            channel = ?channel,
            value = sample.value(),
            "Forwarded sample"
        );
        true
    }

    fn discard_late(&self, metric: MetricKind, channel: DeliveryChannel) {
        self.late.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "vitalwatch_samples_dropped_total",
            "metric" => metric.as_str(),
            "reason" => "late"
        )
        .increment(1);
        trace!(metric = %metric, channel = ?channel, "Discarded delivery outside an active subscription");
    }
}

/// Owns the push subscriptions and polling tasks for every observed metric
pub struct DualChannelMonitor {
    source: Arc<dyn DataSource>,
    config: MonitorConfig,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl DualChannelMonitor {
    /// Create a monitor that forwards accepted samples into `sample_tx`
    pub fn new(
        source: Arc<dyn DataSource>,
        config: MonitorConfig,
        sample_tx: mpsc::UnboundedSender<VitalSample>,
    ) -> Self {
        Self {
            source,
            config,
            shared: Arc::new(Shared {
                observing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                subscriptions: Mutex::new(HashMap::new()),
                sample_tx,
                forwarded: AtomicU64::new(0),
                on_demand: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                late: AtomicU64::new(0),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Start observing the given metrics.
    ///
    /// Metrics that are already observed are left untouched, so repeated
    /// calls never create duplicate subscriptions. Authorization is requested
    /// only for metrics not yet observed.
    pub async fn start_observing(&self, metrics: &[MetricKind]) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let requested: BTreeSet<MetricKind> = metrics.iter().copied().collect();
        let pending: Vec<MetricKind> = {
            let subscriptions = self.shared.subscriptions.lock();
            requested
                .into_iter()
                .filter(|m| !subscriptions.contains_key(m))
                .collect()
        };

        if pending.is_empty() {
            debug!("Requested metrics already observed");
            return Ok(());
        }

        match self.source.request_authorization(&pending).await? {
            Authorization::Granted => {}
            Authorization::Denied => {
                warn!(metrics = ?pending, "Data access denied");
                return Err(Error::AuthorizationDenied { metrics: pending });
            }
        }

        let generation = if self.shared.observing.load(Ordering::Acquire) {
            self.shared.generation.load(Ordering::Acquire)
        } else {
            let next = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.shared.observing.store(true, Ordering::Release);
            next
        };

        for metric in pending {
            self.shared
                .subscriptions
                .lock()
                .insert(metric, MonitorSubscription::new(generation));

            let push_handle = match self
                .source
                .subscribe(metric, self.push_callback(metric, generation))
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(metric = %metric, error = %e, "Push subscription failed; relying on polling");
                    None
                }
            };

            let poll_handle = poller::spawn(
                Arc::downgrade(&self.shared),
                Arc::clone(&self.source),
                metric,
                generation,
                self.config.poll_interval,
                self.config.fetch_window,
            );

            if let Some(subscription) = self.shared.subscriptions.lock().get_mut(&metric) {
                subscription.push_handle = push_handle;
                subscription.poll_handle = Some(poll_handle);
            }

            info!(
                metric = %metric,
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "Observing metric"
            );
        }

        Ok(())
    }

    /// Cancel every push subscription and polling task.
    ///
    /// Safe to call when never started and concurrently with in-flight
    /// deliveries; anything delivered afterwards is discarded.
    pub async fn stop_observing(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        self.shared.observing.store(false, Ordering::Release);
        let drained: Vec<(MetricKind, MonitorSubscription)> =
            self.shared.subscriptions.lock().drain().collect();

        if drained.is_empty() {
            debug!("Stop requested while not observing");
            return;
        }

        for (metric, subscription) in drained {
            if let Some(handle) = subscription.push_handle {
                self.source.unsubscribe(&handle).await;
            }
            if let Some(poll) = subscription.poll_handle {
                poll.shutdown().await;
            }
            debug!(metric = %metric, "Released subscription");
        }

        info!("Stopped observing");
    }

    /// Whether an observation session is active
    pub fn is_observing(&self) -> bool {
        self.shared.observing.load(Ordering::Acquire)
    }

    /// Metrics currently observed
    pub fn observed_metrics(&self) -> Vec<MetricKind> {
        let mut metrics: Vec<MetricKind> =
            self.shared.subscriptions.lock().keys().copied().collect();
        metrics.sort();
        metrics
    }

    /// Snapshot of every subscription, ordered by metric
    pub fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let mut snapshots: Vec<SubscriptionSnapshot> = self
            .shared
            .subscriptions
            .lock()
            .iter()
            .map(|(metric, subscription)| subscription.snapshot(*metric))
            .collect();
        snapshots.sort_by_key(|s| s.metric);
        snapshots
    }

    /// Newest forwarded sample for a metric
    pub fn latest(&self, metric: MetricKind) -> Option<VitalSample> {
        self.shared
            .subscriptions
            .lock()
            .get(&metric)
            .and_then(|s| s.snapshot(metric).last_sample)
    }

    /// Gate counters
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            forwarded: self.shared.forwarded.load(Ordering::Relaxed),
            on_demand: self.shared.on_demand.load(Ordering::Relaxed),
            stale: self.shared.stale.load(Ordering::Relaxed),
            late: self.shared.late.load(Ordering::Relaxed),
        }
    }

    /// Fetch the latest sample on demand.
    ///
    /// The fetched sample goes through the same staleness gate as the two
    /// channels, is counted under its own delivery channel and is returned
    /// whether or not it was forwarded. Data source failures yield `None`.
    pub async fn request_latest(&self, metric: MetricKind) -> Option<VitalSample> {
        let sample =
            poller::fetch_latest_or_none(self.source.as_ref(), metric, self.config.fetch_window)
                .await?;
        self.shared.ingest(sample, None, DeliveryChannel::OnDemand);
        Some(sample)
    }

    /// Aggregate a metric over a window, e.g. today's step total.
    ///
    /// Data source failures yield `None`.
    pub async fn aggregate(
        &self,
        metric: MetricKind,
        window: Duration,
        op: AggregateOp,
    ) -> Option<f64> {
        match self.source.fetch_aggregate(metric, window, op).await {
            Ok(value) => value,
            Err(e) => {
                debug!(metric = %metric, op = ?op, error = %e, "Aggregate query failed");
                None
            }
        }
    }

    fn push_callback(&self, metric: MetricKind, generation: u64) -> SampleCallback {
        let shared = Arc::downgrade(&self.shared);

        Arc::new(move |delivery: Result<VitalSample>| {
            let Some(shared) = shared.upgrade() else { return };
            match delivery {
                Ok(sample) if sample.metric() == metric => {
                    shared.ingest(sample, Some(generation), DeliveryChannel::Push);
                }
                Ok(sample) => {
                    warn!(
                        expected = %metric,
                        received = %sample.metric(),
                        "Push delivered a sample for the wrong metric"
                    );
                }
                Err(e) => {
                    warn!(metric = %metric, error = %e, "Push channel error; polling continues");
                }
            }
        })
    }
}

impl Drop for DualChannelMonitor {
    fn drop(&mut self) {
        self.shared.observing.store(false, Ordering::Release);
        for (_, subscription) in self.shared.subscriptions.lock().drain() {
            if let Some(poll) = subscription.poll_handle {
                poll.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::providers::InMemoryDataSource;

    const ALL: [MetricKind; 2] = [MetricKind::HeartRate, MetricKind::BloodOxygen];

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(30),
            fetch_window: Duration::from_secs(3600),
            metrics: ALL.to_vec(),
        }
    }

    fn sample(metric: MetricKind, value: f64, at: DateTime<Utc>) -> VitalSample {
        VitalSample::new(metric, value, at).unwrap()
    }

    fn setup() -> (
        Arc<InMemoryDataSource>,
        DualChannelMonitor,
        mpsc::UnboundedReceiver<VitalSample>,
    ) {
        let source = Arc::new(InMemoryDataSource::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = DualChannelMonitor::new(source.clone(), config(), tx);
        (source, monitor, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<VitalSample>) -> Vec<VitalSample> {
        let mut out = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            out.push(sample);
        }
        out
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (source, monitor, _rx) = setup();

        monitor.start_observing(&ALL).await.unwrap();
        monitor.start_observing(&ALL).await.unwrap();

        assert_eq!(source.subscriber_count_for(MetricKind::HeartRate), 1);
        assert_eq!(source.subscriber_count_for(MetricKind::BloodOxygen), 1);
        assert_eq!(source.authorization_requests(), 1);
        assert_eq!(monitor.observed_metrics(), vec![MetricKind::HeartRate, MetricKind::BloodOxygen]);
    }

    #[tokio::test]
    async fn test_start_adds_new_metrics_only() {
        let (source, monitor, _rx) = setup();

        monitor.start_observing(&[MetricKind::HeartRate]).await.unwrap();
        monitor.start_observing(&ALL).await.unwrap();

        assert_eq!(source.subscriber_count(), 2);
        assert_eq!(source.authorization_requests(), 2);
    }

    #[tokio::test]
    async fn test_denied_authorization_is_surfaced() {
        let (source, monitor, _rx) = setup();
        source.set_authorized(false);

        let err = monitor.start_observing(&ALL).await.unwrap_err();

        assert!(matches!(err, Error::AuthorizationDenied { .. }));
        assert!(!monitor.is_observing());
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_samples_are_dropped() {
        let (source, monitor, mut rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();
        let t0 = Utc::now();

        source.push(sample(MetricKind::HeartRate, 75.0, t0));
        source.redeliver(sample(MetricKind::HeartRate, 75.0, t0));
        source.push(sample(MetricKind::HeartRate, 80.0, t0 - chrono::Duration::seconds(1)));
        source.push(sample(MetricKind::HeartRate, 82.0, t0 + chrono::Duration::seconds(1)));

        let forwarded: Vec<f64> = drain(&mut rx).iter().map(VitalSample::value).collect();
        assert_eq!(forwarded, vec![75.0, 82.0]);
        assert_eq!(monitor.stats().stale, 2);
        assert_eq!(
            monitor.latest(MetricKind::HeartRate).map(|s| s.value()),
            Some(82.0)
        );
    }

    #[tokio::test]
    async fn test_watermarks_are_per_metric() {
        let (source, monitor, mut rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();
        let t0 = Utc::now();

        source.push(sample(MetricKind::HeartRate, 75.0, t0));
        source.push(sample(MetricKind::BloodOxygen, 97.0, t0));

        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_late_push_after_stop_is_discarded() {
        let (source, monitor, mut rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();

        // Capture a callback so it can fire after the subscription is gone.
        let callback = monitor.push_callback(MetricKind::HeartRate, 1);
        monitor.stop_observing().await;

        callback(Ok(sample(MetricKind::HeartRate, 140.0, Utc::now())));
        source.push(sample(MetricKind::HeartRate, 141.0, Utc::now()));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(monitor.stats().late, 1);
        assert_eq!(monitor.stats().forwarded, 0);
    }

    #[tokio::test]
    async fn test_callback_from_previous_session_is_discarded() {
        let (_source, monitor, mut rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();
        let stale_callback = monitor.push_callback(MetricKind::HeartRate, 1);
        monitor.stop_observing().await;
        monitor.start_observing(&ALL).await.unwrap();

        stale_callback(Ok(sample(MetricKind::HeartRate, 140.0, Utc::now())));

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let (_source, monitor, _rx) = setup();
        monitor.stop_observing().await;
        monitor.stop_observing().await;
        assert!(!monitor.is_observing());
    }

    #[tokio::test]
    async fn test_repeated_cycles_release_everything() {
        let (source, monitor, _rx) = setup();

        for _ in 0..5 {
            monitor.start_observing(&ALL).await.unwrap();
            assert_eq!(source.subscriber_count(), 2);
            monitor.stop_observing().await;
            assert_eq!(source.subscriber_count(), 0);
            assert!(monitor.snapshot().is_empty());
        }
    }

    #[tokio::test]
    async fn test_push_error_keeps_observing() {
        let (source, monitor, mut rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();

        source.push_error(MetricKind::HeartRate, "observer query failed");
        source.push(sample(MetricKind::HeartRate, 70.0, Utc::now()));

        assert!(monitor.is_observing());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_delivers_when_push_is_silent() {
        let (source, monitor, mut rx) = setup();
        let t0 = Utc::now();
        source.record(sample(MetricKind::HeartRate, 72.0, t0));

        monitor.start_observing(&[MetricKind::HeartRate]).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.value(), 72.0);

        source.record(sample(MetricKind::HeartRate, 74.0, t0 + chrono::Duration::seconds(5)));
        tokio::time::sleep(Duration::from_secs(31)).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.value(), 74.0);

        // The same sample polled again is a duplicate.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(monitor.stats().stale >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_covers_failed_push_subscription() {
        let (source, monitor, mut rx) = setup();
        source.set_fail_subscribe(true);
        source.record(sample(MetricKind::BloodOxygen, 96.0, Utc::now()));

        monitor.start_observing(&[MetricKind::BloodOxygen]).await.unwrap();

        let snapshot = monitor.snapshot();
        assert!(!snapshot[0].push_active);
        assert!(snapshot[0].poll_active);
        assert_eq!(rx.recv().await.unwrap().value(), 96.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_yields_no_sample() {
        let (source, monitor, mut rx) = setup();
        source.set_fail_fetches(true);
        source.record(sample(MetricKind::HeartRate, 72.0, Utc::now()));

        monitor.start_observing(&[MetricKind::HeartRate]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert!(monitor.is_observing());
        assert!(drain(&mut rx).is_empty());
        assert!(monitor.request_latest(MetricKind::HeartRate).await.is_none());

        source.set_fail_fetches(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_latest_is_attributed_to_on_demand() {
        let (source, monitor, mut rx) = setup();
        source.set_fail_subscribe(true);
        monitor.start_observing(&[MetricKind::HeartRate]).await.unwrap();
        // First poll tick runs against an empty source.
        tokio::time::sleep(Duration::from_secs(1)).await;

        source.record(sample(MetricKind::HeartRate, 81.0, Utc::now()));
        let fetched = monitor.request_latest(MetricKind::HeartRate).await.unwrap();

        assert_eq!(fetched.value(), 81.0);
        assert_eq!(drain(&mut rx).len(), 1);
        let stats = monitor.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.on_demand, 1);
        monitor.stop_observing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetches_do_not_queue_ticks() {
        let (source, monitor, _rx) = setup();
        source.set_fetch_delay(Some(Duration::from_secs(45)));

        monitor.start_observing(&[MetricKind::HeartRate]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        // One fetch per elapsed interval at most: t = 0, 30, 60, 90.
        let fetches = source.fetch_count();
        assert!(fetches >= 2, "polling stalled after {fetches} fetch(es)");
        assert!(fetches <= 4, "ticks queued up: {fetches} fetches");
        monitor.stop_observing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_polling() {
        let (source, monitor, _rx) = setup();
        monitor.start_observing(&ALL).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop_observing().await;

        let fetches = source.fetch_count();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn test_aggregate_swallows_failures() {
        let (source, monitor, _rx) = setup();
        let now = Utc::now();
        source.record(sample(MetricKind::StepCount, 400.0, now));
        source.record(sample(MetricKind::StepCount, 600.0, now));

        let window = Duration::from_secs(86_400);
        assert_eq!(
            monitor.aggregate(MetricKind::StepCount, window, AggregateOp::Sum).await,
            Some(1000.0)
        );

        source.set_fail_fetches(true);
        assert_eq!(
            monitor.aggregate(MetricKind::StepCount, window, AggregateOp::Sum).await,
            None
        );
    }
}
