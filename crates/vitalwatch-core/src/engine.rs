//! Engine wiring
//!
//! Connects the dual-channel monitor to the evaluator and notifier through
//! an explicit sample channel. A router task fans samples out to one lane per
//! metric, so metrics are handled independently while each keeps its
//! arrival order. What happened is published on a broadcast channel for the
//! surrounding application.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::alerting::{
    AlertOrchestrator, AutoAlertSwitch, CooldownNotifier, NotifyOutcome, ThresholdEvaluator,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{AlertStatus, ClassificationEvent, MetricKind, VitalSample};
use crate::monitor::{DualChannelMonitor, SubscriptionSnapshot};
use crate::providers::{ContactDirectory, DataSource, LocationProvider, NotificationDispatch};

const EVENT_CAPACITY: usize = 256;

/// Something the engine did, published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A forwarded sample was classified
    Classified(ClassificationEvent),
    /// The notifier handled a classification
    Notified(NotifyOutcome),
    /// An emergency alert round ran
    Emergency(AlertStatus),
}

/// Builder for [`VitalEngine`]
pub struct EngineBuilder {
    config: Config,
    source: Option<Arc<dyn DataSource>>,
    dispatch: Option<Arc<dyn NotificationDispatch>>,
    contacts: Option<Arc<dyn ContactDirectory>>,
    location: Option<Arc<dyn LocationProvider>>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    /// Start building an engine with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            source: None,
            dispatch: None,
            contacts: None,
            location: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Physiological data source
    #[must_use]
    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Alert delivery
    #[must_use]
    pub fn dispatch(mut self, dispatch: Arc<dyn NotificationDispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Emergency contacts
    #[must_use]
    pub fn contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Location sharing
    #[must_use]
    pub fn location(mut self, location: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(location);
        self
    }

    /// Time source for cooldowns and alert timestamps
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<VitalEngine> {
        self.config.validate()?;

        let source = self
            .source
            .ok_or_else(|| Error::config("a data source is required"))?;
        let dispatch = self
            .dispatch
            .ok_or_else(|| Error::config("a notification dispatch is required"))?;
        let contacts = self
            .contacts
            .ok_or_else(|| Error::config("a contact directory is required"))?;
        let location = self
            .location
            .ok_or_else(|| Error::config("a location provider is required"))?;

        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let switch = AutoAlertSwitch::new(self.config.alerting.auto_alert_enabled);
        let orchestrator = Arc::new(AlertOrchestrator::new(
            contacts,
            location,
            Arc::clone(&self.clock),
        ));

        let mut notifier = CooldownNotifier::new(
            &self.config.alerting,
            dispatch,
            switch.subscribe(),
            Arc::clone(&self.clock),
        );
        if self.config.alerting.escalate_critical {
            notifier = notifier.with_escalation(Arc::clone(&orchestrator));
        }

        Ok(VitalEngine {
            monitor: DualChannelMonitor::new(source, self.config.monitor.clone(), sample_tx),
            evaluator: Arc::new(ThresholdEvaluator::new(self.config.thresholds.clone())),
            notifier: Arc::new(notifier),
            orchestrator,
            switch,
            events,
            sample_rx: Mutex::new(Some(sample_rx)),
            worker: Mutex::new(None),
            config: self.config,
        })
    }
}

/// The vital-sign monitoring and alerting engine
pub struct VitalEngine {
    config: Config,
    monitor: DualChannelMonitor,
    evaluator: Arc<ThresholdEvaluator>,
    notifier: Arc<CooldownNotifier>,
    orchestrator: Arc<AlertOrchestrator>,
    switch: AutoAlertSwitch,
    events: broadcast::Sender<EngineEvent>,
    sample_rx: Mutex<Option<mpsc::UnboundedReceiver<VitalSample>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VitalEngine {
    /// Start building an engine
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Start observing the given metrics
    pub async fn start(&self, metrics: &[MetricKind]) -> Result<()> {
        self.ensure_worker();
        self.monitor.start_observing(metrics).await
    }

    /// Start observing the metrics listed in the configuration
    pub async fn start_configured(&self) -> Result<()> {
        let metrics = self.config.monitor.metrics.clone();
        self.start(&metrics).await
    }

    /// Stop observing every metric
    pub async fn stop(&self) {
        self.monitor.stop_observing().await;
    }

    /// Run the emergency alert workflow on the user's behalf
    pub async fn send_emergency_alert(&self) -> AlertStatus {
        let status = self.orchestrator.send_emergency_alert().await;
        let _ = self.events.send(EngineEvent::Emergency(status.clone()));
        status
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The user's auto-alert toggle
    pub fn auto_alert(&self) -> &AutoAlertSwitch {
        &self.switch
    }

    /// Current alert workflow status
    pub fn alert_status(&self) -> AlertStatus {
        self.orchestrator.status()
    }

    /// Per-metric view of the latest vitals and channel liveness
    pub fn vitals(&self) -> Vec<SubscriptionSnapshot> {
        self.monitor.snapshot()
    }

    /// The monitor
    pub fn monitor(&self) -> &DualChannelMonitor {
        &self.monitor
    }

    /// The evaluator
    pub fn evaluator(&self) -> &ThresholdEvaluator {
        &self.evaluator
    }

    /// The notifier
    pub fn notifier(&self) -> &CooldownNotifier {
        &self.notifier
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some(sample_rx) = self.sample_rx.lock().take() else {
            return;
        };

        let stages = Stages {
            evaluator: Arc::clone(&self.evaluator),
            notifier: Arc::clone(&self.notifier),
            orchestrator: Arc::clone(&self.orchestrator),
            escalate_critical: self.config.alerting.escalate_critical,
            events: self.events.clone(),
        };
        let task = tokio::spawn(run_worker(sample_rx, stages));
        *worker = Some(task);
        info!("Engine worker started");
    }
}

impl Drop for VitalEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// The classify-notify-escalate chain shared by every metric lane
#[derive(Clone)]
struct Stages {
    evaluator: Arc<ThresholdEvaluator>,
    notifier: Arc<CooldownNotifier>,
    orchestrator: Arc<AlertOrchestrator>,
    escalate_critical: bool,
    events: broadcast::Sender<EngineEvent>,
}

/// Route forwarded samples into one lane per metric.
///
/// A lane handles its metric's samples in arrival order. Lanes run
/// independently, so a slow dispatch for one metric never holds up another.
async fn run_worker(mut sample_rx: mpsc::UnboundedReceiver<VitalSample>, stages: Stages) {
    let mut lanes: HashMap<MetricKind, mpsc::UnboundedSender<VitalSample>> = HashMap::new();
    let mut tasks = JoinSet::new();

    while let Some(sample) = sample_rx.recv().await {
        let metric = sample.metric();
        let lane = lanes.entry(metric).or_insert_with(|| {
            let (lane_tx, lane_rx) = mpsc::unbounded_channel();
            tasks.spawn(run_lane(metric, lane_rx, stages.clone()));
            debug!(metric = %metric, "Opened metric lane");
            lane_tx
        });
        if lane.send(sample).is_err() {
            warn!(metric = %metric, "Metric lane closed; dropping sample");
        }
    }

    drop(lanes);
    while tasks.join_next().await.is_some() {}
    debug!("Sample channel closed; engine worker exiting");
}

async fn run_lane(
    metric: MetricKind,
    mut lane_rx: mpsc::UnboundedReceiver<VitalSample>,
    stages: Stages,
) {
    while let Some(sample) = lane_rx.recv().await {
        let event = stages.evaluator.classify(&sample);
        debug!(
            metric = %metric,
            value = sample.value(),
            status = ?event.status(),
            "Classified sample"
        );
        let _ = stages.events.send(EngineEvent::Classified(event));

        let outcome = stages.notifier.on_classification(&event).await;
        let escalated = stages.escalate_critical && outcome.escalates();
        let _ = stages.events.send(EngineEvent::Notified(outcome));

        if escalated {
            let _ = stages
                .events
                .send(EngineEvent::Emergency(stages.orchestrator.status()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::VitalStatus;
    use crate::providers::{
        InMemoryDataSource, RecordingDispatch, RecordingLocation, StaticContactDirectory,
    };
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    /// Dispatch that stalls for one metric only
    struct SlowDispatch {
        slow_metric: MetricKind,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl NotificationDispatch for SlowDispatch {
        async fn send_alert(
            &self,
            metric: MetricKind,
            _severity: VitalStatus,
            _value: f64,
        ) -> Result<()> {
            if metric == self.slow_metric {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    struct Harness {
        clock: ManualClock,
        source: Arc<InMemoryDataSource>,
        dispatch: Arc<RecordingDispatch>,
        engine: VitalEngine,
    }

    fn harness(config: Config) -> Harness {
        let clock = ManualClock::default();
        let source = Arc::new(InMemoryDataSource::with_clock(Arc::new(clock.clone())));
        let dispatch = Arc::new(RecordingDispatch::new());
        let engine = VitalEngine::builder(config)
            .data_source(source.clone())
            .dispatch(dispatch.clone())
            .contacts(Arc::new(StaticContactDirectory::new(2)))
            .location(Arc::new(RecordingLocation::new()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        Harness {
            clock,
            source,
            dispatch,
            engine,
        }
    }

    fn heart_rate(h: &Harness, value: f64) -> VitalSample {
        VitalSample::new(MetricKind::HeartRate, value, h.clock.now()).unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .unwrap()
    }

    async fn classify_and_notify(
        rx: &mut broadcast::Receiver<EngineEvent>,
    ) -> (ClassificationEvent, NotifyOutcome) {
        let EngineEvent::Classified(classified) = next_event(rx).await else {
            panic!("expected a classification event");
        };
        let EngineEvent::Notified(outcome) = next_event(rx).await else {
            panic!("expected a notification outcome");
        };
        (classified, outcome)
    }

    #[tokio::test]
    async fn test_heart_rate_alert_scenario() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();
        h.engine.start(&[MetricKind::HeartRate]).await.unwrap();

        h.source.push(heart_rate(&h, 75.0));
        let (classified, outcome) = classify_and_notify(&mut rx).await;
        assert_eq!(classified.status(), VitalStatus::Normal);
        assert_eq!(outcome, NotifyOutcome::NotAbnormal);

        h.clock.advance(ChronoDuration::seconds(1));
        h.source.push(heart_rate(&h, 132.0));
        let (classified, outcome) = classify_and_notify(&mut rx).await;
        assert_eq!(classified.status(), VitalStatus::Critical);
        assert!(matches!(outcome, NotifyOutcome::Dispatched(_)));
        let EngineEvent::Emergency(status) = next_event(&mut rx).await else {
            panic!("expected escalation");
        };
        assert_eq!(status.contacts_notified, 1);

        h.clock.advance(ChronoDuration::seconds(10));
        h.source.push(heart_rate(&h, 135.0));
        let (_, outcome) = classify_and_notify(&mut rx).await;
        assert!(matches!(outcome, NotifyOutcome::Suppressed { .. }));

        h.clock.advance(ChronoDuration::seconds(125));
        h.source.push(heart_rate(&h, 140.0));
        let (_, outcome) = classify_and_notify(&mut rx).await;
        assert!(matches!(outcome, NotifyOutcome::Dispatched(_)));

        let sent: Vec<f64> = h.dispatch.sent().iter().map(|a| a.value).collect();
        assert_eq!(sent, vec![132.0, 140.0]);
        assert_eq!(h.engine.alert_status().contacts_notified, 2);
        assert_eq!(
            h.engine.vitals()[0].last_sample.map(|s| s.value()),
            Some(140.0)
        );
    }

    #[tokio::test]
    async fn test_disabled_auto_alert_still_classifies() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();
        h.engine.auto_alert().set(false);
        h.engine.start(&[MetricKind::HeartRate]).await.unwrap();

        h.source.push(heart_rate(&h, 135.0));
        let (classified, outcome) = classify_and_notify(&mut rx).await;

        assert_eq!(classified.status(), VitalStatus::Critical);
        assert_eq!(outcome, NotifyOutcome::AutoAlertDisabled);
        assert!(h.dispatch.sent().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_can_be_disabled() {
        let mut config = Config::default();
        config.alerting.escalate_critical = false;
        let h = harness(config);
        let mut rx = h.engine.subscribe();
        h.engine.start(&[MetricKind::HeartRate]).await.unwrap();

        h.source.push(heart_rate(&h, 150.0));
        let (_, outcome) = classify_and_notify(&mut rx).await;

        assert!(matches!(outcome, NotifyOutcome::Dispatched(_)));
        assert_eq!(h.engine.alert_status().contacts_notified, 0);
    }

    #[tokio::test]
    async fn test_manual_emergency_alerts_accumulate() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();

        let first = h.engine.send_emergency_alert().await;
        let second = h.engine.send_emergency_alert().await;

        assert!(first.is_location_shared);
        assert_eq!(first.contacts_notified, 1);
        assert!(second.is_location_shared);
        assert_eq!(second.contacts_notified, 2);
        assert!(matches!(next_event(&mut rx).await, EngineEvent::Emergency(_)));
        assert!(matches!(next_event(&mut rx).await, EngineEvent::Emergency(_)));
    }

    #[tokio::test]
    async fn test_no_events_after_stop() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();
        h.engine.start(&[MetricKind::HeartRate]).await.unwrap();
        h.engine.stop().await;

        h.source.push(heart_rate(&h, 150.0));

        let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(waited.is_err());
        assert!(h.dispatch.sent().is_empty());
    }

    #[tokio::test]
    async fn test_denied_authorization_produces_no_events() {
        let h = harness(Config::default());
        h.source.set_authorized(false);

        let err = h.engine.start(&[MetricKind::HeartRate]).await.unwrap_err();

        assert!(matches!(err, Error::AuthorizationDenied { .. }));
        assert!(h.engine.vitals().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();

        h.engine.start_configured().await.unwrap();
        h.engine.stop().await;
        h.engine.start(&[MetricKind::BloodOxygen]).await.unwrap();

        h.source
            .push(VitalSample::new(MetricKind::BloodOxygen, 97.0, h.clock.now()).unwrap());
        let (classified, _) = classify_and_notify(&mut rx).await;
        assert_eq!(classified.metric(), MetricKind::BloodOxygen);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = VitalEngine::builder(Config::default())
            .dispatch(Arc::new(RecordingDispatch::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_dispatch_does_not_delay_other_metrics() {
        let clock = ManualClock::default();
        let source = Arc::new(InMemoryDataSource::with_clock(Arc::new(clock.clone())));
        let engine = VitalEngine::builder(Config::default())
            .data_source(source.clone())
            .dispatch(Arc::new(SlowDispatch {
                slow_metric: MetricKind::HeartRate,
                delay: Duration::from_secs(30),
            }))
            .contacts(Arc::new(StaticContactDirectory::new(1)))
            .location(Arc::new(RecordingLocation::new()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let mut rx = engine.subscribe();
        engine
            .start(&[MetricKind::HeartRate, MetricKind::BloodOxygen])
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        source.push(VitalSample::new(MetricKind::HeartRate, 150.0, clock.now()).unwrap());
        source.push(VitalSample::new(MetricKind::BloodOxygen, 85.0, clock.now()).unwrap());

        let mut dispatched_after = HashMap::new();
        while dispatched_after.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .expect("timed out waiting for dispatch")
                .unwrap();
            if let EngineEvent::Notified(NotifyOutcome::Dispatched(record)) = event {
                dispatched_after.insert(record.metric, started.elapsed());
            }
        }

        assert!(dispatched_after[&MetricKind::BloodOxygen] < Duration::from_secs(1));
        assert!(dispatched_after[&MetricKind::HeartRate] >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_failed_critical_dispatch_still_reaches_contacts() {
        let h = harness(Config::default());
        let mut rx = h.engine.subscribe();
        h.dispatch.set_fail(true);
        h.engine.start(&[MetricKind::HeartRate]).await.unwrap();

        h.source.push(heart_rate(&h, 150.0));
        let (_, outcome) = classify_and_notify(&mut rx).await;
        assert!(matches!(outcome, NotifyOutcome::DispatchFailed(_)));

        let EngineEvent::Emergency(status) = next_event(&mut rx).await else {
            panic!("expected escalation after a failed dispatch");
        };
        assert_eq!(status.contacts_notified, 1);
        assert_eq!(status.recipients_reached, 2);
    }
}
