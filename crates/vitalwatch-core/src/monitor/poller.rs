//! Polling fallback channel

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::models::{MetricKind, VitalSample};
use crate::providers::DataSource;

use super::subscription::{DeliveryChannel, PollHandle};
use super::Shared;

/// Fetch the latest sample, treating any data source failure as "no sample"
pub(crate) async fn fetch_latest_or_none(
    source: &dyn DataSource,
    metric: MetricKind,
    window: Duration,
) -> Option<VitalSample> {
    match source.fetch_latest(metric, window).await {
        Ok(sample) => sample,
        Err(e) => {
            debug!(metric = %metric, error = %e, "Latest-sample query failed; treating as no sample");
            None
        }
    }
}

/// Spawn the polling task for one metric.
///
/// A fetch is bounded by the poll interval; ticks that fall due while a fetch
/// is in flight are skipped rather than queued.
pub(crate) fn spawn(
    shared: Weak<Shared>,
    source: Arc<dyn DataSource>,
    metric: MetricKind,
    generation: u64,
    interval: Duration,
    window: Duration,
) -> PollHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                () = token.cancelled() => break,
                result = tokio::time::timeout(
                    interval,
                    fetch_latest_or_none(source.as_ref(), metric, window),
                ) => result,
            };

            let sample = match fetched {
                Ok(sample) => sample,
                Err(_) => {
                    warn!(
                        metric = %metric,
                        interval_ms = interval.as_millis() as u64,
                        "Poll fetch exceeded the poll interval; skipping tick"
                    );
                    None
                }
            };

            let Some(sample) = sample else { continue };
            let Some(shared) = shared.upgrade() else { break };
            shared.ingest(sample, Some(generation), DeliveryChannel::Poll);
        }

        trace!(metric = %metric, "Poller stopped");
    });

    PollHandle::new(cancel, task)
}
