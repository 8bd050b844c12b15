//! Emergency alert workflow

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::models::{AlertStatus, AlertTrigger};
use crate::providers::{ContactDirectory, LocationProvider};

/// Runs the "send emergency alert" action shared by manual and automatic triggers
pub struct AlertOrchestrator {
    contacts: Arc<dyn ContactDirectory>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    status: Mutex<AlertStatus>,
}

impl AlertOrchestrator {
    /// Create an orchestrator
    pub fn new(
        contacts: Arc<dyn ContactDirectory>,
        location: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            contacts,
            location,
            clock,
            status: Mutex::new(AlertStatus::default()),
        }
    }

    /// Send an emergency alert on the user's behalf
    pub async fn send_emergency_alert(&self) -> AlertStatus {
        self.send(AlertTrigger::Manual).await
    }

    /// Run one alert round.
    ///
    /// Every call records exactly one notification round; calls are never
    /// deduplicated. Location is marked shared once the provider succeeds.
    pub async fn send(&self, trigger: AlertTrigger) -> AlertStatus {
        let (located, reached) = futures::future::join(
            self.location.share_current_location(),
            self.contacts.notify_all(),
        )
        .await;

        if let Err(e) = &located {
            warn!(error = %e, "Failed to share location");
        }
        let reached = match reached {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to notify contacts");
                0
            }
        };

        let status = {
            let mut status = self.status.lock();
            status.is_location_shared |= located.is_ok();
            status.contacts_notified += 1;
            status.recipients_reached += reached;
            status.last_alert_at = Some(self.clock.now());
            status.last_trigger = Some(trigger);
            status.clone()
        };

        metrics::counter!("vitalwatch_emergency_alerts_total", "trigger" => trigger.as_str())
            .increment(1);
        info!(
            trigger = trigger.as_str(),
            round = status.contacts_notified,
            recipients = reached,
            location_shared = status.is_location_shared,
            "Emergency alert sent"
        );

        status
    }

    /// Current alert status
    pub fn status(&self) -> AlertStatus {
        self.status.lock().clone()
    }
}
