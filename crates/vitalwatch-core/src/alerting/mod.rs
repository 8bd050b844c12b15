//! Alerting for VitalWatch
//!
//! Threshold classification, cooldown-gated notification and the emergency
//! alert workflow.

mod evaluator;
mod notifier;
mod orchestrator;

pub use evaluator::ThresholdEvaluator;
pub use notifier::{AutoAlertSwitch, CooldownNotifier, CooldownState, NotifyOutcome};
pub use orchestrator::AlertOrchestrator;
