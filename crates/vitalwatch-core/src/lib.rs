//! # VitalWatch
//!
//! Real-time vital-sign monitoring and threshold alerting.
//!
//! VitalWatch subscribes to a live physiological data source, reconciles its
//! push and polling delivery channels, classifies every new sample against
//! clinical thresholds and decides, under a per-metric cooldown and a
//! user-controlled switch, whether to page the user.
//!
//! ## Architecture
//!
//! - **Monitor**: push subscription plus polling fallback per metric, merged
//!   through a staleness gate
//! - **Alerting**: threshold evaluator, cooldown-gated notifier and the
//!   emergency alert workflow
//! - **Providers**: traits for the data source, notification delivery,
//!   contacts and location, with in-memory and webhook implementations
//! - **Engine**: wires the pieces together and publishes engine events
//!
//! ## Quick Start
//!
//! ```bash
//! # Replay the classic tachycardia scenario
//! vitalwatch simulate --metric heart-rate --values 75,132,135,140 --spacing 10s
//!
//! # Show the threshold table
//! vitalwatch thresholds
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod monitor;
pub mod providers;

pub use config::Config;
pub use engine::{EngineBuilder, EngineEvent, VitalEngine};
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertOrchestrator, AutoAlertSwitch, CooldownNotifier, NotifyOutcome, ThresholdEvaluator};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::engine::{EngineBuilder, EngineEvent, VitalEngine};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::monitor::DualChannelMonitor;
    pub use crate::providers::{ContactDirectory, DataSource, LocationProvider, NotificationDispatch};
}
