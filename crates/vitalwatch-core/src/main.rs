//! VitalWatch CLI
//!
//! Command-line driver for the VitalWatch monitoring engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use vitalwatch::alerting::{AlertOrchestrator, NotifyOutcome, ThresholdEvaluator};
use vitalwatch::clock::{Clock, ManualClock, SystemClock};
use vitalwatch::config::LoggingConfig;
use vitalwatch::models::{MetricKind, VitalSample, VitalStatus};
use vitalwatch::providers::{
    InMemoryDataSource, LogDispatch, NotificationDispatch, RecordingLocation,
    StaticContactDirectory, WebhookDispatch,
};
use vitalwatch::{Config, EngineEvent, VitalEngine};

/// VitalWatch - vital-sign monitoring and alerting
#[derive(Parser)]
#[command(name = "vitalwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "VITALWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single reading
    Classify {
        /// Metric (heart-rate, blood-oxygen, respiration-rate, step-count)
        #[arg(long)]
        metric: MetricKind,

        /// Reading value in the metric's unit
        #[arg(long, allow_hyphen_values = true)]
        value: f64,
    },

    /// Show the effective threshold table
    Thresholds,

    /// Show the effective configuration
    Config,

    /// Replay readings through the full engine
    Simulate {
        /// Metric to simulate
        #[arg(long, default_value = "heart-rate")]
        metric: MetricKind,

        /// Comma-separated readings (defaults to 75,132,135,140)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, conflicts_with = "random")]
        values: Vec<f64>,

        /// Generate this many readings as a random walk instead
        #[arg(long)]
        random: Option<usize>,

        /// Simulated time between readings
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        spacing: Duration,

        /// Start with auto-alerting switched off
        #[arg(long)]
        no_auto_alert: bool,

        /// Number of emergency contacts
        #[arg(long, default_value = "3")]
        contacts: usize,
    },

    /// Send a manual emergency alert
    Alert {
        /// Number of emergency contacts
        #[arg(long, default_value = "3")]
        contacts: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initialising logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Classify { metric, value } => run_classify(&config, metric, value, cli.format),
        Commands::Thresholds => run_thresholds(&config, cli.format),
        Commands::Config => run_config(&config),
        Commands::Simulate {
            metric,
            values,
            random,
            spacing,
            no_auto_alert,
            contacts,
        } => {
            let values = match random {
                Some(count) => random_walk(metric, count),
                None if values.is_empty() => vec![75.0, 132.0, 135.0, 140.0],
                None => values,
            };
            run_simulate(config, metric, values, spacing, !no_auto_alert, contacts, cli.format).await
        }
        Commands::Alert { contacts } => run_alert(contacts, cli.format).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.format == "json" {
        layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(filter())
                .boxed(),
        );
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter())
                .boxed(),
        );
    }

    let mut guard = None;
    if let Some(path) = &config.file {
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().context("logging.file must name a file")?;

        let (writer, worker_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
        guard = Some(worker_guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter())
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("a global subscriber is already installed")?;

    Ok(guard)
}

fn run_classify(
    config: &Config,
    metric: MetricKind,
    value: f64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let evaluator = ThresholdEvaluator::new(config.thresholds.clone());
    let event = evaluator.classify(&VitalSample::new(metric, value, Utc::now())?);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&event)?),
        OutputFormat::Text => println!(
            "{} {} {}: {}",
            metric.display_name(),
            value,
            metric.unit(),
            event.status()
        ),
    }
    Ok(())
}

fn run_thresholds(config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&config.thresholds)?);
        return Ok(());
    }

    let show = |bound: Option<f64>| bound.map_or_else(|| "-".to_string(), |b| b.to_string());

    println!(
        "{:<18} {:>12} {:>12} {:>12} {:>13}  unit",
        "metric", "critical_low", "warning_low", "warning_high", "critical_high"
    );
    for metric in MetricKind::ALL {
        let band = config.thresholds.band(metric);
        println!(
            "{:<18} {:>12} {:>12} {:>12} {:>13}  {}",
            metric.as_str(),
            show(band.critical_low),
            show(band.warning_low),
            show(band.warning_high),
            show(band.critical_high),
            metric.unit()
        );
    }
    Ok(())
}

fn run_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn build_dispatch(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn NotificationDispatch>> {
    match &config.alerting.webhook {
        Some(webhook) => {
            info!(url = %webhook.url, "Delivering alerts to webhook");
            Ok(Arc::new(WebhookDispatch::new(webhook, clock)?))
        }
        None => Ok(Arc::new(LogDispatch)),
    }
}

fn random_walk(metric: MetricKind, count: usize) -> Vec<f64> {
    let (start, step, floor) = match metric {
        MetricKind::HeartRate => (75.0, 12.0, 20.0),
        MetricKind::BloodOxygen => (97.0, 2.0, 70.0),
        MetricKind::RespirationRate => (16.0, 3.0, 2.0),
        MetricKind::StepCount => (100.0, 60.0, 0.0),
    };

    let mut rng = rand::thread_rng();
    let mut value: f64 = start;
    (0..count)
        .map(|_| {
            let current = value;
            value = (value + rng.gen_range(-step..=step)).max(floor);
            if metric == MetricKind::BloodOxygen {
                value = value.min(100.0);
            }
            current.round()
        })
        .collect()
}

async fn run_simulate(
    mut config: Config,
    metric: MetricKind,
    values: Vec<f64>,
    spacing: Duration,
    auto_alert: bool,
    contacts: usize,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if spacing.is_zero() {
        bail!("--spacing must be greater than zero");
    }
    config.alerting.auto_alert_enabled = auto_alert;

    let clock = ManualClock::default();
    let source = Arc::new(InMemoryDataSource::with_clock(Arc::new(clock.clone())));
    let dispatch = build_dispatch(&config, Arc::new(clock.clone()))?;

    let engine = VitalEngine::builder(config)
        .data_source(source.clone())
        .dispatch(dispatch)
        .contacts(Arc::new(StaticContactDirectory::new(contacts)))
        .location(Arc::new(RecordingLocation::new()))
        .clock(Arc::new(clock.clone()))
        .build()?;

    let mut events = engine.subscribe();
    engine.start(&[metric]).await?;
    let step = chrono::Duration::from_std(spacing).context("--spacing is too large")?;

    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            clock.advance(step);
        }
        source.push(VitalSample::new(metric, *value, clock.now())?);
        drain_sample_events(&mut events, clock.now(), format).await?;
    }

    engine.stop().await;

    let status = engine.alert_status();
    let stats = engine.monitor().stats();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "alert_status": status, "monitor": stats })
        ),
        OutputFormat::Text => println!(
            "\n{} samples forwarded, {} stale; {} emergency round(s)",
            stats.forwarded, stats.stale, status.contacts_notified
        ),
    }
    Ok(())
}

/// Print the events one sample produces: its classification, the notifier
/// outcome and any escalation that followed
async fn drain_sample_events(
    events: &mut broadcast::Receiver<EngineEvent>,
    at: chrono::DateTime<Utc>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut wait = Duration::from_secs(5);
    loop {
        let event = match tokio::time::timeout(wait, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Event stream lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => bail!("engine stopped unexpectedly"),
            Err(_) if wait < Duration::from_secs(1) => return Ok(()),
            Err(_) => bail!("no engine event within {}", humantime::format_duration(wait)),
        };

        print_event(&event, at, format)?;
        if matches!(event, EngineEvent::Notified(_)) {
            // Escalation, if any, follows immediately.
            wait = Duration::from_millis(100);
        }
    }
}

fn print_event(
    event: &EngineEvent,
    at: chrono::DateTime<Utc>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        EngineEvent::Classified(classified) => {
            let sample = classified.sample();
            println!(
                "[{}] {} {} {} -> {}",
                at.format("%H:%M:%S"),
                sample.metric().display_name(),
                sample.value(),
                sample.metric().unit(),
                classified.status()
            );
        }
        EngineEvent::Notified(outcome) => match outcome {
            NotifyOutcome::Dispatched(record) => println!(
                "           alert dispatched ({})",
                if record.status == VitalStatus::Critical { "critical" } else { "warning" }
            ),
            NotifyOutcome::DispatchFailed(record) => println!(
                "           alert failed: {}",
                record.error.as_deref().unwrap_or("unknown error")
            ),
            NotifyOutcome::Suppressed { remaining, .. } => println!(
                "           suppressed by cooldown ({} left)",
                humantime::format_duration(*remaining)
            ),
            NotifyOutcome::AutoAlertDisabled => println!("           auto-alert disabled"),
            NotifyOutcome::NotAbnormal => {}
        },
        EngineEvent::Emergency(status) => println!(
            "           emergency round {}: location shared = {}, {} contact(s) reached",
            status.contacts_notified, status.is_location_shared, status.recipients_reached
        ),
    }
    Ok(())
}

async fn run_alert(contacts: usize, format: OutputFormat) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = AlertOrchestrator::new(
        Arc::new(StaticContactDirectory::new(contacts)),
        Arc::new(RecordingLocation::new()),
        clock,
    );

    let status = orchestrator.send_emergency_alert().await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => println!(
            "Emergency alert sent: location shared = {}, {} contact(s) reached",
            status.is_location_shared, status.recipients_reached
        ),
    }
    Ok(())
}
