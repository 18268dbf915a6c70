//! Structured logging setup and in-process dispatch counters.

use crate::activation::{ActivationCompletion, Job, JobKind, UpdateResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// # Example
///
/// ```rust,no_run
/// # use durable_dispatch::runtime::{ObservabilityConfig, LogFormat, init_logging};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// init_logging(&config).expect("logging");
/// ```
///
/// # Correlation Fields
///
/// Dispatcher logs carry:
/// - `workflow_id` - Workflow execution identifier
/// - `run_id` - Run identifier (changes on continue-as-new)
/// - `activation` - Activation index within the run
/// - `update_id` / `handler` - Target of the job being dispatched
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Log output format
    pub log_format: LogFormat,
    /// Log level filter for this crate (e.g., "info", "debug")
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

pub(crate) fn default_filter_expression(level: &str) -> String {
    format!("warn,durable_dispatch={level}")
}

/// Install a global subscriber. `RUST_LOG` overrides the configured level.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {e}"))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {e}"))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {e}"))?;
        }
    }

    Ok(())
}

/// Snapshot of dispatch counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub activations: u64,
    pub signals_dispatched: u64,
    pub signal_failures: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub updates_completed: u64,
    pub updates_failed: u64,
    pub queries_answered: u64,
    pub workflows_finished: u64,
}

/// Counters maintained by the worker as activations complete.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    activations: AtomicU64,
    signals_dispatched: AtomicU64,
    signal_failures: AtomicU64,
    updates_accepted: AtomicU64,
    updates_rejected: AtomicU64,
    updates_completed: AtomicU64,
    updates_failed: AtomicU64,
    queries_answered: AtomicU64,
    workflows_finished: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the signals among a batch about to be dispatched.
    pub fn record_jobs(&self, jobs: &[Job]) {
        let signals = jobs.iter().filter(|job| matches!(job.kind, JobKind::Signal { .. })).count();
        self.signals_dispatched.fetch_add(signals as u64, Ordering::Relaxed);
    }

    pub fn record_activation(&self, completion: &ActivationCompletion) {
        self.activations.fetch_add(1, Ordering::Relaxed);
        for response in &completion.update_responses {
            let counter = match response {
                UpdateResponse::Accepted { .. } => &self.updates_accepted,
                UpdateResponse::Rejected { .. } => &self.updates_rejected,
                UpdateResponse::Completed { .. } => &self.updates_completed,
                UpdateResponse::Failed { .. } => &self.updates_failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.signal_failures
            .fetch_add(completion.signal_failures.len() as u64, Ordering::Relaxed);
        self.queries_answered
            .fetch_add(completion.query_responses.len() as u64, Ordering::Relaxed);
        if completion.status.is_terminal() {
            self.workflows_finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            activations: self.activations.load(Ordering::Relaxed),
            signals_dispatched: self.signals_dispatched.load(Ordering::Relaxed),
            signal_failures: self.signal_failures.load(Ordering::Relaxed),
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            updates_completed: self.updates_completed.load(Ordering::Relaxed),
            updates_failed: self.updates_failed.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
            workflows_finished: self.workflows_finished.load(Ordering::Relaxed),
        }
    }
}
