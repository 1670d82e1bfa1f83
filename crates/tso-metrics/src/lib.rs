//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry,
};

mod exporter;

pub use exporter::{spawn_http_server, MetricsServer};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "tsod_starts_total",
            "Total number of times the orchestrator daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tsod_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

/// Metrics describing lifecycle transitions driven by the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorMetrics {
    transitions: IntCounterVec,
    phase_duration: HistogramVec,
    active_services: IntGaugeVec,
    rollbacks: IntCounterVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "tso_transitions_total",
                "Per-service lifecycle transitions by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let phase_duration = HistogramVec::new(
            HistogramOpts::new(
                "tso_phase_duration_seconds",
                "Wall-clock time spent in each orchestration phase",
            )
            .buckets(prometheus::exponential_buckets(0.5, 2.0, 12)?),
            &["phase"],
        )?;
        registry.register(Box::new(phase_duration.clone()))?;

        let active_services = IntGaugeVec::new(
            Opts::new(
                "tso_active_services",
                "Number of ACTIVE service bindings per organization",
            ),
            &["organization"],
        )?;
        registry.register(Box::new(active_services.clone()))?;

        let rollbacks = IntCounterVec::new(
            Opts::new(
                "tso_rollbacks_total",
                "Phase-scoped rollbacks triggered by failures or timeouts",
            ),
            &["phase"],
        )?;
        registry.register(Box::new(rollbacks.clone()))?;

        Ok(Self {
            transitions,
            phase_duration,
            active_services,
            rollbacks,
        })
    }

    pub fn record_transition(&self, operation: &str, outcome: &str) {
        self.transitions
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn observe_phase(&self, phase: &str, seconds: f64) {
        self.phase_duration
            .with_label_values(&[phase])
            .observe(seconds);
    }

    pub fn set_active_services(&self, organization: &str, count: usize) {
        self.active_services
            .with_label_values(&[organization])
            .set(count as i64);
    }

    pub fn record_rollback(&self, phase: &str) {
        self.rollbacks.with_label_values(&[phase]).inc();
    }
}

pub use prometheus;
