//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Periodic stop-all and certificate renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    StopAll,
    CertificateRenewal,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::StopAll => "stop_all",
            Job::CertificateRenewal => "certificate_renewal",
        }
    }
}

/// Running scheduler loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Number of enabled loops.
    pub fn jobs(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every loop and wait for it. A pass in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

pub struct ReconciliationScheduler;

impl ReconciliationScheduler {
    /// Start the loops enabled in `[scheduler]`. The first pass of each runs
    /// one full interval after start.
    pub fn spawn(orchestrator: Arc<Orchestrator>) -> SchedulerHandle {
        let (shutdown, _) = broadcast::channel(4);
        let config = orchestrator.config().scheduler.clone();
        let mut tasks = Vec::new();
        if config.stop_all_enabled {
            tasks.push(spawn_loop(
                Job::StopAll,
                config.stop_all_interval,
                orchestrator.clone(),
                shutdown.subscribe(),
            ));
        }
        if config.cert_renewal_enabled {
            tasks.push(spawn_loop(
                Job::CertificateRenewal,
                config.cert_renewal_interval,
                orchestrator,
                shutdown.subscribe(),
            ));
        }
        info!(jobs = tasks.len(), "scheduler started");
        SchedulerHandle { shutdown, tasks }
    }
}

fn spawn_loop(
    job: Job,
    period: Duration,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(job = job.name(), "scheduler loop shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    info!(job = job.name(), "scheduled pass started");
                    match job {
                        Job::StopAll => {
                            let summary = orchestrator.reconcile_all_tenants().await;
                            info!(job = job.name(), stopped = summary.stopped.len(), failed = summary.failed.len(), "scheduled pass finished");
                        }
                        Job::CertificateRenewal => {
                            let summary = orchestrator.renew_all_certificates().await;
                            info!(job = job.name(), renewed = summary.renewed.len(), failed = summary.failed.len(), "scheduled pass finished");
                        }
                    }
                }
            }
        }
    })
}
