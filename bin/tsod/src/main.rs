//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the orchestrator daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tso_common::{init_tracing, AppConfig};
use tso_core::{
    ActivationMode, ActivationRequest, Collaborators, DeactivationRequest, Orchestrator,
    ReconciliationScheduler, ServiceSelection, StopSelection,
};
use tso_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, MetricsServer, OrchestratorMetrics,
    SharedRegistry,
};
use tso_persistence::{Journal, PersistenceMetrics, StateStore};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("tsod ", env!("CARGO_PKG_VERSION")),
    about = "Tenant service orchestrator daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the scheduler and metrics endpoint until interrupted")]
    Run,
    #[command(about = "Stop and save every running service of every tenant")]
    StopAll,
    #[command(about = "Renew expiring proxy certificates")]
    RenewCerts {
        /// Only this tenant; all tenants otherwise.
        #[arg(long, value_name = "ID")]
        org: Option<String>,
    },
    #[command(about = "Bring services of a tenant up")]
    Activate {
        #[arg(long, value_name = "ID")]
        org: String,
        /// Service to start, optionally restored from a snapshot (ID=SNAPSHOT).
        #[arg(long = "service", value_name = "ID[=SNAPSHOT]", value_parser = parse_selection)]
        services: Vec<ServiceSelection>,
        /// Start every bound service from its production snapshot.
        #[arg(long, value_enum)]
        mode: Option<CliMode>,
    },
    #[command(about = "Bring services of a tenant down")]
    Deactivate {
        #[arg(long, value_name = "ID")]
        org: String,
        #[arg(long = "service", value_name = "ID", required = true, num_args = 1..)]
        services: Vec<String>,
        /// Discard the running data instead of saving a snapshot.
        #[arg(long)]
        no_save: bool,
        #[arg(long, value_name = "TEXT")]
        comment: Option<String>,
        /// Scale freed node pools down.
        #[arg(long)]
        release_capacity: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Survival,
    Exercise,
    Preheat,
}

impl From<CliMode> for ActivationMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Survival => ActivationMode::Survival,
            CliMode::Exercise => ActivationMode::Exercise,
            CliMode::Preheat => ActivationMode::Preheat,
        }
    }
}

fn parse_selection(raw: &str) -> std::result::Result<ServiceSelection, String> {
    match raw.split_once('=') {
        Some((service, snapshot)) if !service.is_empty() && !snapshot.is_empty() => {
            Ok(ServiceSelection::from_snapshot(service, snapshot))
        }
        Some(_) => Err(format!("expected ID=SNAPSHOT, got '{raw}'")),
        None if raw.is_empty() => Err("service id must not be empty".to_owned()),
        None => Ok(ServiceSelection::new(raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/tso.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = Arc::new(loaded.config);
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());

    init_tracing("tsod", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        data_path = %config.platform.data_path.display(),
        use_infra = config.platform.use_infra,
        "configuration loaded"
    );

    let orchestrator = Arc::new(build_orchestrator(config.clone(), &metrics_registry)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            daemon_metrics.inc_start();
            run(orchestrator, metrics_registry).await
        }
        Commands::StopAll => {
            let summary = orchestrator.reconcile_all_tenants().await;
            print_json(&summary)?;
            if summary.failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("{} service(s) failed to stop", summary.failed.len()))
            }
        }
        Commands::RenewCerts { org: Some(org) } => {
            let outcome = orchestrator
                .renew_certificates(&org)
                .await
                .with_context(|| format!("certificate renewal for {org}"))?;
            print_json(&outcome)
        }
        Commands::RenewCerts { org: None } => {
            let summary = orchestrator.renew_all_certificates().await;
            print_json(&summary)
        }
        Commands::Activate {
            org,
            services,
            mode,
        } => {
            if services.is_empty() && mode.is_none() {
                return Err(anyhow!("pass at least one --service or a --mode"));
            }
            let mut request = ActivationRequest::new(org, services);
            if let Some(mode) = mode {
                request = request.with_mode(mode.into());
            }
            let report = orchestrator.activate(request).await?;
            print_json(&report)
        }
        Commands::Deactivate {
            org,
            services,
            no_save,
            comment,
            release_capacity,
        } => {
            let selections = services
                .into_iter()
                .map(|service| {
                    let mut selection = StopSelection::new(service);
                    if no_save {
                        selection = selection.without_save();
                    }
                    if let Some(comment) = &comment {
                        selection = selection.with_comment(comment.clone());
                    }
                    selection
                })
                .collect();
            let mut request = DeactivationRequest::new(org, selections);
            if release_capacity {
                request = request.releasing_capacity();
            }
            let report = orchestrator.deactivate(request).await?;
            print_json(&report)
        }
    }
}

fn build_orchestrator(config: Arc<AppConfig>, registry: &SharedRegistry) -> Result<Orchestrator> {
    let persistence_metrics = PersistenceMetrics::new(registry.clone())?;
    let storage = &config.storage;
    let store = StateStore::open(&storage.state_file)
        .with_context(|| format!("opening state file {}", storage.state_file.display()))?
        .with_metrics(persistence_metrics.clone());
    let journal = Journal::open(&storage.journal_file, Some(persistence_metrics))
        .with_context(|| format!("opening journal {}", storage.journal_file.display()))?;
    let collaborators = Collaborators::production(&config);
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(store),
        Arc::new(journal),
        collaborators,
    )
    .with_metrics(OrchestratorMetrics::new(registry.clone())?);
    Ok(orchestrator)
}

async fn run(orchestrator: Arc<Orchestrator>, registry: SharedRegistry) -> Result<()> {
    let cleared = orchestrator.recover_interrupted()?;
    if cleared > 0 {
        warn!(cleared, "cleared transitions interrupted by the previous run");
    }

    let metrics = &orchestrator.config().metrics;
    let mut metrics_server: Option<MetricsServer> = None;
    if metrics.enabled {
        match spawn_http_server(registry, metrics.listen).await {
            Ok(server) => {
                info!(address = %server.addr(), "metrics endpoint listening");
                metrics_server = Some(server);
            }
            Err(err) => warn!(error = %err, "failed to start metrics endpoint"),
        }
    } else {
        info!("metrics endpoint disabled by configuration");
    }

    let scheduler = ReconciliationScheduler::spawn(orchestrator.clone());
    info!(jobs = scheduler.jobs(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    scheduler.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_accepts_optional_snapshot() {
        assert_eq!(parse_selection("mail").unwrap(), ServiceSelection::new("mail"));
        assert_eq!(
            parse_selection("mail=mail_mailserver_v2_1").unwrap(),
            ServiceSelection::from_snapshot("mail", "mail_mailserver_v2_1")
        );
        assert!(parse_selection("mail=").is_err());
        assert!(parse_selection("").is_err());
    }

    #[test]
    fn cli_parses_deactivate_flags() {
        let cli = Cli::try_parse_from([
            "tsod",
            "deactivate",
            "--org",
            "acme",
            "--service",
            "mail",
            "drive",
            "--no-save",
            "--release-capacity",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Deactivate {
                services,
                no_save,
                release_capacity,
                ..
            }) => {
                assert_eq!(services, vec!["mail", "drive"]);
                assert!(no_save && release_capacity);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
