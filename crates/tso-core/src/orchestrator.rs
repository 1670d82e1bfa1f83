//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Activation and deactivation of tenant services.
//!
//! The orchestrator is the only writer of bindings. Every transition enters
//! through [`ServiceRegistry::begin_transition`] (revision compare-and-swap on
//! the binding), and every exit clears the transition flags, whether the
//! service ended up ACTIVE, INACTIVE or undetermined.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tso_common::{AppConfig, DataLayout};
use tso_metrics::OrchestratorMetrics;
use tso_persistence::{
    BindingStatus, Journal, Organization, OrganizationVersion, ServiceRegistry, Snapshot,
    SnapshotLedger, StateStore, TagAssignment, Transition, Version, FAILED_TAG_ID, PROD_TAG_ID,
    VALID_TAG_ID,
};
use tso_providers::{
    poll_until, render_descriptors, CapacityProvider, CertificateInspector, CommandRunner,
    DataMover, Kubectl, KubectlCapacity, KubectlRuntime, OpensslInspector, PollSpec,
    RsyncDataMover, RuntimeProvider, TemplateParams, TokioCommandRunner, TransferTarget,
    WorkloadState,
};

use crate::dependency::resolve_order;
use crate::error::{OrchestratorError, Result};
use crate::notify::{AlertAudience, LogNotifier, Notification, Notifier};
use crate::request::{
    ActivationRequest, DeactivationRequest, ServiceOutcome, ServiceSelection, ServiceView,
    StopSelection, TransitionReport, TriggerSource,
};

/// Progress checkpoint once the data restore is done.
pub const PROGRESS_RESTORED: u8 = 50;
/// Progress checkpoint once the workload is available.
pub const PROGRESS_READY: u8 = 99;
/// Progress checkpoint once the workload is gone.
pub const PROGRESS_DESTROYED: u8 = 40;
/// Progress checkpoint once the data is saved.
pub const PROGRESS_SAVED: u8 = 70;

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub capacity: Arc<dyn CapacityProvider>,
    pub runtime: Arc<dyn RuntimeProvider>,
    pub data_mover: Arc<dyn DataMover>,
    pub certificates: Arc<dyn CertificateInspector>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// `kubectl`, `rsync` and `openssl` adapters wired from configuration.
    pub fn production(config: &AppConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let layout = DataLayout::new(config.platform.data_path.clone());
        let kubectl = Kubectl::new(
            runner.clone(),
            config.platform.kubectl.clone(),
            config.platform.namespace.clone(),
            layout.clone(),
        );
        let timeouts = &config.timeouts;
        let capacity = Arc::new(KubectlCapacity::new(
            kubectl.clone(),
            PollSpec::new(timeouts.node_create_interval, timeouts.node_create),
            PollSpec::new(timeouts.node_delete_interval, timeouts.node_delete),
        ));
        let runtime: Arc<dyn RuntimeProvider> = Arc::new(KubectlRuntime::new(kubectl));
        let helper_poll = PollSpec::new(timeouts.service_interval, timeouts.service_create);
        let data_mover = Arc::new(RsyncDataMover::new(
            runtime.clone(),
            layout,
            config.transfer.clone(),
            helper_poll,
            helper_poll,
        ));
        Self {
            capacity,
            runtime,
            data_mover,
            certificates: Arc::new(OpensslInspector::new(runner)),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// A service about to be brought up.
#[derive(Debug, Clone)]
struct LaunchPlan {
    binding: OrganizationVersion,
    version: Version,
    basis: Option<Snapshot>,
}

/// Lifecycle orchestrator over one state store.
pub struct Orchestrator {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) layout: DataLayout,
    pub(crate) registry: ServiceRegistry,
    pub(crate) ledger: SnapshotLedger,
    pub(crate) journal: Arc<Journal>,
    pub(crate) capacity: Arc<dyn CapacityProvider>,
    pub(crate) runtime: Arc<dyn RuntimeProvider>,
    pub(crate) data_mover: Arc<dyn DataMover>,
    pub(crate) certificates: Arc<dyn CertificateInspector>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) metrics: Option<OrchestratorMetrics>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<StateStore>,
        journal: Arc<Journal>,
        collaborators: Collaborators,
    ) -> Self {
        let layout = DataLayout::new(config.platform.data_path.clone());
        Self {
            registry: ServiceRegistry::new(store.clone()),
            ledger: SnapshotLedger::new(store, layout.clone()),
            layout,
            config,
            journal,
            capacity: collaborators.capacity,
            runtime: collaborators.runtime,
            data_mover: collaborators.data_mover,
            certificates: collaborators.certificates,
            notifier: collaborators.notifier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OrchestratorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &SnapshotLedger {
        &self.ledger
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Bring up the requested services and their dependencies.
    ///
    /// Requesting a service that is already ACTIVE is a conflict and touches
    /// nothing. Dependencies already ACTIVE are left alone. Capacity
    /// exhaustion fails the whole request; any other per-service failure is
    /// rolled back for that service only and reported as not launched.
    pub async fn activate(&self, request: ActivationRequest) -> Result<TransitionReport> {
        let started = Instant::now();
        let org_id = request.organization_id.as_str();
        let organization = self.registry.organization(org_id)?;
        let selections = self.activation_selections(&request);
        let requested: Vec<String> = selections
            .iter()
            .map(|selection| selection.service_id.clone())
            .collect();
        let order = resolve_order(&requested, |service_id| {
            self.registry
                .binding(org_id, service_id)
                .ok()
                .map(|binding| binding.depends_on)
        })?;

        let mut plans = Vec::new();
        let mut views = Vec::new();
        for service_id in &order {
            let binding = self.registry.binding(org_id, service_id)?;
            if binding.in_transition() {
                return Err(OrchestratorError::Conflict(format!(
                    "service {service_id} of {org_id} has a transition in flight"
                )));
            }
            if binding.status == BindingStatus::Active {
                if requested.contains(service_id) {
                    return Err(OrchestratorError::Conflict(format!(
                        "service {service_id} of {org_id} is already ACTIVE"
                    )));
                }
                views.push(ServiceView::new(binding, ServiceOutcome::DependencySatisfied));
                continue;
            }
            let version = self.registry.version(&binding.version_id)?;
            let explicit = selections
                .iter()
                .find(|selection| &selection.service_id == service_id)
                .and_then(|selection| selection.snapshot_id.as_deref());
            let basis = self.resolve_basis(org_id, &version, explicit, request.mode.is_some())?;
            plans.push(LaunchPlan {
                binding,
                version,
                basis,
            });
        }

        let mut entered = Vec::new();
        for plan in &mut plans {
            match self.registry.begin_transition(
                org_id,
                &plan.version.service_id,
                plan.binding.revision,
                Transition::Activate,
            ) {
                Ok(binding) => {
                    plan.binding = binding;
                    entered.push(plan.version.service_id.clone());
                }
                Err(err) => {
                    self.abort_all(org_id, &entered);
                    return Err(err.into());
                }
            }
        }
        info!(organization = org_id, services = ?entered, mode = ?request.mode, source = ?request.source, "activation started");
        self.journal.record(
            "activation_started",
            json!({ "organization_id": org_id, "services": entered, "source": request.source }),
        );

        if self.config.platform.use_infra && !plans.is_empty() {
            let pools = distinct_pools(plans.iter().map(|plan| &plan.version));
            let phase_start = Instant::now();
            if let Err(err) = self.ensure_capacity_with_retry(org_id, &pools).await {
                error!(organization = org_id, pools = ?pools, error = %err, "capacity unavailable; rolling back activation");
                let releasable = self.unused_pools(org_id, pools);
                if !releasable.is_empty() {
                    if let Err(release_err) =
                        self.capacity.release_capacity(org_id, &releasable).await
                    {
                        warn!(organization = org_id, error = %release_err, "capacity release during rollback failed");
                    }
                }
                self.abort_all(org_id, &entered);
                if let Some(metrics) = &self.metrics {
                    metrics.record_rollback("capacity");
                    for _ in &entered {
                        metrics.record_transition("activate", "infrastructure_timeout");
                    }
                }
                self.journal.record(
                    "activation_failed",
                    json!({ "organization_id": org_id, "services": entered, "error": err.to_string() }),
                );
                return Err(err);
            }
            self.observe_phase("capacity", phase_start);
        }

        for (index, plan) in plans.iter().enumerate() {
            match self.launch(&organization, plan).await {
                Ok(view) => views.push(view),
                Err(err) => {
                    let remaining: Vec<String> = plans[index..]
                        .iter()
                        .map(|plan| plan.version.service_id.clone())
                        .collect();
                    self.abort_all(org_id, &remaining);
                    return Err(err);
                }
            }
        }

        let report = TransitionReport {
            organization_id: org_id.to_owned(),
            services: views,
        };
        if let Some(mode) = request.mode {
            if let Some(audience) = AlertAudience::for_mode(mode) {
                self.notifier
                    .notify(Notification::Alert {
                        organization_id: org_id.to_owned(),
                        mode,
                        audience,
                    })
                    .await;
            }
        }
        self.notifier
            .notify(Notification::ActivationReport {
                organization_id: org_id.to_owned(),
                launched: report.launched(),
                not_launched: report.not_launched(),
            })
            .await;
        self.refresh_active_gauge(org_id);
        self.observe_phase("activate", started);
        info!(
            organization = org_id,
            launched = ?report.launched(),
            not_launched = ?report.not_launched(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "activation finished"
        );
        Ok(report)
    }

    /// Stop the requested services, saving their data unless told otherwise.
    ///
    /// When the frontal proxy would be the last ACTIVE service it is stopped
    /// too. A failing service aborts the request; its flags and those of the
    /// services not yet processed are cleared and the error is returned.
    pub async fn deactivate(&self, request: DeactivationRequest) -> Result<TransitionReport> {
        let started = Instant::now();
        let org_id = request.organization_id.as_str();
        let organization = self.registry.organization(org_id)?;

        let mut targets: Vec<(StopSelection, OrganizationVersion)> = Vec::new();
        for selection in &request.services {
            if targets
                .iter()
                .any(|(seen, _)| seen.service_id == selection.service_id)
            {
                continue;
            }
            let binding = self.registry.binding(org_id, &selection.service_id)?;
            if binding.in_transition() {
                return Err(OrchestratorError::Conflict(format!(
                    "service {} of {org_id} has a transition in flight",
                    selection.service_id
                )));
            }
            targets.push((selection.clone(), binding));
        }

        let mut entered = Vec::new();
        for (selection, binding) in &mut targets {
            match self.registry.begin_transition(
                org_id,
                &selection.service_id,
                binding.revision,
                Transition::Deactivate,
            ) {
                Ok(updated) => {
                    *binding = updated;
                    entered.push(selection.service_id.clone());
                }
                Err(err) => {
                    self.abort_all(org_id, &entered);
                    return Err(err.into());
                }
            }
        }
        info!(organization = org_id, services = ?entered, source = ?request.source, "deactivation started");
        self.journal.record(
            "deactivation_started",
            json!({ "organization_id": org_id, "services": entered, "source": request.source }),
        );

        let mut views = Vec::new();
        let mut freed = Vec::new();
        for (index, (selection, binding)) in targets.iter().enumerate() {
            match self
                .stop_service(&organization, selection, binding, request.source)
                .await
            {
                Ok((view, version)) => {
                    if matches!(view.outcome, ServiceOutcome::Stopped { .. }) {
                        freed.push(version);
                    }
                    views.push(view);
                }
                Err(err) => {
                    error!(organization = org_id, service = %selection.service_id, error = %err, "deactivation failed");
                    let remaining: Vec<String> = targets[index..]
                        .iter()
                        .map(|(selection, _)| selection.service_id.clone())
                        .collect();
                    self.abort_all(org_id, &remaining);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transition("deactivate", "failed");
                    }
                    self.journal.record(
                        "deactivation_failed",
                        json!({ "organization_id": org_id, "service_id": selection.service_id, "error": err.to_string() }),
                    );
                    return Err(err);
                }
            }
        }

        let frontal = self.config.platform.frontal_service.clone();
        if !targets.iter().any(|(selection, _)| selection.service_id == frontal) {
            if let Some((view, version)) = self
                .cascade_frontal(&organization, &frontal, request.source)
                .await?
            {
                if matches!(view.outcome, ServiceOutcome::Stopped { .. }) {
                    freed.push(version);
                }
                views.push(view);
            }
        }

        let platform = &self.config.platform;
        if platform.use_infra && (request.release_capacity || platform.delete_nodes) {
            self.release_freed_capacity(org_id, &freed).await?;
        }

        self.refresh_active_gauge(org_id);
        self.observe_phase("deactivate", started);
        let report = TransitionReport {
            organization_id: org_id.to_owned(),
            services: views,
        };
        info!(
            organization = org_id,
            stopped = ?report.stopped(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "deactivation finished"
        );
        Ok(report)
    }

    /// Snapshots of the version a tenant's service is bound to, newest first.
    pub fn snapshots(&self, organization_id: &str, service_id: &str) -> Result<Vec<Snapshot>> {
        let binding = self.registry.binding(organization_id, service_id)?;
        Ok(self.ledger.list(organization_id, &binding.version_id))
    }

    pub fn assign_tag(
        &self,
        snapshot_id: &str,
        tag_id: &str,
        force: bool,
        privileged: bool,
    ) -> Result<TagAssignment> {
        let outcome = self
            .ledger
            .assign_tag(snapshot_id, tag_id, force, privileged)?;
        if let TagAssignment::Assigned {
            stripped_from,
            replaced,
        } = &outcome
        {
            self.journal.record(
                "tag_assigned",
                json!({
                    "snapshot_id": snapshot_id,
                    "tag_id": tag_id,
                    "stripped_from": stripped_from,
                    "replaced": replaced,
                }),
            );
        }
        Ok(outcome)
    }

    pub fn unassign_tag(&self, snapshot_id: &str, tag_id: &str) -> Result<bool> {
        let removed = self.ledger.unassign_tag(snapshot_id, tag_id)?;
        if removed {
            self.journal.record(
                "tag_unassigned",
                json!({ "snapshot_id": snapshot_id, "tag_id": tag_id }),
            );
        }
        Ok(removed)
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.ledger.delete(snapshot_id)?;
        self.journal
            .record("snapshot_deleted", json!({ "snapshot_id": snapshot_id }));
        Ok(())
    }

    /// Drop ledger records of untagged snapshots whose data is gone.
    pub fn prune_snapshots(&self, organization_id: &str, service_id: &str) -> Result<Vec<String>> {
        let binding = self.registry.binding(organization_id, service_id)?;
        let pruned = self.ledger.prune(organization_id, &binding.version_id)?;
        if !pruned.is_empty() {
            self.journal.record(
                "snapshots_pruned",
                json!({ "organization_id": organization_id, "snapshot_ids": pruned }),
            );
        }
        Ok(pruned)
    }

    fn activation_selections(&self, request: &ActivationRequest) -> Vec<ServiceSelection> {
        if request.mode.is_none() {
            return request.services.clone();
        }
        self.registry
            .bindings_for(&request.organization_id)
            .into_iter()
            .map(|binding| ServiceSelection::new(binding.service_id))
            .collect()
    }

    /// Snapshot an activation restores from.
    ///
    /// In a mode, the production snapshot is mandatory for everything but the
    /// frontal proxy. Otherwise an explicit snapshot wins over the latest one.
    fn resolve_basis(
        &self,
        organization_id: &str,
        version: &Version,
        explicit: Option<&str>,
        production_required: bool,
    ) -> Result<Option<Snapshot>> {
        if production_required {
            let production = self
                .ledger
                .tagged(organization_id, &version.version_id, PROD_TAG_ID);
            if production.is_some() {
                return Ok(production);
            }
            if version.service_id != self.config.platform.frontal_service {
                return Err(OrchestratorError::NotFound {
                    kind: "production snapshot",
                    id: format!("{organization_id}/{}", version.service_id),
                });
            }
        }
        if let Some(snapshot_id) = explicit {
            let snapshot = self.ledger.get(snapshot_id)?;
            if snapshot.organization_id != organization_id
                || snapshot.version_id != version.version_id
            {
                return Err(OrchestratorError::Conflict(format!(
                    "snapshot {snapshot_id} does not belong to {organization_id}/{}",
                    version.version_id
                )));
            }
            return Ok(Some(snapshot));
        }
        Ok(self.ledger.latest(organization_id, &version.version_id))
    }

    async fn ensure_capacity_with_retry(&self, organization_id: &str, pools: &[String]) -> Result<()> {
        let attempts = self.config.timeouts.node_create_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            info!(organization = organization_id, pools = ?pools, attempt, attempts, "requesting capacity");
            match self.capacity.ensure_capacity(organization_id, pools).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(organization = organization_id, attempt, error = %err, "capacity request failed");
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                sleep(self.config.timeouts.node_retry_cooldown).await;
            }
        }
        Err(OrchestratorError::InfrastructureTimeout {
            attempts,
            reason: last_error,
        })
    }

    async fn launch(&self, organization: &Organization, plan: &LaunchPlan) -> Result<ServiceView> {
        let org_id = organization.organization_id.as_str();
        let service_id = plan.version.service_id.as_str();

        let running = match self.runtime.workload_state(org_id, service_id).await {
            Ok(state) => state == WorkloadState::Available,
            Err(err) => {
                let binding = self.registry.abort_transition(org_id, service_id)?;
                self.record("activate", "failed");
                return Ok(ServiceView::new(
                    binding,
                    ServiceOutcome::NotLaunched {
                        reason: err.to_string(),
                    },
                ));
            }
        };
        if running {
            warn!(organization = org_id, service = service_id, "workload already running; marking ACTIVE");
            let binding = self
                .registry
                .complete_activation(org_id, service_id, Utc::now())?;
            self.record("activate", "already_running");
            return Ok(ServiceView::new(binding, ServiceOutcome::AlreadyRunning));
        }

        let phase_start = Instant::now();
        match self.bring_up(organization, plan).await {
            Ok(()) => {
                let basis_id = plan.basis.as_ref().map(|basis| basis.snapshot_id.clone());
                self.ledger
                    .mark_active(org_id, &plan.version.version_id, basis_id.as_deref())?;
                let binding = self
                    .registry
                    .complete_activation(org_id, service_id, Utc::now())?;
                self.record("activate", "launched");
                self.observe_phase("launch", phase_start);
                self.journal.record(
                    "service_activated",
                    json!({
                        "organization_id": org_id,
                        "service_id": service_id,
                        "version_id": plan.version.version_id,
                        "basis_snapshot": basis_id,
                    }),
                );
                info!(organization = org_id, service = service_id, basis = ?basis_id, "service launched");
                Ok(ServiceView::new(
                    binding,
                    ServiceOutcome::Launched {
                        basis_snapshot: basis_id,
                    },
                ))
            }
            Err((phase, err)) => {
                error!(organization = org_id, service = service_id, phase, error = %err, "launch failed; rolling back service");
                self.rollback_launch(org_id, &plan.version, phase).await;
                let binding = self.registry.abort_transition(org_id, service_id)?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_rollback(phase);
                }
                self.record("activate", "failed");
                self.journal.record(
                    "service_activation_failed",
                    json!({
                        "organization_id": org_id,
                        "service_id": service_id,
                        "phase": phase,
                        "error": err.to_string(),
                    }),
                );
                Ok(ServiceView::new(
                    binding,
                    ServiceOutcome::NotLaunched {
                        reason: err.to_string(),
                    },
                ))
            }
        }
    }

    /// Render, restore, apply, wait. Errors carry the phase they happened in.
    async fn bring_up(
        &self,
        organization: &Organization,
        plan: &LaunchPlan,
    ) -> std::result::Result<(), (&'static str, OrchestratorError)> {
        let org_id = organization.organization_id.as_str();
        let version = &plan.version;
        let active = self.active_dir(org_id, version);

        self.prepare_active_dir(org_id, version, plan.basis.as_ref())
            .map_err(|err| ("prepare", err))?;

        if let Some(basis) = &plan.basis {
            let target = self.transfer_target(organization, version);
            self.data_mover
                .restore(&target, basis.timestamp)
                .await
                .map_err(|err| ("restore", OrchestratorError::Transfer(err.to_string())))?;
        }
        self.registry
            .set_progress(org_id, &version.service_id, PROGRESS_RESTORED)
            .map_err(|err| ("restore", err.into()))?;

        self.runtime
            .apply_workload(org_id, &version.service_id, &active.join("config"))
            .await
            .map_err(|err| ("workload", err.into()))?;
        poll_until(
            &format!("workload {org_id}/{} available", version.service_id),
            self.service_poll(),
            || async {
                Ok::<_, tso_providers::ProviderError>(
                    self.runtime.workload_state(org_id, &version.service_id).await?
                        == WorkloadState::Available,
                )
            },
        )
        .await
        .map_err(|err| ("workload", err.into()))?;
        self.registry
            .set_progress(org_id, &version.service_id, PROGRESS_READY)
            .map_err(|err| ("workload", err.into()))?;
        Ok(())
    }

    fn prepare_active_dir(
        &self,
        organization_id: &str,
        version: &Version,
        basis: Option<&Snapshot>,
    ) -> Result<()> {
        let active = self.active_dir(organization_id, version);
        if active.exists() {
            warn!(path = %active.display(), "removing stale working directory");
            fs::remove_dir_all(&active)?;
        }
        for sub in ["config", "data", "log"] {
            fs::create_dir_all(active.join(sub))?;
        }
        match basis {
            Some(snapshot) => {
                let source = self.ledger.snapshot_dir(snapshot)?.join("config");
                render_descriptors(&source, &active.join("config"), None)?;
            }
            None => {
                let source = self
                    .config
                    .platform
                    .templates_dir
                    .join(&version.service_id)
                    .join(&version.product)
                    .join(&version.name);
                let params = TemplateParams {
                    organization_id: organization_id.to_owned(),
                    registry_url: self.config.platform.registry_url.clone(),
                    node_pool: version.node_pool.clone(),
                };
                render_descriptors(&source, &active.join("config"), Some(&params))?;
            }
        }
        Ok(())
    }

    async fn rollback_launch(&self, organization_id: &str, version: &Version, phase: &str) {
        let active = self.active_dir(organization_id, version);
        if phase == "workload" {
            if let Err(err) = self
                .runtime
                .delete_workload(organization_id, &version.service_id, &active.join("config"))
                .await
            {
                warn!(organization = organization_id, service = %version.service_id, error = %err, "could not delete partial workload");
            }
        }
        if active.exists() {
            if let Err(err) = fs::remove_dir_all(&active) {
                warn!(path = %active.display(), error = %err, "could not remove working directory");
            }
        }
    }

    /// Stop one service whose transition was entered by the caller.
    async fn stop_service(
        &self,
        organization: &Organization,
        selection: &StopSelection,
        binding: &OrganizationVersion,
        source: TriggerSource,
    ) -> Result<(ServiceView, Version)> {
        let org_id = organization.organization_id.as_str();
        let service_id = selection.service_id.as_str();
        let version = self.registry.version(&binding.version_id)?;
        let previous = self.ledger.active(org_id, &version.version_id);

        if self.runtime.workload_state(org_id, service_id).await? == WorkloadState::Absent {
            self.ledger.mark_active(org_id, &version.version_id, None)?;
            let binding = self.registry.complete_deactivation(org_id, service_id)?;
            self.record("deactivate", "already_stopped");
            info!(organization = org_id, service = service_id, "workload already absent; no snapshot taken");
            self.journal.record(
                "service_deactivated",
                json!({ "organization_id": org_id, "service_id": service_id, "snapshot_id": null }),
            );
            return Ok((
                ServiceView::new(binding, ServiceOutcome::AlreadyStopped),
                version,
            ));
        }

        let active = self.active_dir(org_id, &version);
        let teardown_start = Instant::now();
        self.runtime
            .delete_workload(org_id, service_id, &active.join("config"))
            .await?;
        let removed = poll_until(
            &format!("workload {org_id}/{service_id} removed"),
            self.service_poll(),
            || async {
                Ok::<_, tso_providers::ProviderError>(
                    self.runtime.workload_state(org_id, service_id).await?
                        == WorkloadState::Absent,
                )
            },
        )
        .await;
        if let Err(err) = removed {
            if let Some(metrics) = &self.metrics {
                metrics.record_rollback("teardown");
            }
            return Err(err.into());
        }
        self.observe_phase("teardown", teardown_start);
        self.registry
            .set_progress(org_id, service_id, PROGRESS_DESTROYED)?;

        let (snapshot_id, tag_id) = if selection.save_snapshot {
            let snapshot = self
                .save_snapshot(organization, &version, previous.as_ref(), selection, source)
                .await?;
            let tag = snapshot.tags.first().cloned();
            (Some(snapshot.snapshot_id), tag)
        } else {
            if active.exists() {
                fs::remove_dir_all(&active)?;
            }
            (None, None)
        };
        self.registry
            .set_progress(org_id, service_id, PROGRESS_SAVED)?;
        self.ledger.mark_active(org_id, &version.version_id, None)?;
        let binding = self.registry.complete_deactivation(org_id, service_id)?;
        self.record("deactivate", "stopped");
        self.journal.record(
            "service_deactivated",
            json!({
                "organization_id": org_id,
                "service_id": service_id,
                "snapshot_id": snapshot_id,
                "tag_id": tag_id,
            }),
        );
        info!(organization = org_id, service = service_id, snapshot = ?snapshot_id, tag = ?tag_id, "service stopped");
        Ok((
            ServiceView::new(
                binding,
                ServiceOutcome::Stopped {
                    snapshot_id,
                    tag_id,
                },
            ),
            version,
        ))
    }

    /// Turn `active` into a timestamped snapshot and push its data out.
    ///
    /// The record is written even when the transfer fails; it is then tagged
    /// failed instead of valid.
    async fn save_snapshot(
        &self,
        organization: &Organization,
        version: &Version,
        previous: Option<&Snapshot>,
        selection: &StopSelection,
        source: TriggerSource,
    ) -> Result<Snapshot> {
        let org_id = organization.organization_id.as_str();
        let newest = self.ledger.newest_timestamp(&version.version_id);
        let timestamp = next_timestamp(Utc::now().timestamp_millis(), newest);
        let active = self.active_dir(org_id, version);
        let target_dir = self.layout.snapshot_dir(
            org_id,
            &version.service_id,
            &version.product,
            &version.name,
            timestamp,
        );
        if active.exists() {
            fs::rename(&active, &target_dir)?;
        } else {
            warn!(path = %active.display(), "working directory missing; recording an empty snapshot");
            fs::create_dir_all(&target_dir)?;
        }

        let target = self.transfer_target(organization, version);
        let save_start = Instant::now();
        let saved = self
            .data_mover
            .save(&target, timestamp, previous.map(|snapshot| snapshot.timestamp))
            .await;
        self.observe_phase("save", save_start);
        let tag_id = match &saved {
            Err(err) => {
                error!(organization = org_id, service = %version.service_id, error = %err, "data save failed; snapshot tagged failed");
                FAILED_TAG_ID
            }
            Ok(_) if source == TriggerSource::Connector
                && previous.is_some_and(|snapshot| snapshot.has_tag(PROD_TAG_ID)) =>
            {
                PROD_TAG_ID
            }
            Ok(_) => VALID_TAG_ID,
        };
        let comment = selection.comment.clone().unwrap_or_default();
        Ok(self
            .ledger
            .create(org_id, &version.version_id, timestamp, &comment, Some(tag_id))?)
    }

    /// Stop the frontal proxy when nothing else is left running.
    async fn cascade_frontal(
        &self,
        organization: &Organization,
        frontal: &str,
        source: TriggerSource,
    ) -> Result<Option<(ServiceView, Version)>> {
        let org_id = organization.organization_id.as_str();
        let active = self.registry.active_bindings(org_id);
        let only_frontal = active.len() == 1 && active[0].service_id == frontal;
        if !only_frontal {
            return Ok(None);
        }
        info!(organization = org_id, service = frontal, "frontal proxy is the last ACTIVE service; stopping it");
        let binding = match self.registry.begin_transition(
            org_id,
            frontal,
            active[0].revision,
            Transition::Deactivate,
        ) {
            Ok(binding) => binding,
            Err(err) => {
                warn!(organization = org_id, service = frontal, error = %err, "frontal proxy changed concurrently; leaving it running");
                return Ok(None);
            }
        };
        let selection = StopSelection::new(frontal);
        match self
            .stop_service(organization, &selection, &binding, source)
            .await
        {
            Ok(stopped) => Ok(Some(stopped)),
            Err(err) => {
                self.abort_all(org_id, &[frontal.to_owned()]);
                Err(err)
            }
        }
    }

    /// Scale down pools freed by this deactivation that no ACTIVE service still uses.
    async fn release_freed_capacity(&self, organization_id: &str, freed: &[Version]) -> Result<()> {
        let pools = self.unused_pools(organization_id, distinct_pools(freed.iter()));
        if pools.is_empty() {
            return Ok(());
        }
        let phase_start = Instant::now();
        self.capacity
            .release_capacity(organization_id, &pools)
            .await?;
        self.observe_phase("release", phase_start);
        info!(organization = organization_id, pools = ?pools, "capacity released");
        Ok(())
    }

    /// The subset of `candidates` no ACTIVE binding of the tenant runs on.
    ///
    /// Empty when the pool of an ACTIVE binding cannot be resolved.
    fn unused_pools(&self, organization_id: &str, candidates: Vec<String>) -> Vec<String> {
        let mut in_use = BTreeSet::new();
        for binding in self.registry.active_bindings(organization_id) {
            match self.registry.version(&binding.version_id) {
                Ok(version) => {
                    in_use.insert(version.node_pool);
                }
                Err(err) => {
                    warn!(organization = organization_id, version = %binding.version_id, error = %err, "cannot resolve pool of active binding; keeping all pools");
                    return Vec::new();
                }
            }
        }
        candidates
            .into_iter()
            .filter(|pool| !in_use.contains(pool))
            .collect()
    }

    pub(crate) fn abort_all(&self, organization_id: &str, services: &[String]) {
        for service_id in services {
            if let Err(err) = self.registry.abort_transition(organization_id, service_id) {
                error!(organization = organization_id, service = %service_id, error = %err, "could not clear transition flags");
            }
        }
    }

    pub(crate) fn active_dir(&self, organization_id: &str, version: &Version) -> PathBuf {
        self.layout.active_dir(
            organization_id,
            &version.service_id,
            &version.product,
            &version.name,
        )
    }

    fn transfer_target(&self, organization: &Organization, version: &Version) -> TransferTarget {
        TransferTarget {
            organization_id: organization.organization_id.clone(),
            service_id: version.service_id.clone(),
            product: version.product.clone(),
            version: version.name.clone(),
            ssh_port: organization
                .ssh_port
                .unwrap_or(self.config.transfer.ssh_port),
        }
    }

    pub(crate) fn service_poll(&self) -> PollSpec {
        PollSpec::new(
            self.config.timeouts.service_interval,
            self.config.timeouts.service_create,
        )
    }

    pub(crate) fn refresh_active_gauge(&self, organization_id: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.set_active_services(
                organization_id,
                self.registry.active_bindings(organization_id).len(),
            );
        }
    }

    fn record(&self, operation: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(operation, outcome);
        }
    }

    pub(crate) fn observe_phase(&self, phase: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_phase(phase, started.elapsed().as_secs_f64());
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_path", &self.layout.root())
            .field("use_infra", &self.config.platform.use_infra)
            .finish_non_exhaustive()
    }
}

/// Snapshot directories are named by timestamp; never reuse or go back.
fn next_timestamp(now: i64, newest: Option<i64>) -> i64 {
    match newest {
        Some(newest) if newest >= now => newest + 1,
        _ => now,
    }
}

fn distinct_pools<'a>(versions: impl Iterator<Item = &'a Version>) -> Vec<String> {
    let mut pools = Vec::new();
    for version in versions {
        if !pools.contains(&version.node_pool) {
            pools.push(version.node_pool.clone());
        }
    }
    pools
}
