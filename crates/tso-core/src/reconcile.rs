//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Platform-wide housekeeping: stop-all, filesystem import, flag recovery.

use serde::Serialize;
use tracing::{error, info};
use tso_persistence::Snapshot;

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::request::{DeactivationRequest, StopSelection, TriggerSource};

/// Result of a stop-all pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// `(organization, service)` pairs stopped.
    pub stopped: Vec<(String, String)>,
    /// `(organization, error)` for tenants whose stop failed.
    pub failed: Vec<(String, String)>,
}

impl Orchestrator {
    /// Stop every ACTIVE service of every tenant, saving its data.
    ///
    /// Tenants fail independently; the pass always visits all of them.
    pub async fn reconcile_all_tenants(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let comment = self.config.scheduler.stop_all_comment.clone();
        for organization in self.registry.organizations() {
            let org_id = organization.organization_id;
            let services: Vec<StopSelection> = self
                .registry
                .active_bindings(&org_id)
                .into_iter()
                .filter(|binding| !binding.in_transition())
                .map(|binding| StopSelection::new(binding.service_id).with_comment(&comment))
                .collect();
            if services.is_empty() {
                continue;
            }
            let request = DeactivationRequest::new(&org_id, services)
                .with_source(TriggerSource::Scheduler)
                .releasing_capacity();
            match self.deactivate(request).await {
                Ok(report) => {
                    for service_id in report.stopped() {
                        summary.stopped.push((org_id.clone(), service_id));
                    }
                }
                Err(err) => {
                    error!(organization = %org_id, error = %err, "stop-all failed for tenant");
                    summary.failed.push((org_id, err.to_string()));
                }
            }
        }
        info!(
            stopped = summary.stopped.len(),
            failed = summary.failed.len(),
            "stop-all pass finished"
        );
        summary
    }

    /// Record snapshot directories found on disk for every bound version of a tenant.
    pub fn import_snapshots_from_fs(&self, organization_id: &str) -> Result<Vec<Snapshot>> {
        self.registry.organization(organization_id)?;
        let mut imported = Vec::new();
        for binding in self.registry.bindings_for(organization_id) {
            imported.extend(
                self.ledger
                    .import_from_fs(organization_id, &binding.version_id)?,
            );
        }
        if !imported.is_empty() {
            self.journal.record(
                "snapshots_imported",
                serde_json::json!({
                    "organization_id": organization_id,
                    "snapshot_ids": imported.iter().map(|s| s.snapshot_id.as_str()).collect::<Vec<_>>(),
                }),
            );
        }
        Ok(imported)
    }

    /// Clear transition flags left behind by a previous process.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let reset = self.registry.reset_transition_flags()?;
        if reset > 0 {
            info!(bindings = reset, "cleared interrupted transitions");
            self.journal
                .record("transitions_recovered", serde_json::json!({ "bindings": reset }));
        }
        for organization in self.registry.organizations() {
            self.refresh_active_gauge(&organization.organization_id);
        }
        Ok(reset)
    }
}
