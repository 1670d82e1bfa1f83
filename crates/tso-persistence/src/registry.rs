//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Service catalog and tenant bindings.
//!
//! Bindings carry a `revision` counter. Transition entry is a compare-and-swap
//! on that counter together with the status/flag guard, so two callers that
//! observed the same binding cannot both start a transition on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::model::{BindingStatus, Organization, OrganizationVersion, Service, Version};
use crate::store::{StateDocument, StateStore};
use crate::{PersistenceError, Result};

/// Progress value of a binding at rest.
pub const PROGRESS_IDLE: u8 = 10;

/// The two transitions a binding can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// INACTIVE → ACTIVE, guarded by `is_creating`.
    Activate,
    /// ACTIVE → INACTIVE, guarded by `is_deleting`.
    Deactivate,
}

impl Transition {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Activate => "activate",
            Transition::Deactivate => "deactivate",
        }
    }
}

/// View over the catalog and binding records of a [`StateStore`].
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    store: Arc<StateStore>,
}

impl ServiceRegistry {
    /// Wrap a shared store.
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Insert or replace a catalog service.
    pub fn upsert_service(&self, service: Service) -> Result<()> {
        self.store.update(|doc| {
            doc.services.insert(service.service_id.clone(), service);
            Ok(())
        })
    }

    /// Insert or replace a version; the owning service must exist.
    pub fn upsert_version(&self, version: Version) -> Result<()> {
        self.store.update(|doc| {
            if !doc.services.contains_key(&version.service_id) {
                return Err(PersistenceError::not_found("service", &version.service_id));
            }
            doc.versions.insert(version.version_id.clone(), version);
            Ok(())
        })
    }

    /// Insert or replace a tenant record.
    pub fn upsert_organization(&self, organization: Organization) -> Result<()> {
        self.store.update(|doc| {
            doc.organizations
                .insert(organization.organization_id.clone(), organization);
            Ok(())
        })
    }

    /// Catalog service lookup.
    pub fn service(&self, service_id: &str) -> Result<Service> {
        self.store.read(|doc| {
            doc.services
                .get(service_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("service", service_id))
        })
    }

    /// Version lookup.
    pub fn version(&self, version_id: &str) -> Result<Version> {
        self.store.read(|doc| {
            doc.versions
                .get(version_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("version", version_id))
        })
    }

    /// Tenant lookup.
    pub fn organization(&self, organization_id: &str) -> Result<Organization> {
        self.store.read(|doc| {
            doc.organizations
                .get(organization_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("organization", organization_id))
        })
    }

    /// All tenants in insertion order.
    pub fn organizations(&self) -> Vec<Organization> {
        self.store
            .read(|doc| doc.organizations.values().cloned().collect())
    }

    /// Bind a tenant to a version, replacing any binding of the same service.
    ///
    /// Rebinding is refused while the current binding is ACTIVE or in transition.
    pub fn bind(
        &self,
        organization_id: &str,
        version_id: &str,
        depends_on: Vec<String>,
    ) -> Result<OrganizationVersion> {
        self.store.update(|doc| {
            if !doc.organizations.contains_key(organization_id) {
                return Err(PersistenceError::not_found("organization", organization_id));
            }
            let version = doc
                .versions
                .get(version_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("version", version_id))?;

            if let Some(existing) = doc.binding_mut(organization_id, &version.service_id) {
                if existing.status == BindingStatus::Active || existing.in_transition() {
                    return Err(PersistenceError::Forbidden(format!(
                        "service {} of {} is {} or in transition; stop it before changing version",
                        existing.service_id, organization_id, existing.status
                    )));
                }
                existing.version_id = version.version_id.clone();
                existing.depends_on = depends_on;
                existing.revision += 1;
                return Ok(existing.clone());
            }

            let binding = OrganizationVersion::new(
                organization_id,
                version.service_id.clone(),
                version.version_id.clone(),
                depends_on,
            );
            doc.bindings.push(binding.clone());
            Ok(binding)
        })
    }

    /// Binding lookup.
    pub fn binding(&self, organization_id: &str, service_id: &str) -> Result<OrganizationVersion> {
        self.store.read(|doc| lookup(doc, organization_id, service_id).cloned())
    }

    /// All bindings of a tenant.
    pub fn bindings_for(&self, organization_id: &str) -> Vec<OrganizationVersion> {
        self.store.read(|doc| {
            doc.bindings
                .iter()
                .filter(|binding| binding.organization_id == organization_id)
                .cloned()
                .collect()
        })
    }

    /// ACTIVE bindings of a tenant.
    pub fn active_bindings(&self, organization_id: &str) -> Vec<OrganizationVersion> {
        self.bindings_for(organization_id)
            .into_iter()
            .filter(|binding| binding.status == BindingStatus::Active)
            .collect()
    }

    /// Enter a transition if the binding is still at `expected_revision`.
    ///
    /// Activation is refused when the binding is ACTIVE; both transitions are
    /// refused while either flag is set. On success the matching flag is set,
    /// progress is reset and the revision is bumped.
    pub fn begin_transition(
        &self,
        organization_id: &str,
        service_id: &str,
        expected_revision: u64,
        transition: Transition,
    ) -> Result<OrganizationVersion> {
        let result = self.store.update(|doc| {
            let binding = lookup_mut(doc, organization_id, service_id)?;
            if binding.revision != expected_revision {
                return Err(PersistenceError::RevisionConflict {
                    organization_id: organization_id.to_owned(),
                    service_id: service_id.to_owned(),
                    expected: expected_revision,
                    actual: binding.revision,
                });
            }
            if binding.in_transition() {
                return Err(PersistenceError::Conflict(format!(
                    "service {service_id} of {organization_id} is already being {}",
                    if binding.is_creating { "started" } else { "stopped" }
                )));
            }
            match transition {
                Transition::Activate => {
                    if binding.status == BindingStatus::Active {
                        return Err(PersistenceError::Conflict(format!(
                            "service {service_id} of {organization_id} is already ACTIVE"
                        )));
                    }
                    binding.is_creating = true;
                }
                Transition::Deactivate => binding.is_deleting = true,
            }
            binding.progress = PROGRESS_IDLE;
            binding.revision += 1;
            Ok(binding.clone())
        });

        match &result {
            Ok(binding) => debug!(
                organization_id,
                service_id,
                transition = transition.as_str(),
                revision = binding.revision,
                "transition entered"
            ),
            Err(PersistenceError::RevisionConflict { .. }) => {
                if let Some(metrics) = self.store.metrics() {
                    metrics.record_revision_conflict();
                }
                warn!(organization_id, service_id, "stale binding revision");
            }
            Err(_) => {}
        }
        result
    }

    /// Record progress of an in-flight transition.
    pub fn set_progress(&self, organization_id: &str, service_id: &str, progress: u8) -> Result<()> {
        self.mutate(organization_id, service_id, |binding| {
            binding.progress = progress.min(100);
        })
        .map(|_| ())
    }

    /// Close an activation: ACTIVE, flags cleared, run time stamped.
    pub fn complete_activation(
        &self,
        organization_id: &str,
        service_id: &str,
        at: DateTime<Utc>,
    ) -> Result<OrganizationVersion> {
        self.mutate(organization_id, service_id, |binding| {
            binding.status = BindingStatus::Active;
            binding.last_run_datetime = Some(at);
            settle(binding);
        })
    }

    /// Close a deactivation: INACTIVE, flags cleared.
    pub fn complete_deactivation(
        &self,
        organization_id: &str,
        service_id: &str,
    ) -> Result<OrganizationVersion> {
        self.mutate(organization_id, service_id, |binding| {
            binding.status = BindingStatus::Inactive;
            settle(binding);
        })
    }

    /// Clear transition flags without deciding the status.
    pub fn abort_transition(
        &self,
        organization_id: &str,
        service_id: &str,
    ) -> Result<OrganizationVersion> {
        self.mutate(organization_id, service_id, settle)
    }

    /// Clear every transition flag of the platform. Returns the number of bindings touched.
    pub fn reset_transition_flags(&self) -> Result<usize> {
        let reset = self.store.update(|doc| {
            let mut reset = 0usize;
            for binding in doc.bindings.iter_mut().filter(|b| b.in_transition()) {
                settle(binding);
                reset += 1;
            }
            Ok(reset)
        })?;
        if reset > 0 {
            info!(bindings = reset, "cleared transition flags left by a previous run");
        }
        Ok(reset)
    }

    fn mutate(
        &self,
        organization_id: &str,
        service_id: &str,
        change: impl FnOnce(&mut OrganizationVersion),
    ) -> Result<OrganizationVersion> {
        self.store.update(|doc| {
            let binding = lookup_mut(doc, organization_id, service_id)?;
            change(binding);
            binding.revision += 1;
            Ok(binding.clone())
        })
    }
}

fn settle(binding: &mut OrganizationVersion) {
    binding.is_creating = false;
    binding.is_deleting = false;
    binding.progress = PROGRESS_IDLE;
}

fn lookup<'a>(
    doc: &'a StateDocument,
    organization_id: &str,
    service_id: &str,
) -> Result<&'a OrganizationVersion> {
    doc.binding(organization_id, service_id)
        .ok_or_else(|| PersistenceError::not_found("binding", format!("{organization_id}/{service_id}")))
}

fn lookup_mut<'a>(
    doc: &'a mut StateDocument,
    organization_id: &str,
    service_id: &str,
) -> Result<&'a mut OrganizationVersion> {
    doc.binding_mut(organization_id, service_id)
        .ok_or_else(|| PersistenceError::not_found("binding", format!("{organization_id}/{service_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new(Arc::new(StateStore::in_memory()));
        registry
            .upsert_service(Service {
                service_id: "mail".into(),
                name: "Mail".into(),
            })
            .unwrap();
        registry
            .upsert_version(Version::new("mail", "mailserver", "v1", "pool-a"))
            .unwrap();
        registry
            .upsert_version(Version::new("mail", "mailserver", "v2", "pool-a"))
            .unwrap();
        registry
            .upsert_organization(Organization {
                organization_id: "acme".into(),
                name: "Acme".into(),
                service_urls: Default::default(),
                ssh_port: None,
            })
            .unwrap();
        registry
            .bind("acme", "mail_mailserver_v1", Vec::new())
            .unwrap();
        registry
    }

    #[test]
    fn stale_revision_is_rejected() {
        let registry = registry();
        let observed = registry.binding("acme", "mail").unwrap();
        registry
            .begin_transition("acme", "mail", observed.revision, Transition::Activate)
            .unwrap();
        let err = registry
            .begin_transition("acme", "mail", observed.revision, Transition::Activate)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::RevisionConflict { .. }));
    }

    #[test]
    fn active_binding_cannot_be_activated_again() {
        let registry = registry();
        let binding = registry.binding("acme", "mail").unwrap();
        registry
            .begin_transition("acme", "mail", binding.revision, Transition::Activate)
            .unwrap();
        let done = registry
            .complete_activation("acme", "mail", Utc::now())
            .unwrap();
        assert!(!done.is_creating);

        let err = registry
            .begin_transition("acme", "mail", done.revision, Transition::Activate)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[test]
    fn rebinding_is_refused_while_active() {
        let registry = registry();
        let binding = registry.binding("acme", "mail").unwrap();
        registry
            .begin_transition("acme", "mail", binding.revision, Transition::Activate)
            .unwrap();
        let err = registry
            .bind("acme", "mail_mailserver_v2", Vec::new())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Forbidden(_)));

        registry.abort_transition("acme", "mail").unwrap();
        let rebound = registry
            .bind("acme", "mail_mailserver_v2", Vec::new())
            .unwrap();
        assert_eq!(rebound.version_id, "mail_mailserver_v2");
        assert_eq!(registry.bindings_for("acme").len(), 1);
    }

    #[test]
    fn startup_reset_clears_flags_only() {
        let registry = registry();
        let binding = registry.binding("acme", "mail").unwrap();
        registry
            .begin_transition("acme", "mail", binding.revision, Transition::Deactivate)
            .unwrap();
        registry.set_progress("acme", "mail", 70).unwrap();

        assert_eq!(registry.reset_transition_flags().unwrap(), 1);
        let binding = registry.binding("acme", "mail").unwrap();
        assert!(!binding.in_transition());
        assert_eq!(binding.progress, PROGRESS_IDLE);
        assert_eq!(binding.status, BindingStatus::Inactive);
        assert_eq!(registry.reset_transition_flags().unwrap(), 0);
    }
}
