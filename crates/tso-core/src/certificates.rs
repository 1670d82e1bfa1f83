//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! TLS certificate renewal through the frontal proxy.
//!
//! Certificates live inside the proxy's saved data, so a renewal is a full
//! cycle: start the proxy from its latest snapshot, run the issuance jobs,
//! stop it again and keep the result as a new snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use tso_common::layout::ACTIVE_DIR;
use tso_persistence::BindingStatus;
use tso_providers::{poll_until, JobState, PollSpec, ProviderError};
use url::Url;

use crate::error::{OrchestratorError, Result};
use crate::notify::Notification;
use crate::orchestrator::Orchestrator;
use crate::request::{
    ActivationRequest, DeactivationRequest, ServiceOutcome, ServiceSelection, StopSelection,
    TriggerSource,
};

const RENEWAL_COMMENT: &str = "Certificate renewal";

/// Expiry of one hostname's certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    pub host: String,
    pub pem: PathBuf,
    pub expires_at: DateTime<Utc>,
    pub days_left: i64,
}

/// Result of inspecting a tenant's certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateCheck {
    pub organization_id: String,
    /// Snapshot directory the certificates were read from.
    pub snapshot_dir: Option<PathBuf>,
    pub certificates: Vec<CertificateStatus>,
    pub renewal_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RenewalOutcome {
    NotNeeded,
    Renewed { snapshot_id: Option<String> },
    /// The proxy did not start or issuance failed; no snapshot was kept.
    Failed { reason: String },
}

/// Aggregate of a platform-wide renewal run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub renewed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl Orchestrator {
    /// Read certificate expiry from the proxy's newest snapshot.
    ///
    /// Refused while any service of the tenant is ACTIVE or in transition.
    pub async fn check_certificates(&self, organization_id: &str) -> Result<CertificateCheck> {
        let organization = self.registry.organization(organization_id)?;
        let bindings = self.registry.bindings_for(organization_id);
        if let Some(busy) = bindings
            .iter()
            .find(|binding| binding.status == BindingStatus::Active || binding.in_transition())
        {
            return Err(OrchestratorError::Conflict(format!(
                "service {} of {organization_id} is running; certificates are checked on stopped tenants only",
                busy.service_id
            )));
        }

        let frontal = &self.config.platform.frontal_service;
        let binding = self.registry.binding(organization_id, frontal)?;
        let version = self.registry.version(&binding.version_id)?;
        let version_dir = self.layout.version_dir(
            organization_id,
            &version.service_id,
            &version.product,
            &version.name,
        );
        let Some(snapshot_dir) = newest_snapshot_dir(&version_dir)? else {
            warn!(organization = organization_id, dir = %version_dir.display(), "no saved proxy data; nothing to check");
            return Ok(CertificateCheck {
                organization_id: organization_id.to_owned(),
                snapshot_dir: None,
                certificates: Vec::new(),
                renewal_needed: false,
            });
        };

        let mut hosts: Vec<String> = Vec::new();
        for (service_id, raw) in &organization.service_urls {
            match Url::parse(raw) {
                Ok(url) => match url.host_str() {
                    Some(host) if !hosts.iter().any(|known| known == host) => {
                        hosts.push(host.to_owned())
                    }
                    Some(_) => {}
                    None => warn!(organization = organization_id, service = %service_id, url = %raw, "service URL has no host"),
                },
                Err(err) => {
                    warn!(organization = organization_id, service = %service_id, url = %raw, error = %err, "unparseable service URL")
                }
            }
        }

        let now = Utc::now();
        let threshold = i64::from(self.config.scheduler.cert_renewal_threshold_days);
        let mut certificates = Vec::new();
        for host in hosts {
            let pem = snapshot_dir
                .join("data")
                .join("letsencrypt")
                .join("live")
                .join(&host)
                .join("fullchain.pem");
            let expires_at = self.certificates.expires_at(&pem).await?;
            let days_left = (expires_at - now).num_days();
            info!(organization = organization_id, host = %host, days_left, "certificate inspected");
            certificates.push(CertificateStatus {
                host,
                pem,
                expires_at,
                days_left,
            });
        }
        let renewal_needed = certificates.iter().any(|cert| cert.days_left < threshold);
        Ok(CertificateCheck {
            organization_id: organization_id.to_owned(),
            snapshot_dir: Some(snapshot_dir),
            certificates,
            renewal_needed,
        })
    }

    /// Renew the tenant's certificates when any is close to expiry.
    pub async fn renew_certificates(&self, organization_id: &str) -> Result<RenewalOutcome> {
        let check = self.check_certificates(organization_id).await?;
        if !check.renewal_needed {
            return Ok(RenewalOutcome::NotNeeded);
        }
        let frontal = self.config.platform.frontal_service.clone();
        info!(organization = organization_id, "certificate renewal started");

        let report = self
            .activate(
                ActivationRequest::new(organization_id, vec![ServiceSelection::new(&frontal)])
                    .with_source(TriggerSource::Connector),
            )
            .await?;
        match report.service(&frontal).map(|view| &view.outcome) {
            Some(ServiceOutcome::Launched { .. }) => {}
            Some(ServiceOutcome::NotLaunched { reason }) => {
                error!(organization = organization_id, reason = %reason, "frontal proxy did not start");
                return Ok(RenewalOutcome::Failed {
                    reason: reason.clone(),
                });
            }
            other => {
                return Err(OrchestratorError::Conflict(format!(
                    "frontal proxy of {organization_id} is not startable: {other:?}"
                )))
            }
        }

        let binding = self.registry.binding(organization_id, &frontal)?;
        let version = self.registry.version(&binding.version_id)?;
        let jobs_dir = self
            .active_dir(organization_id, &version)
            .join("config")
            .join("letsencrypt");
        let jobs = self.run_jobs(organization_id, &jobs_dir).await;

        let mut stop = StopSelection::new(&frontal).with_comment(RENEWAL_COMMENT);
        if jobs.is_err() {
            stop = stop.without_save();
        }
        let stopped = self
            .deactivate(
                DeactivationRequest::new(organization_id, vec![stop])
                    .with_source(TriggerSource::Connector),
            )
            .await?;

        match jobs {
            Ok(count) => {
                let snapshot_id = match stopped.service(&frontal).map(|view| &view.outcome) {
                    Some(ServiceOutcome::Stopped { snapshot_id, .. }) => snapshot_id.clone(),
                    _ => None,
                };
                info!(organization = organization_id, jobs = count, snapshot = ?snapshot_id, "certificates renewed");
                self.journal.record(
                    "certificates_renewed",
                    json!({ "organization_id": organization_id, "snapshot_id": snapshot_id }),
                );
                Ok(RenewalOutcome::Renewed { snapshot_id })
            }
            Err(err) => {
                error!(organization = organization_id, error = %err, "certificate issuance failed");
                Ok(RenewalOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Renewal pass over every tenant; the summary goes to the notifier.
    pub async fn renew_all_certificates(&self) -> CertificateSummary {
        let mut summary = CertificateSummary::default();
        for organization in self.registry.organizations() {
            let org_id = organization.organization_id;
            match self.renew_certificates(&org_id).await {
                Ok(RenewalOutcome::Renewed { .. }) => summary.renewed.push(org_id),
                Ok(RenewalOutcome::NotNeeded) => summary.skipped.push(org_id),
                Ok(RenewalOutcome::Failed { .. }) => summary.failed.push(org_id),
                Err(OrchestratorError::Conflict(reason)) => {
                    info!(organization = %org_id, reason = %reason, "certificate renewal skipped");
                    summary.skipped.push(org_id);
                }
                Err(err) => {
                    error!(organization = %org_id, error = %err, "certificate renewal failed");
                    summary.failed.push(org_id);
                }
            }
        }
        self.notifier
            .notify(Notification::CertificateReport {
                renewed: summary.renewed.clone(),
                skipped: summary.skipped.clone(),
                failed: summary.failed.clone(),
            })
            .await;
        summary
    }

    async fn run_jobs(&self, organization_id: &str, dir: &Path) -> Result<usize> {
        let mut manifests = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let is_yaml = matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                );
                if path.is_file() && is_yaml {
                    manifests.push(path);
                }
            }
        }
        manifests.sort();
        if manifests.is_empty() {
            return Err(OrchestratorError::NotFound {
                kind: "certificate job",
                id: dir.display().to_string(),
            });
        }
        for manifest in &manifests {
            self.run_job(organization_id, manifest).await?;
        }
        Ok(manifests.len())
    }

    /// Apply a one-shot job until it completes, removing it after every attempt.
    async fn run_job(&self, organization_id: &str, manifest: &Path) -> Result<()> {
        let timeouts = &self.config.timeouts;
        let finish = PollSpec::new(timeouts.job_interval, timeouts.job_completion);
        let attempts = timeouts.job_attempts.max(1);
        let name = manifest.display().to_string();
        let mut last_state = JobState::Absent;
        for attempt in 1..=attempts {
            self.runtime.apply_manifest(organization_id, manifest).await?;
            let finished = poll_until(&format!("job {name} finished"), finish, || async {
                let state = self.runtime.job_state(organization_id, manifest).await?;
                Ok::<_, ProviderError>(matches!(state, JobState::Complete | JobState::Failed))
            })
            .await;
            last_state = match finished {
                Ok(_) => self.runtime.job_state(organization_id, manifest).await?,
                Err(err) => {
                    warn!(organization = organization_id, job = %name, attempt, error = %err, "job did not finish");
                    JobState::Running
                }
            };
            self.runtime.delete_manifest(organization_id, manifest).await?;
            poll_until(&format!("job {name} removed"), finish, || async {
                Ok::<_, ProviderError>(
                    self.runtime.job_state(organization_id, manifest).await? == JobState::Absent,
                )
            })
            .await?;
            if last_state == JobState::Complete {
                info!(organization = organization_id, job = %name, attempt, "job complete");
                return Ok(());
            }
            warn!(organization = organization_id, job = %name, attempt, attempts, state = ?last_state, "job attempt failed");
        }
        Err(OrchestratorError::Timeout(format!(
            "job {name} did not complete after {attempts} attempt(s), last state {last_state:?}"
        )))
    }
}

/// Newest timestamp-named directory below `version_dir`, ignoring `active`.
fn newest_snapshot_dir(version_dir: &Path) -> Result<Option<PathBuf>> {
    if !version_dir.is_dir() {
        return Ok(None);
    }
    let mut newest: Option<(i64, PathBuf)> = None;
    for entry in fs::read_dir(version_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == ACTIVE_DIR {
            continue;
        }
        let Ok(timestamp) = name.parse::<i64>() else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| timestamp > *best) {
            newest = Some((timestamp, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
