//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Container runtime: tenant workloads, helper pods and one-shot jobs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::kubectl::{has_condition, items, object_name, Kubectl};
use crate::shell::CommandOutput;
use crate::Result;

/// Aggregate state of the deployments belonging to one tenant service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Absent,
    Progressing,
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    Absent,
    Pending,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Absent,
    Running,
    Complete,
    Failed,
}

/// Deployment name prefix owned by a tenant service.
pub fn workload_prefix(organization_id: &str, service_id: &str) -> String {
    format!("{organization_id}-{service_id}")
}

#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Apply the descriptor set rendered in `config_dir`.
    async fn apply_workload(&self, organization_id: &str, service_id: &str, config_dir: &Path)
        -> Result<()>;

    /// Delete the descriptor set in `config_dir`. Missing objects are not an error.
    async fn delete_workload(&self, organization_id: &str, service_id: &str, config_dir: &Path)
        -> Result<()>;

    async fn workload_state(&self, organization_id: &str, service_id: &str) -> Result<WorkloadState>;

    /// Apply a single manifest (helper pod or job).
    async fn apply_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()>;

    async fn delete_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()>;

    async fn pod_state(&self, organization_id: &str, pod: &str) -> Result<PodState>;

    /// State of the job declared in `manifest`.
    async fn job_state(&self, organization_id: &str, manifest: &Path) -> Result<JobState>;

    /// Run `command` in the first container of `pod`.
    async fn exec(
        &self,
        organization_id: &str,
        pod: &str,
        command: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;

    async fn copy_to_pod(&self, organization_id: &str, local: &Path, pod: &str, remote: &str)
        -> Result<()>;

    async fn copy_from_pod(&self, organization_id: &str, pod: &str, remote: &str, local: &Path)
        -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct KubectlRuntime {
    kubectl: Kubectl,
}

impl KubectlRuntime {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl RuntimeProvider for KubectlRuntime {
    async fn apply_workload(
        &self,
        organization_id: &str,
        service_id: &str,
        config_dir: &Path,
    ) -> Result<()> {
        let spec = self
            .kubectl
            .command(organization_id, ["apply".to_owned(), "-k".to_owned(), path_arg(config_dir)]);
        self.kubectl.run_checked(&spec).await?;
        info!(organization = organization_id, service = service_id, "workload applied");
        Ok(())
    }

    async fn delete_workload(
        &self,
        organization_id: &str,
        service_id: &str,
        config_dir: &Path,
    ) -> Result<()> {
        let spec = self.kubectl.command(
            organization_id,
            [
                "delete".to_owned(),
                "-k".to_owned(),
                path_arg(config_dir),
                "--ignore-not-found".to_owned(),
            ],
        );
        self.kubectl.run_checked(&spec).await?;
        info!(organization = organization_id, service = service_id, "workload deleted");
        Ok(())
    }

    async fn workload_state(&self, organization_id: &str, service_id: &str) -> Result<WorkloadState> {
        let spec = self
            .kubectl
            .command(organization_id, ["get", "deployments", "-o", "json"]);
        let Some(list) = self.kubectl.get_json(&spec).await? else {
            return Ok(WorkloadState::Absent);
        };
        let prefix = workload_prefix(organization_id, service_id);
        let owned: Vec<&Value> = items(&list)
            .into_iter()
            .filter(|deployment| object_name(deployment).is_some_and(|name| name.starts_with(&prefix)))
            .collect();
        let state = if owned.is_empty() {
            WorkloadState::Absent
        } else if owned.iter().all(|deployment| has_condition(deployment, "Available")) {
            WorkloadState::Available
        } else {
            WorkloadState::Progressing
        };
        debug!(organization = organization_id, service = service_id, deployments = owned.len(), ?state, "workload state");
        Ok(state)
    }

    async fn apply_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()> {
        let spec = self
            .kubectl
            .command(organization_id, ["apply".to_owned(), "-f".to_owned(), path_arg(manifest)]);
        self.kubectl.run_checked(&spec).await?;
        Ok(())
    }

    async fn delete_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()> {
        let spec = self.kubectl.command(
            organization_id,
            [
                "delete".to_owned(),
                "-f".to_owned(),
                path_arg(manifest),
                "--ignore-not-found".to_owned(),
            ],
        );
        self.kubectl.run_checked(&spec).await?;
        Ok(())
    }

    async fn pod_state(&self, organization_id: &str, pod: &str) -> Result<PodState> {
        let spec = self
            .kubectl
            .command(organization_id, ["get", "pod", pod, "-o", "json"]);
        Ok(match self.kubectl.get_json(&spec).await? {
            None => PodState::Absent,
            Some(object) if has_condition(&object, "Ready") => PodState::Ready,
            Some(_) => PodState::Pending,
        })
    }

    async fn job_state(&self, organization_id: &str, manifest: &Path) -> Result<JobState> {
        let spec = self.kubectl.command(
            organization_id,
            [
                "get".to_owned(),
                "-f".to_owned(),
                path_arg(manifest),
                "-o".to_owned(),
                "json".to_owned(),
            ],
        );
        let Some(value) = self.kubectl.get_json(&spec).await? else {
            return Ok(JobState::Absent);
        };
        let jobs = items(&value);
        Ok(if jobs.is_empty() {
            JobState::Absent
        } else if jobs.iter().any(|job| has_condition(job, "Failed")) {
            JobState::Failed
        } else if jobs.iter().all(|job| has_condition(job, "Complete")) {
            JobState::Complete
        } else {
            JobState::Running
        })
    }

    async fn exec(
        &self,
        organization_id: &str,
        pod: &str,
        command: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let mut spec = self
            .kubectl
            .command(organization_id, ["exec", pod, "--"])
            .args(command.iter().cloned());
        if let Some(limit) = timeout {
            spec = spec.timeout(limit);
        }
        self.kubectl.run(&spec).await
    }

    async fn copy_to_pod(
        &self,
        organization_id: &str,
        local: &Path,
        pod: &str,
        remote: &str,
    ) -> Result<()> {
        let spec = self.kubectl.command(
            organization_id,
            ["cp".to_owned(), path_arg(local), format!("{pod}:{remote}")],
        );
        self.kubectl.run_checked(&spec).await?;
        Ok(())
    }

    async fn copy_from_pod(
        &self,
        organization_id: &str,
        pod: &str,
        remote: &str,
        local: &Path,
    ) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let spec = self.kubectl.command(
            organization_id,
            ["cp".to_owned(), format!("{pod}:{remote}"), path_arg(local)],
        );
        self.kubectl.run_checked(&spec).await?;
        Ok(())
    }
}
