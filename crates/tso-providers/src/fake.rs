//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-memory collaborators for tests. State changes are immediate, so polls
//! converge on the first probe unless a failure is scripted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::capacity::{pool_name, CapacityProvider};
use crate::certs::CertificateInspector;
use crate::data_mover::{DataMover, TransferReport, TransferTarget};
use crate::runtime::{JobState, PodState, RuntimeProvider, WorkloadState};
use crate::shell::CommandOutput;
use crate::{ProviderError, Result};

/// Every mutation the fake cluster observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    CapacityEnsured {
        organization_id: String,
        pools: Vec<String>,
    },
    CapacityReleased {
        organization_id: String,
        pools: Vec<String>,
    },
    WorkloadApplied {
        organization_id: String,
        service_id: String,
    },
    WorkloadDeleted {
        organization_id: String,
        service_id: String,
    },
    ManifestApplied {
        organization_id: String,
        manifest: PathBuf,
    },
    ManifestDeleted {
        organization_id: String,
        manifest: PathBuf,
    },
    Exec {
        organization_id: String,
        pod: String,
        command: Vec<String>,
    },
}

#[derive(Default)]
struct ClusterState {
    events: Vec<ClusterEvent>,
    ensure_attempts: usize,
    capacity_failures: usize,
    ready_pools: HashSet<String>,
    workloads: HashMap<(String, String), WorkloadState>,
    stalled: HashSet<String>,
    live_manifests: HashMap<String, HashSet<PathBuf>>,
    jobs: HashMap<PathBuf, JobState>,
    job_failures: usize,
    failing_programs: HashSet<String>,
}

/// Fake capacity and runtime provider.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` capacity requests time out.
    pub fn fail_capacity(&self, times: usize) {
        self.state.lock().capacity_failures = times;
    }

    /// Workloads of `service_id` never become available.
    pub fn stall_service(&self, service_id: &str) {
        self.state.lock().stalled.insert(service_id.to_owned());
    }

    /// The next `times` jobs end in `Failed`.
    pub fn fail_jobs(&self, times: usize) {
        self.state.lock().job_failures = times;
    }

    /// `exec` of `program` exits non-zero.
    pub fn fail_program(&self, program: &str) {
        self.state.lock().failing_programs.insert(program.to_owned());
    }

    /// Pretend a workload exists without going through `apply_workload`.
    pub fn seed_workload(&self, organization_id: &str, service_id: &str, state: WorkloadState) {
        self.state
            .lock()
            .workloads
            .insert((organization_id.to_owned(), service_id.to_owned()), state);
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.state.lock().events.clone()
    }

    pub fn ensure_attempts(&self) -> usize {
        self.state.lock().ensure_attempts
    }

    /// Successful capacity requests.
    pub fn capacity_ensured(&self) -> usize {
        self.count(|event| matches!(event, ClusterEvent::CapacityEnsured { .. }))
    }

    pub fn capacity_released(&self) -> usize {
        self.count(|event| matches!(event, ClusterEvent::CapacityReleased { .. }))
    }

    pub fn pool_ready(&self, organization_id: &str, pool: &str) -> bool {
        self.state
            .lock()
            .ready_pools
            .contains(&pool_name(organization_id, pool))
    }

    pub fn workload(&self, organization_id: &str, service_id: &str) -> WorkloadState {
        self.state
            .lock()
            .workloads
            .get(&(organization_id.to_owned(), service_id.to_owned()))
            .copied()
            .unwrap_or(WorkloadState::Absent)
    }

    /// Number of workload or capacity mutations.
    pub fn mutations(&self) -> usize {
        self.count(|event| {
            matches!(
                event,
                ClusterEvent::CapacityEnsured { .. }
                    | ClusterEvent::CapacityReleased { .. }
                    | ClusterEvent::WorkloadApplied { .. }
                    | ClusterEvent::WorkloadDeleted { .. }
            )
        })
    }

    fn count(&self, predicate: impl Fn(&ClusterEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|event| predicate(event)).count()
    }
}

#[async_trait]
impl CapacityProvider for FakeCluster {
    async fn ensure_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_attempts += 1;
        if state.capacity_failures > 0 {
            state.capacity_failures -= 1;
            return Err(ProviderError::Timeout {
                operation: format!("node ready in {organization_id}"),
                timeout: Duration::ZERO,
                last_error: None,
            });
        }
        for pool in pools {
            state.ready_pools.insert(pool_name(organization_id, pool));
        }
        state.events.push(ClusterEvent::CapacityEnsured {
            organization_id: organization_id.to_owned(),
            pools: pools.to_vec(),
        });
        Ok(())
    }

    async fn release_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for pool in pools {
            state.ready_pools.remove(&pool_name(organization_id, pool));
        }
        state.events.push(ClusterEvent::CapacityReleased {
            organization_id: organization_id.to_owned(),
            pools: pools.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl RuntimeProvider for FakeCluster {
    async fn apply_workload(&self, organization_id: &str, service_id: &str, _config_dir: &Path)
        -> Result<()> {
        let mut state = self.state.lock();
        let workload = if state.stalled.contains(service_id) {
            WorkloadState::Progressing
        } else {
            WorkloadState::Available
        };
        state
            .workloads
            .insert((organization_id.to_owned(), service_id.to_owned()), workload);
        state.events.push(ClusterEvent::WorkloadApplied {
            organization_id: organization_id.to_owned(),
            service_id: service_id.to_owned(),
        });
        Ok(())
    }

    async fn delete_workload(&self, organization_id: &str, service_id: &str, _config_dir: &Path)
        -> Result<()> {
        let mut state = self.state.lock();
        state
            .workloads
            .remove(&(organization_id.to_owned(), service_id.to_owned()));
        state.events.push(ClusterEvent::WorkloadDeleted {
            organization_id: organization_id.to_owned(),
            service_id: service_id.to_owned(),
        });
        Ok(())
    }

    async fn workload_state(&self, organization_id: &str, service_id: &str) -> Result<WorkloadState> {
        Ok(self.workload(organization_id, service_id))
    }

    async fn apply_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state
            .live_manifests
            .entry(organization_id.to_owned())
            .or_default()
            .insert(manifest.to_path_buf());
        let job = if state.job_failures > 0 {
            state.job_failures -= 1;
            JobState::Failed
        } else {
            JobState::Complete
        };
        state.jobs.insert(manifest.to_path_buf(), job);
        state.events.push(ClusterEvent::ManifestApplied {
            organization_id: organization_id.to_owned(),
            manifest: manifest.to_path_buf(),
        });
        Ok(())
    }

    async fn delete_manifest(&self, organization_id: &str, manifest: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(live) = state.live_manifests.get_mut(organization_id) {
            live.remove(manifest);
        }
        state.jobs.remove(manifest);
        state.events.push(ClusterEvent::ManifestDeleted {
            organization_id: organization_id.to_owned(),
            manifest: manifest.to_path_buf(),
        });
        Ok(())
    }

    async fn pod_state(&self, organization_id: &str, _pod: &str) -> Result<PodState> {
        let state = self.state.lock();
        let live = state
            .live_manifests
            .get(organization_id)
            .is_some_and(|live| !live.is_empty());
        Ok(if live { PodState::Ready } else { PodState::Absent })
    }

    async fn job_state(&self, _organization_id: &str, manifest: &Path) -> Result<JobState> {
        Ok(self
            .state
            .lock()
            .jobs
            .get(manifest)
            .copied()
            .unwrap_or(JobState::Absent))
    }

    async fn exec(
        &self,
        organization_id: &str,
        pod: &str,
        command: &[String],
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.events.push(ClusterEvent::Exec {
            organization_id: organization_id.to_owned(),
            pod: pod.to_owned(),
            command: command.to_vec(),
        });
        let failing = command
            .first()
            .is_some_and(|program| state.failing_programs.contains(program));
        Ok(CommandOutput {
            success: !failing,
            output: if failing { "simulated failure".into() } else { String::new() },
        })
    }

    async fn copy_to_pod(&self, _organization_id: &str, _local: &Path, _pod: &str, _remote: &str)
        -> Result<()> {
        Ok(())
    }

    async fn copy_from_pod(&self, _organization_id: &str, _pod: &str, remote: &str, local: &Path)
        -> Result<()> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, format!("copied from {remote}\n"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCall {
    Restore {
        target: TransferTarget,
        base_timestamp: i64,
    },
    Save {
        target: TransferTarget,
        timestamp: i64,
        base_timestamp: Option<i64>,
    },
}

#[derive(Default)]
struct MoverState {
    calls: Vec<TransferCall>,
    fail_saves: bool,
    fail_restores: bool,
}

/// Records transfers; saves and restores can be scripted to fail.
#[derive(Default)]
pub struct FakeDataMover {
    state: Mutex<MoverState>,
}

impl FakeDataMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.state.lock().fail_saves = fail;
    }

    pub fn fail_restores(&self, fail: bool) {
        self.state.lock().fail_restores = fail;
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.state.lock().calls.clone()
    }

    fn outcome(failed: bool) -> Result<TransferReport> {
        if failed {
            Err(ProviderError::Command {
                command: "rsync".into(),
                output: "simulated transfer failure".into(),
            })
        } else {
            Ok(TransferReport {
                dry_run: true,
                log_path: None,
                output: String::new(),
            })
        }
    }
}

#[async_trait]
impl DataMover for FakeDataMover {
    async fn restore(&self, target: &TransferTarget, base_timestamp: i64) -> Result<TransferReport> {
        let mut state = self.state.lock();
        state.calls.push(TransferCall::Restore {
            target: target.clone(),
            base_timestamp,
        });
        Self::outcome(state.fail_restores)
    }

    async fn save(
        &self,
        target: &TransferTarget,
        timestamp: i64,
        base_timestamp: Option<i64>,
    ) -> Result<TransferReport> {
        let mut state = self.state.lock();
        state.calls.push(TransferCall::Save {
            target: target.clone(),
            timestamp,
            base_timestamp,
        });
        Self::outcome(state.fail_saves)
    }
}

/// Certificate expiries keyed by PEM path.
#[derive(Default)]
pub struct FakeCertificates {
    expiries: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl FakeCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_expiry(&self, pem: impl Into<PathBuf>, expires_at: DateTime<Utc>) {
        self.expiries.lock().insert(pem.into(), expires_at);
    }
}

#[async_trait]
impl CertificateInspector for FakeCertificates {
    async fn expires_at(&self, pem: &Path) -> Result<DateTime<Utc>> {
        self.expiries.lock().get(pem).copied().ok_or_else(|| {
            ProviderError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("certificate {} not found", pem.display()),
            ))
        })
    }
}
