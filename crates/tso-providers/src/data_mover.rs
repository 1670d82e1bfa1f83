//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Data transfer between the tenant's durable store and the node-local
//! working copy, executed by `rsync` inside a transient helper pod.
//!
//! Every transfer runs the same five steps: start the helper pod, deploy
//! the tenant key, run the sync, fetch its log, tear the pod down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use tso_common::{DataLayout, TransferConfig};

use crate::poll::{poll_until, PollSpec};
use crate::runtime::{PodState, RuntimeProvider};
use crate::shell::CommandSpec;
use crate::{ProviderError, Result};

/// The service instance whose data moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub organization_id: String,
    pub service_id: String,
    pub product: String,
    pub version: String,
    pub ssh_port: u16,
}

impl TransferTarget {
    pub fn helper_pod(&self) -> String {
        format!(
            "{}-{}-{}-synchro",
            self.organization_id, self.service_id, self.product
        )
    }

    fn snapshot_dir(&self, layout: &DataLayout, timestamp: i64) -> PathBuf {
        layout.snapshot_dir(
            &self.organization_id,
            &self.service_id,
            &self.product,
            &self.version,
            timestamp,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// `rsync -n`: nothing was written.
    pub dry_run: bool,
    /// Local copy of the transfer log, when it could be retrieved.
    pub log_path: Option<PathBuf>,
    pub output: String,
}

#[async_trait]
pub trait DataMover: Send + Sync {
    /// Durable snapshot `base_timestamp` into the node working copy.
    async fn restore(&self, target: &TransferTarget, base_timestamp: i64) -> Result<TransferReport>;

    /// Node working copy into the new snapshot `timestamp`, hard-linking
    /// unchanged files against `base_timestamp` when given.
    async fn save(
        &self,
        target: &TransferTarget,
        timestamp: i64,
        base_timestamp: Option<i64>,
    ) -> Result<TransferReport>;
}

/// Direction and endpoints of one sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    Restore {
        remote_source: PathBuf,
        local_dest: PathBuf,
    },
    Save {
        local_source: PathBuf,
        remote_dest: PathBuf,
        link_dest: Option<PathBuf>,
    },
}

fn with_slash(path: &Path) -> String {
    let mut text = path.display().to_string();
    if !text.ends_with('/') {
        text.push('/');
    }
    text
}

/// `rsync` argv for `plan`, run inside the helper pod.
pub fn rsync_command(plan: &SyncPlan, config: &TransferConfig, ssh_port: u16) -> Vec<String> {
    let mut argv = vec![
        "rsync".to_owned(),
        if config.use_rsync { "-avq" } else { "-avqn" }.to_owned(),
        "--delete".to_owned(),
        "--stats".to_owned(),
        format!("--log-file={}", config.remote_log_path),
        "-e".to_owned(),
        format!(
            "ssh -o StrictHostKeyChecking=no -i {} -p {ssh_port}",
            config.remote_key_path
        ),
    ];
    match plan {
        SyncPlan::Restore {
            remote_source,
            local_dest,
        } => {
            argv.push(format!("{}:{}", config.host_address, with_slash(remote_source)));
            argv.push(with_slash(local_dest));
        }
        SyncPlan::Save {
            local_source,
            remote_dest,
            link_dest,
        } => {
            argv.push("--hard-links".to_owned());
            if let Some(base) = link_dest {
                argv.push(format!("--link-dest={}", base.display()));
            }
            argv.push(with_slash(local_source));
            argv.push(format!("{}:{}", config.host_address, with_slash(remote_dest)));
        }
    }
    argv
}

pub struct RsyncDataMover {
    runtime: Arc<dyn RuntimeProvider>,
    layout: DataLayout,
    config: TransferConfig,
    pod_ready: PollSpec,
    pod_gone: PollSpec,
}

impl RsyncDataMover {
    pub fn new(
        runtime: Arc<dyn RuntimeProvider>,
        layout: DataLayout,
        config: TransferConfig,
        pod_ready: PollSpec,
        pod_gone: PollSpec,
    ) -> Self {
        Self {
            runtime,
            layout,
            config,
            pod_ready,
            pod_gone,
        }
    }

    async fn start_helper(&self, target: &TransferTarget, manifest: &Path) -> Result<()> {
        let org = target.organization_id.as_str();
        let pod = target.helper_pod();
        self.runtime.apply_manifest(org, manifest).await?;
        poll_until(&format!("helper pod {pod} ready"), self.pod_ready, || async {
            Ok::<_, ProviderError>(self.runtime.pod_state(org, &pod).await? == PodState::Ready)
        })
        .await?;
        info!(organization = org, pod = %pod, "helper pod ready");
        Ok(())
    }

    async fn stop_helper(&self, target: &TransferTarget, manifest: &Path) -> Result<()> {
        let org = target.organization_id.as_str();
        let pod = target.helper_pod();
        self.runtime.delete_manifest(org, manifest).await?;
        poll_until(&format!("helper pod {pod} removed"), self.pod_gone, || async {
            Ok::<_, ProviderError>(self.runtime.pod_state(org, &pod).await? == PodState::Absent)
        })
        .await?;
        Ok(())
    }

    async fn exec_checked(&self, target: &TransferTarget, argv: Vec<String>) -> Result<()> {
        let pod = target.helper_pod();
        let output = self
            .runtime
            .exec(&target.organization_id, &pod, &argv, None)
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(ProviderError::Command {
                command: argv.join(" "),
                output: output.output,
            })
        }
    }

    async fn sync(
        &self,
        target: &TransferTarget,
        plan: &SyncPlan,
        local_log: PathBuf,
    ) -> Result<TransferReport> {
        let org = target.organization_id.as_str();
        let pod = target.helper_pod();
        self.runtime
            .copy_to_pod(
                org,
                &self.layout.ssh_private_key(org),
                &pod,
                &self.config.remote_key_path,
            )
            .await?;

        if let SyncPlan::Restore { local_dest, .. } = plan {
            self.exec_checked(
                target,
                vec!["mkdir".into(), "-p".into(), local_dest.display().to_string()],
            )
            .await?;
        }
        self.exec_checked(
            target,
            vec!["rm".into(), "-f".into(), self.config.remote_log_path.clone()],
        )
        .await?;

        let argv = rsync_command(plan, &self.config, target.ssh_port);
        let command_line = CommandSpec::new("rsync").args(argv.iter().skip(1).cloned()).display();
        info!(organization = org, pod = %pod, command = %command_line, dry_run = !self.config.use_rsync, "starting transfer");
        let outcome = self
            .runtime
            .exec(org, &pod, &argv, Some(self.config.rsync_timeout))
            .await;

        let log_path = match self
            .runtime
            .copy_from_pod(org, &pod, &self.config.remote_log_path, &local_log)
            .await
        {
            Ok(()) => Some(local_log),
            Err(err) => {
                warn!(organization = org, pod = %pod, error = %err, "could not retrieve transfer log");
                None
            }
        };

        let output = outcome?;
        if !output.success {
            return Err(ProviderError::Command {
                command: command_line,
                output: output.output,
            });
        }
        Ok(TransferReport {
            dry_run: !self.config.use_rsync,
            log_path,
            output: output.output,
        })
    }

    /// Run `plan` inside a helper pod started from `manifest`, tearing
    /// the pod down whatever the outcome.
    async fn with_helper(
        &self,
        target: &TransferTarget,
        manifest: PathBuf,
        plan: SyncPlan,
        local_log: PathBuf,
    ) -> Result<TransferReport> {
        self.start_helper(target, &manifest).await?;
        let result = self.sync(target, &plan, local_log).await;
        let teardown = self.stop_helper(target, &manifest).await;
        match (result, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(err), teardown) => {
                if let Err(teardown_err) = teardown {
                    warn!(organization = %target.organization_id, error = %teardown_err, "helper pod teardown failed after transfer error");
                }
                Err(err)
            }
            (Ok(_), Err(err)) => Err(err),
        }
    }
}

#[async_trait]
impl DataMover for RsyncDataMover {
    async fn restore(&self, target: &TransferTarget, base_timestamp: i64) -> Result<TransferReport> {
        let base = target.snapshot_dir(&self.layout, base_timestamp);
        let active = self.layout.active_dir(
            &target.organization_id,
            &target.service_id,
            &target.product,
            &target.version,
        );
        let plan = SyncPlan::Restore {
            remote_source: base.join("data"),
            local_dest: self
                .layout
                .node_data_dir(&target.organization_id, &target.service_id),
        };
        self.with_helper(
            target,
            base.join("config").join("synchro.yaml"),
            plan,
            active.join("log").join("rsyncRestore.log"),
        )
        .await
    }

    async fn save(
        &self,
        target: &TransferTarget,
        timestamp: i64,
        base_timestamp: Option<i64>,
    ) -> Result<TransferReport> {
        let snapshot = target.snapshot_dir(&self.layout, timestamp);
        let plan = SyncPlan::Save {
            local_source: self
                .layout
                .node_data_dir(&target.organization_id, &target.service_id),
            remote_dest: snapshot.join("data"),
            link_dest: base_timestamp.map(|ts| target.snapshot_dir(&self.layout, ts).join("data")),
        };
        self.with_helper(
            target,
            snapshot.join("config").join("synchro.yaml"),
            plan,
            snapshot.join("log").join("rsyncSave.log"),
        )
        .await
    }
}
