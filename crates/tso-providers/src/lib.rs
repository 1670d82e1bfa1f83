//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Seams between the orchestrator and the outside world.
//!
//! Each seam is a trait with one production adapter shelling out to an
//! external tool (`kubectl`, `rsync` inside a helper pod, `openssl`) and an
//! in-memory fake under [`fake`] for tests.

use std::time::Duration;

pub mod capacity;
pub mod certs;
pub mod data_mover;
pub mod fake;
pub mod kubectl;
pub mod poll;
pub mod runtime;
pub mod shell;
pub mod template;

pub use capacity::{CapacityProvider, KubectlCapacity};
pub use certs::{CertificateInspector, OpensslInspector};
pub use data_mover::{DataMover, RsyncDataMover, TransferReport, TransferTarget};
pub use kubectl::Kubectl;
pub use poll::{poll_until, PollSpec};
pub use runtime::{JobState, KubectlRuntime, PodState, RuntimeProvider, WorkloadState};
pub use shell::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use template::{render_descriptors, TemplateParams};

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{operation} did not converge within {timeout:?}{}", last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    Timeout {
        operation: String,
        timeout: Duration,
        last_error: Option<String>,
    },
    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },
    #[error("command `{command}` exceeded its {timeout:?} limit")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },
    #[error("template error in {path}: {reason}")]
    Template { path: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Timeouts of either kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. } | ProviderError::CommandTimeout { .. }
        )
    }
}
