//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Bounded polling shared by every convergence wait (nodes, workloads,
//! jobs, helper-pod teardown).

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::{ProviderError, Result};

/// Fixed interval, bounded by a total timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// `timeout / interval`, never less than one probe.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_nanos() / self.interval.as_nanos();
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

/// Probe until it reports `true`, sleeping `interval` between probes.
///
/// Probe errors count as "not yet" and are surfaced in the timeout error.
/// Returns the 1-indexed attempt that succeeded.
pub async fn poll_until<F, Fut>(operation: &str, spec: PollSpec, mut probe: F) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let max_attempts = spec.max_attempts();
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match probe().await {
            Ok(true) => {
                debug!(operation, attempt, "condition reached");
                return Ok(attempt);
            }
            Ok(false) => {}
            Err(err) => {
                debug!(operation, attempt, error = %err, "probe failed");
                last_error = Some(err.to_string());
            }
        }
        if attempt < max_attempts {
            sleep(spec.interval).await;
        }
    }
    Err(ProviderError::Timeout {
        operation: operation.to_owned(),
        timeout: spec.timeout,
        last_error,
    })
}
