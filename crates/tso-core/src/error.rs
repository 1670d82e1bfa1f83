//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tso_persistence::PersistenceError;
use tso_providers::ProviderError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure classes surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Requested state already holds, an operation is in flight, or an
    /// exclusivity rule would be broken.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    /// Capacity could not be provisioned after every attempt.
    #[error("infrastructure unavailable after {attempts} attempt(s): {reason}")]
    InfrastructureTimeout { attempts: usize, reason: String },
    /// A workload, job or helper pod did not converge in time.
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("data transfer failed: {0}")]
    Transfer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persistence(PersistenceError),
    #[error(transparent)]
    Provider(ProviderError),
}

impl OrchestratorError {
    /// Timeouts are worth retrying; everything else needs a changed request or operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InfrastructureTimeout { .. } | OrchestratorError::Timeout(_)
        ) || matches!(self, OrchestratorError::Provider(err) if err.is_timeout())
    }

    /// HTTP-like status for controllers layered above the orchestrator.
    pub fn status_hint(&self) -> u16 {
        match self {
            OrchestratorError::Conflict(_) => 409,
            OrchestratorError::Forbidden(_) => 403,
            OrchestratorError::NotFound { .. } => 404,
            OrchestratorError::InfrastructureTimeout { .. } | OrchestratorError::Timeout(_) => 504,
            OrchestratorError::Persistence(PersistenceError::RevisionConflict { .. }) => 409,
            OrchestratorError::Provider(err) if err.is_timeout() => 504,
            _ => 500,
        }
    }
}

impl From<PersistenceError> for OrchestratorError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound { kind, id } => OrchestratorError::NotFound { kind, id },
            PersistenceError::Forbidden(reason) => OrchestratorError::Forbidden(reason),
            PersistenceError::Conflict(reason) => OrchestratorError::Conflict(reason),
            other => OrchestratorError::Persistence(other),
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { .. } => OrchestratorError::Timeout(err.to_string()),
            other => OrchestratorError::Provider(other),
        }
    }
}
