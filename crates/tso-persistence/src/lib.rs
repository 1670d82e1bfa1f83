//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The persisted source of truth for the orchestrator: a single JSON state
//! document holding the service catalog, tenant bindings, snapshots and tags,
//! viewed through the [`ServiceRegistry`] and the [`SnapshotLedger`].
#![warn(missing_docs)]

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when the state document fails integrity verification.
    #[error("state document hash mismatch")]
    HashMismatch,
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// A record the caller referenced does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (binding, snapshot, tag, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// The operation is never allowed on this record.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The record is in a state that conflicts with the requested change.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Optimistic-concurrency check failed on a binding.
    #[error(
        "revision conflict on {organization_id}/{service_id}: expected {expected}, found {actual}"
    )]
    RevisionConflict {
        /// Tenant of the binding.
        organization_id: String,
        /// Service of the binding.
        service_id: String,
        /// Revision the caller observed.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },
}

impl PersistenceError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod store;
pub mod tags;

pub use journal::{Journal, JournalEntry, JournalReader, JournalWriter};
pub use ledger::{SnapshotLedger, TagAssignment};
pub use metrics::PersistenceMetrics;
pub use model::{
    BindingStatus, Organization, OrganizationVersion, Service, Snapshot, Tag, TagType, Version,
    FAILED_TAG_ID, PROD_TAG_ID, VALID_TAG_ID,
};
pub use registry::{ServiceRegistry, Transition, PROGRESS_IDLE};
pub use store::{StateDocument, StateStore, STATE_FORMAT_VERSION};
pub use tags::{decide, SlotOccupant, TagConflict, TagDecision, TagRequest};
