//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Tenant service lifecycle orchestration for the tso platform.

pub mod certificates;
pub mod dependency;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod reconcile;
pub mod request;
pub mod scheduler;

pub use certificates::{CertificateCheck, CertificateStatus, CertificateSummary, RenewalOutcome};
pub use error::{OrchestratorError, Result};
pub use notify::{AlertAudience, LogNotifier, Notification, Notifier, RecordingNotifier};
pub use orchestrator::{Collaborators, Orchestrator};
pub use reconcile::ReconcileSummary;
pub use request::{
    ActivationMode, ActivationRequest, DeactivationRequest, ServiceOutcome, ServiceSelection,
    ServiceView, StopSelection, TransitionReport, TriggerSource,
};
pub use scheduler::{ReconciliationScheduler, SchedulerHandle};
