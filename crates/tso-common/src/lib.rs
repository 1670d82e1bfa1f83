//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives for the orchestrator workspace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the tenant service orchestrator.
//! This crate exposes configuration loading, the on-disk data layout and
//! the tracing bootstrap consumed across the workspace.

pub mod config;
pub mod layout;
pub mod logging;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, PlatformConfig, SchedulerConfig,
    StorageConfig, TimeoutConfig, TransferConfig,
};
pub use layout::DataLayout;
pub use logging::{init_stderr_tracing, init_tracing, LogFormat};
