//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Requests accepted and reports returned by the orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tso_persistence::{BindingStatus, OrganizationVersion};

/// Who asked for the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Operator,
    /// Automated connector (certificate renewal, imports). Propagates the
    /// production tag on save.
    Connector,
    Scheduler,
}

/// Operating mode of a full-tenant activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    Survival,
    Exercise,
    Preheat,
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActivationMode::Survival => "survival",
            ActivationMode::Exercise => "exercise",
            ActivationMode::Preheat => "preheat",
        })
    }
}

impl FromStr for ActivationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "survival" => Ok(ActivationMode::Survival),
            "exercise" => Ok(ActivationMode::Exercise),
            "preheat" => Ok(ActivationMode::Preheat),
            other => Err(format!(
                "unknown mode '{other}' (expected survival, exercise or preheat)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelection {
    pub service_id: String,
    /// Explicit restore basis; the latest snapshot is used otherwise.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl ServiceSelection {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            snapshot_id: None,
        }
    }

    pub fn from_snapshot(service_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            snapshot_id: Some(snapshot_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub organization_id: String,
    /// Ignored when `mode` is set: a mode activates every bound service.
    pub services: Vec<ServiceSelection>,
    #[serde(default)]
    pub mode: Option<ActivationMode>,
    #[serde(default)]
    pub source: TriggerSource,
}

impl ActivationRequest {
    pub fn new(organization_id: impl Into<String>, services: Vec<ServiceSelection>) -> Self {
        Self {
            organization_id: organization_id.into(),
            services,
            mode: None,
            source: TriggerSource::Operator,
        }
    }

    pub fn with_mode(mut self, mode: ActivationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_source(mut self, source: TriggerSource) -> Self {
        self.source = source;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSelection {
    pub service_id: String,
    #[serde(default = "default_save")]
    pub save_snapshot: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_save() -> bool {
    true
}

impl StopSelection {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            save_snapshot: true,
            comment: None,
        }
    }

    pub fn without_save(mut self) -> Self {
        self.save_snapshot = false;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationRequest {
    pub organization_id: String,
    pub services: Vec<StopSelection>,
    /// Scale the freed pools down even when `delete_nodes` is off.
    #[serde(default)]
    pub release_capacity: bool,
    #[serde(default)]
    pub source: TriggerSource,
}

impl DeactivationRequest {
    pub fn new(organization_id: impl Into<String>, services: Vec<StopSelection>) -> Self {
        Self {
            organization_id: organization_id.into(),
            services,
            release_capacity: false,
            source: TriggerSource::Operator,
        }
    }

    pub fn with_source(mut self, source: TriggerSource) -> Self {
        self.source = source;
        self
    }

    pub fn releasing_capacity(mut self) -> Self {
        self.release_capacity = true;
        self
    }
}

/// Per-service result of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Launched {
        basis_snapshot: Option<String>,
    },
    /// A workload was already running; the binding was aligned to ACTIVE.
    AlreadyRunning,
    /// Pulled in as a dependency and already ACTIVE; left untouched.
    DependencySatisfied,
    NotLaunched {
        reason: String,
    },
    Stopped {
        snapshot_id: Option<String>,
        tag_id: Option<String>,
    },
    AlreadyStopped,
}

/// Binding state after the transition, plus what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceView {
    pub organization_id: String,
    pub service_id: String,
    pub version_id: String,
    pub status: BindingStatus,
    pub is_creating: bool,
    pub is_deleting: bool,
    pub progress: u8,
    pub last_run_datetime: Option<DateTime<Utc>>,
    pub outcome: ServiceOutcome,
}

impl ServiceView {
    pub fn new(binding: OrganizationVersion, outcome: ServiceOutcome) -> Self {
        Self {
            organization_id: binding.organization_id,
            service_id: binding.service_id,
            version_id: binding.version_id,
            status: binding.status,
            is_creating: binding.is_creating,
            is_deleting: binding.is_deleting,
            progress: binding.progress,
            last_run_datetime: binding.last_run_datetime,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub organization_id: String,
    pub services: Vec<ServiceView>,
}

impl TransitionReport {
    pub fn service(&self, service_id: &str) -> Option<&ServiceView> {
        self.services.iter().find(|view| view.service_id == service_id)
    }

    pub fn launched(&self) -> Vec<String> {
        self.select(|outcome| matches!(outcome, ServiceOutcome::Launched { .. }))
    }

    pub fn not_launched(&self) -> Vec<String> {
        self.select(|outcome| {
            matches!(
                outcome,
                ServiceOutcome::NotLaunched { .. } | ServiceOutcome::AlreadyRunning
            )
        })
    }

    pub fn stopped(&self) -> Vec<String> {
        self.select(|outcome| matches!(outcome, ServiceOutcome::Stopped { .. }))
    }

    fn select(&self, predicate: impl Fn(&ServiceOutcome) -> bool) -> Vec<String> {
        self.services
            .iter()
            .filter(|view| predicate(&view.outcome))
            .map(|view| view.service_id.clone())
            .collect()
    }
}
