//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Record shapes stored in the state document.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// System tag applied to a snapshot saved from a clean stop.
pub const VALID_TAG_ID: &str = "valid_1690553345912";
/// Unique system tag marking the production basis of a version.
pub const PROD_TAG_ID: &str = "prod_1690553289436";
/// System tag applied when the data transfer of a save failed.
pub const FAILED_TAG_ID: &str = "failed_1716386348417";

/// Catalog entry for a logical service (mail, drive, auth, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Stable identifier, also the directory name below `service/`.
    pub service_id: String,
    /// Display name.
    pub name: String,
}

/// A deployable implementation of a service, pinned to a node pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// `<service>_<product>_<name>`.
    pub version_id: String,
    /// Owning service.
    pub service_id: String,
    /// Product implementing the service.
    pub product: String,
    /// Version name within the product.
    pub name: String,
    /// Capacity pool the version's workloads are scheduled on.
    pub node_pool: String,
}

impl Version {
    /// Build a version record, deriving its identifier.
    pub fn new(
        service_id: impl Into<String>,
        product: impl Into<String>,
        name: impl Into<String>,
        node_pool: impl Into<String>,
    ) -> Self {
        let service_id = service_id.into();
        let product = product.into();
        let name = name.into();
        Self {
            version_id: format!("{service_id}_{product}_{name}"),
            service_id,
            product,
            name,
            node_pool: node_pool.into(),
        }
    }
}

/// Tenant record, reduced to what the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Tenant identifier, also the top-level data directory name.
    pub organization_id: String,
    /// Display name.
    pub name: String,
    /// Public URL per service, used to locate TLS material.
    #[serde(default)]
    pub service_urls: IndexMap<String, String>,
    /// SSH port of the tenant's durable data host, when it differs from the default.
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

/// Activation status of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingStatus {
    /// No workload is expected to run.
    #[default]
    Inactive,
    /// The workload was brought up and is expected to run.
    Active,
}

impl std::fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingStatus::Inactive => f.write_str("INACTIVE"),
            BindingStatus::Active => f.write_str("ACTIVE"),
        }
    }
}

/// The mutable activation record linking a tenant to one version of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationVersion {
    /// Tenant.
    pub organization_id: String,
    /// Service; `(organization_id, service_id)` is the binding key.
    pub service_id: String,
    /// Bound version of the service.
    pub version_id: String,
    /// Activation status.
    #[serde(default)]
    pub status: BindingStatus,
    /// An activation is in flight.
    #[serde(default)]
    pub is_creating: bool,
    /// A deactivation is in flight.
    #[serde(default)]
    pub is_deleting: bool,
    /// Coarse progress of the in-flight transition, 0..=100.
    #[serde(default)]
    pub progress: u8,
    /// Services that must run before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Last time the service was brought up.
    #[serde(default)]
    pub last_run_datetime: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter, bumped on every committed write.
    #[serde(default)]
    pub revision: u64,
}

impl OrganizationVersion {
    /// A fresh, inactive binding.
    pub fn new(
        organization_id: impl Into<String>,
        service_id: impl Into<String>,
        version_id: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            service_id: service_id.into(),
            version_id: version_id.into(),
            status: BindingStatus::Inactive,
            is_creating: false,
            is_deleting: false,
            progress: 10,
            depends_on,
            last_run_datetime: None,
            revision: 0,
        }
    }

    /// True while either transition flag is set.
    pub fn in_transition(&self) -> bool {
        self.is_creating || self.is_deleting
    }

    /// True when the binding matches the given key.
    pub fn is(&self, organization_id: &str, service_id: &str) -> bool {
        self.organization_id == organization_id && self.service_id == service_id
    }
}

/// A timestamped capture of one tenant's data for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `<version_id>_<timestamp>`.
    pub snapshot_id: String,
    /// Tenant.
    pub organization_id: String,
    /// Version the data belongs to.
    pub version_id: String,
    /// Milliseconds since the epoch; also the snapshot directory name.
    pub timestamp: i64,
    /// The running instance was restored from this snapshot.
    #[serde(default)]
    pub is_active: bool,
    /// Held tag identifiers.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form operator comment.
    #[serde(default)]
    pub comment: String,
    /// Record creation time.
    pub create_date: DateTime<Utc>,
    /// Last mutation time.
    pub update_date: DateTime<Utc>,
}

impl Snapshot {
    /// Identifier of the snapshot taken of `version_id` at `timestamp`.
    pub fn id_for(version_id: &str, timestamp: i64) -> String {
        format!("{version_id}_{timestamp}")
    }

    /// True when the snapshot holds the given tag.
    pub fn has_tag(&self, tag_id: &str) -> bool {
        self.tags.iter().any(|held| held == tag_id)
    }
}

/// Classification of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagType {
    /// Marks immutable source data; assignable only by privileged callers.
    Source,
    /// Operator-defined label.
    Custom,
    /// Platform classification (valid, production, failed).
    System,
}

/// Label definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Stable identifier.
    pub tag_id: String,
    /// Display name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Occupies the per-snapshot system slot.
    pub system: bool,
    /// Held by at most one snapshot per version when also `system`.
    pub unique: bool,
    /// Classification.
    #[serde(rename = "type")]
    pub tag_type: TagType,
    /// Owning tenant; `None` for platform-wide tags.
    #[serde(default)]
    pub organization_id: Option<String>,
}

impl Tag {
    /// True when the tag makes its holder immutable.
    pub fn is_source(&self) -> bool {
        self.tag_type == TagType::Source
    }

    /// Tags seeded into an empty store.
    pub fn system_defaults() -> Vec<Tag> {
        vec![
            Tag {
                tag_id: VALID_TAG_ID.to_owned(),
                name: "valid".to_owned(),
                description: "Saved from a clean stop".to_owned(),
                system: true,
                unique: false,
                tag_type: TagType::System,
                organization_id: None,
            },
            Tag {
                tag_id: PROD_TAG_ID.to_owned(),
                name: "prod".to_owned(),
                description: "Production basis of the version".to_owned(),
                system: true,
                unique: true,
                tag_type: TagType::System,
                organization_id: None,
            },
            Tag {
                tag_id: FAILED_TAG_ID.to_owned(),
                name: "failed".to_owned(),
                description: "Data transfer failed while saving".to_owned(),
                system: true,
                unique: false,
                tag_type: TagType::System,
                organization_id: None,
            },
        ]
    }
}
