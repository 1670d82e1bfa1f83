//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Single-document JSON store with write-through persistence.
//!
//! Every mutation runs against a clone of the document; the clone is written
//! to a temporary file, renamed over the previous state and only then swapped
//! into memory. A failed write therefore leaves both the file and the
//! in-memory view untouched.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::metrics::PersistenceMetrics;
use crate::model::{Organization, OrganizationVersion, Service, Snapshot, Tag, Version};
use crate::{PersistenceError, Result};

/// Current state envelope version.
pub const STATE_FORMAT_VERSION: u16 = 1;

/// Everything the orchestrator persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Service catalog keyed by service id.
    #[serde(default)]
    pub services: IndexMap<String, Service>,
    /// Deployable versions keyed by version id.
    #[serde(default)]
    pub versions: IndexMap<String, Version>,
    /// Tenants keyed by organization id.
    #[serde(default)]
    pub organizations: IndexMap<String, Organization>,
    /// Tenant bindings; at most one per `(organization_id, service_id)`.
    #[serde(default)]
    pub bindings: Vec<OrganizationVersion>,
    /// Snapshots keyed by snapshot id.
    #[serde(default)]
    pub snapshots: IndexMap<String, Snapshot>,
    /// Tag definitions keyed by tag id.
    #[serde(default)]
    pub tags: IndexMap<String, Tag>,
}

impl StateDocument {
    /// An empty document carrying the platform system tags.
    pub fn seeded() -> Self {
        let mut document = Self::default();
        for tag in Tag::system_defaults() {
            document.tags.insert(tag.tag_id.clone(), tag);
        }
        document
    }

    /// Binding lookup by key.
    pub fn binding(&self, organization_id: &str, service_id: &str) -> Option<&OrganizationVersion> {
        self.bindings
            .iter()
            .find(|binding| binding.is(organization_id, service_id))
    }

    /// Mutable binding lookup by key.
    pub fn binding_mut(
        &mut self,
        organization_id: &str,
        service_id: &str,
    ) -> Option<&mut OrganizationVersion> {
        self.bindings
            .iter_mut()
            .find(|binding| binding.is(organization_id, service_id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    version: u16,
    saved_at: DateTime<Utc>,
    hash: String,
    document: StateDocument,
}

/// Shared handle to the persisted state document.
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<StateDocument>,
    metrics: Option<PersistenceMetrics>,
}

impl StateStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::from_document(StateDocument::seeded())
    }

    /// A non-persistent store over an existing document.
    pub fn from_document(document: StateDocument) -> Self {
        Self {
            path: None,
            state: Mutex::new(document),
            metrics: None,
        }
    }

    /// Open the store at `path`, creating a seeded document if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let document = load_document(&path)?;
            info!(
                state_file = %path.display(),
                bindings = document.bindings.len(),
                snapshots = document.snapshots.len(),
                "state document loaded"
            );
            document
        } else {
            let document = StateDocument::seeded();
            write_document(&path, &document)?;
            info!(state_file = %path.display(), "initialised empty state document");
            document
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(document),
            metrics: None,
        })
    }

    /// Attach metrics recorded on every commit.
    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Metrics handle shared with the registry and ledger views.
    pub fn metrics(&self) -> Option<&PersistenceMetrics> {
        self.metrics.as_ref()
    }

    /// Run a read-only closure against the current document.
    pub fn read<R>(&self, reader: impl FnOnce(&StateDocument) -> R) -> R {
        let guard = self.state.lock();
        reader(&guard)
    }

    /// Apply a mutation atomically. The closure's error aborts the commit.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut StateDocument) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock();
        let mut draft = guard.clone();
        let output = mutate(&mut draft)?;
        if draft == *guard {
            return Ok(output);
        }
        if let Some(path) = &self.path {
            let started = Instant::now();
            if let Err(err) = write_document(path, &draft) {
                warn!(state_file = %path.display(), error = %err, "state commit failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_commit_failure();
                }
                return Err(err);
            }
            debug!(
                state_file = %path.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "state committed"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_commit();
        }
        *guard = draft;
        Ok(output)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn write_document(path: &Path, document: &StateDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let envelope = StateEnvelope {
        version: STATE_FORMAT_VERSION,
        saved_at: Utc::now(),
        hash: compute_hash(document)?,
        document: document.clone(),
    };
    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &envelope)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_document(path: &Path) -> Result<StateDocument> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let envelope: StateEnvelope = serde_json::from_slice(&bytes)?;
    if envelope.hash != compute_hash(&envelope.document)? {
        return Err(PersistenceError::HashMismatch);
    }
    Ok(envelope.document)
}

fn compute_hash(document: &StateDocument) -> Result<String> {
    let serialized = serde_json::to_vec(document)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}
