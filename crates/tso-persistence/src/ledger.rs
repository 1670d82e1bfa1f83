//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Snapshot catalog per (tenant, version) with tag exclusivity.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tso_common::layout::{DataLayout, ACTIVE_DIR};

use crate::model::{Snapshot, Tag, Version};
use crate::store::{StateDocument, StateStore};
use crate::tags::{decide, SlotOccupant, TagConflict, TagDecision, TagRequest};
use crate::{PersistenceError, Result};

/// Result of a tag assignment that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAssignment {
    /// The snapshot already held the tag; nothing changed.
    AlreadyHeld,
    /// The tag was added.
    Assigned {
        /// Snapshot the unique tag was taken from.
        stripped_from: Option<String>,
        /// System tag that left the snapshot's slot.
        replaced: Option<String>,
    },
    /// Exclusivity would be violated and `force` was not given; nothing changed.
    Conflict(TagConflict),
}

/// View over the snapshot and tag records of a [`StateStore`].
#[derive(Debug, Clone)]
pub struct SnapshotLedger {
    store: Arc<StateStore>,
    layout: DataLayout,
}

impl SnapshotLedger {
    /// Wrap a shared store; `layout` locates snapshot data on disk.
    pub fn new(store: Arc<StateStore>, layout: DataLayout) -> Self {
        Self { store, layout }
    }

    /// Insert or replace a tag definition.
    pub fn upsert_tag(&self, tag: Tag) -> Result<()> {
        self.store.update(|doc| {
            doc.tags.insert(tag.tag_id.clone(), tag);
            Ok(())
        })
    }

    /// Tag lookup.
    pub fn tag(&self, tag_id: &str) -> Result<Tag> {
        self.store.read(|doc| {
            doc.tags
                .get(tag_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("tag", tag_id))
        })
    }

    /// Record a new snapshot, optionally tagging it (forced) in the same commit.
    ///
    /// Creating an identifier that already exists returns the existing record
    /// when it belongs to the same tenant and version, and is a conflict
    /// otherwise.
    pub fn create(
        &self,
        organization_id: &str,
        version_id: &str,
        timestamp: i64,
        comment: &str,
        tag_id: Option<&str>,
    ) -> Result<Snapshot> {
        let snapshot_id = Snapshot::id_for(version_id, timestamp);
        let created = self.store.update(|doc| {
            if !doc.versions.contains_key(version_id) {
                return Err(PersistenceError::not_found("version", version_id));
            }
            if let Some(existing) = doc.snapshots.get(&snapshot_id) {
                if existing.organization_id != organization_id || existing.version_id != version_id
                {
                    return Err(PersistenceError::Conflict(format!(
                        "snapshot {snapshot_id} is already recorded for {}",
                        existing.organization_id
                    )));
                }
                return Ok((existing.clone(), false));
            }
            let now = Utc::now();
            let snapshot = Snapshot {
                snapshot_id: snapshot_id.clone(),
                organization_id: organization_id.to_owned(),
                version_id: version_id.to_owned(),
                timestamp,
                is_active: false,
                tags: Vec::new(),
                comment: comment.to_owned(),
                create_date: now,
                update_date: now,
            };
            doc.snapshots.insert(snapshot_id.clone(), snapshot);
            if let Some(tag_id) = tag_id {
                apply_tag(doc, &snapshot_id, tag_id, true, false)?;
            }
            let snapshot = doc
                .snapshots
                .get(&snapshot_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("snapshot", &snapshot_id))?;
            Ok((snapshot, true))
        })?;

        let (snapshot, fresh) = created;
        if fresh {
            if let Some(metrics) = self.store.metrics() {
                metrics.record_snapshot_created(tag_id.unwrap_or("none"));
            }
            info!(
                organization_id,
                version_id,
                snapshot_id = %snapshot.snapshot_id,
                tags = ?snapshot.tags,
                "snapshot recorded"
            );
        }
        Ok(snapshot)
    }

    /// Snapshot lookup.
    pub fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.store.read(|doc| {
            doc.snapshots
                .get(snapshot_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("snapshot", snapshot_id))
        })
    }

    /// Snapshots of a tenant's version, newest first.
    pub fn list(&self, organization_id: &str, version_id: &str) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.store.read(|doc| {
            version_snapshots(doc, organization_id, version_id)
                .cloned()
                .collect()
        });
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        snapshots
    }

    /// Newest timestamp taken of `version_id` by any tenant.
    ///
    /// Snapshot identifiers are platform-wide, so new timestamps must clear it.
    pub fn newest_timestamp(&self, version_id: &str) -> Option<i64> {
        self.store.read(|doc| {
            doc.snapshots
                .values()
                .filter(|snapshot| snapshot.version_id == version_id)
                .map(|snapshot| snapshot.timestamp)
                .max()
        })
    }

    /// Most recently created snapshot.
    pub fn latest(&self, organization_id: &str, version_id: &str) -> Option<Snapshot> {
        self.store.read(|doc| {
            version_snapshots(doc, organization_id, version_id)
                .max_by_key(|snapshot| (snapshot.create_date, snapshot.timestamp))
                .cloned()
        })
    }

    /// Snapshot the running instance was restored from.
    pub fn active(&self, organization_id: &str, version_id: &str) -> Option<Snapshot> {
        self.store.read(|doc| {
            version_snapshots(doc, organization_id, version_id)
                .find(|snapshot| snapshot.is_active)
                .cloned()
        })
    }

    /// Newest snapshot holding `tag_id`.
    pub fn tagged(&self, organization_id: &str, version_id: &str, tag_id: &str) -> Option<Snapshot> {
        self.list(organization_id, version_id)
            .into_iter()
            .find(|snapshot| snapshot.has_tag(tag_id))
    }

    /// Make `snapshot_id` the only active snapshot of the version, or clear
    /// the active marker when `None`.
    pub fn mark_active(
        &self,
        organization_id: &str,
        version_id: &str,
        snapshot_id: Option<&str>,
    ) -> Result<()> {
        self.store.update(|doc| {
            if let Some(id) = snapshot_id {
                let target = doc
                    .snapshots
                    .get(id)
                    .ok_or_else(|| PersistenceError::not_found("snapshot", id))?;
                if target.organization_id != organization_id || target.version_id != version_id {
                    return Err(PersistenceError::Conflict(format!(
                        "snapshot {id} does not belong to {organization_id}/{version_id}"
                    )));
                }
            }
            let now = Utc::now();
            for snapshot in doc.snapshots.values_mut().filter(|s| {
                s.organization_id == organization_id && s.version_id == version_id
            }) {
                let should_be_active = Some(snapshot.snapshot_id.as_str()) == snapshot_id;
                if snapshot.is_active != should_be_active {
                    snapshot.is_active = should_be_active;
                    snapshot.update_date = now;
                }
            }
            Ok(())
        })
    }

    /// Assign a tag under the exclusivity rules.
    ///
    /// SOURCE tags need `privileged`; a snapshot holding a SOURCE tag takes no
    /// further tags. Exclusivity violations without `force` come back as
    /// [`TagAssignment::Conflict`] and mutate nothing.
    pub fn assign_tag(
        &self,
        snapshot_id: &str,
        tag_id: &str,
        force: bool,
        privileged: bool,
    ) -> Result<TagAssignment> {
        let outcome = self
            .store
            .update(|doc| apply_tag(doc, snapshot_id, tag_id, force, privileged))?;
        match &outcome {
            TagAssignment::Assigned {
                stripped_from,
                replaced,
            } => info!(
                snapshot_id,
                tag_id,
                stripped_from = ?stripped_from,
                replaced = ?replaced,
                "tag assigned"
            ),
            TagAssignment::Conflict(conflict) => {
                warn!(snapshot_id, tag_id, conflict = %conflict, "tag assignment refused")
            }
            TagAssignment::AlreadyHeld => {}
        }
        Ok(outcome)
    }

    /// Remove a tag. Returns `false` when the snapshot did not hold it.
    pub fn unassign_tag(&self, snapshot_id: &str, tag_id: &str) -> Result<bool> {
        self.store.update(|doc| {
            let tag = doc
                .tags
                .get(tag_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("tag", tag_id))?;
            if tag.is_source() {
                return Err(PersistenceError::Forbidden(format!(
                    "source tag {tag_id} cannot be removed"
                )));
            }
            if holds_source_tag(doc, snapshot_id)? {
                return Err(PersistenceError::Forbidden(format!(
                    "snapshot {snapshot_id} holds a source tag and is immutable"
                )));
            }
            let snapshot = doc
                .snapshots
                .get_mut(snapshot_id)
                .ok_or_else(|| PersistenceError::not_found("snapshot", snapshot_id))?;
            let before = snapshot.tags.len();
            snapshot.tags.retain(|held| held != tag_id);
            if snapshot.tags.len() == before {
                return Ok(false);
            }
            snapshot.update_date = Utc::now();
            Ok(true)
        })
    }

    /// Delete an untagged, inactive snapshot together with its data directory.
    pub fn delete(&self, snapshot_id: &str) -> Result<()> {
        let layout = self.layout.clone();
        let dir = self.store.update(|doc| {
            let snapshot = doc
                .snapshots
                .get(snapshot_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("snapshot", snapshot_id))?;
            if holds_source_tag(doc, snapshot_id)? {
                return Err(PersistenceError::Forbidden(format!(
                    "snapshot {snapshot_id} holds a source tag and cannot be deleted"
                )));
            }
            if !snapshot.tags.is_empty() {
                return Err(PersistenceError::Forbidden(format!(
                    "snapshot {snapshot_id} is tagged ({}); remove its tags first",
                    snapshot.tags.join(", ")
                )));
            }
            if snapshot.is_active {
                return Err(PersistenceError::Forbidden(format!(
                    "snapshot {snapshot_id} backs the running instance"
                )));
            }
            let dir = data_dir(doc, &layout, &snapshot)?;
            doc.snapshots.shift_remove(snapshot_id);
            Ok(dir)
        })?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(snapshot_id, "snapshot deleted");
        Ok(())
    }

    /// Drop records of untagged, inactive snapshots whose data is gone.
    pub fn prune(&self, organization_id: &str, version_id: &str) -> Result<Vec<String>> {
        let layout = self.layout.clone();
        let pruned = self.store.update(|doc| {
            let mut doomed = Vec::new();
            for snapshot in version_snapshots(doc, organization_id, version_id) {
                if snapshot.is_active || !snapshot.tags.is_empty() {
                    continue;
                }
                if !data_dir(doc, &layout, snapshot)?.exists() {
                    doomed.push(snapshot.snapshot_id.clone());
                }
            }
            for id in &doomed {
                doc.snapshots.shift_remove(id);
            }
            Ok(doomed)
        })?;
        if !pruned.is_empty() {
            info!(organization_id, version_id, pruned = ?pruned, "pruned snapshots with missing data");
        }
        Ok(pruned)
    }

    /// Record every on-disk snapshot directory of the version that the ledger lacks.
    pub fn import_from_fs(&self, organization_id: &str, version_id: &str) -> Result<Vec<Snapshot>> {
        let version = self.version(version_id)?;
        let dir = self.layout.version_dir(
            organization_id,
            &version.service_id,
            &version.product,
            &version.name,
        );
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut timestamps = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == ACTIVE_DIR {
                continue;
            }
            match name.parse::<i64>() {
                Ok(timestamp) => timestamps.push(timestamp),
                Err(_) => warn!(directory = %entry.path().display(), "ignoring non-snapshot directory"),
            }
        }
        timestamps.sort_unstable();

        let imported = self.store.update(|doc| {
            let mut imported = Vec::new();
            for timestamp in &timestamps {
                let snapshot_id = Snapshot::id_for(version_id, *timestamp);
                if let Some(existing) = doc.snapshots.get(&snapshot_id) {
                    if existing.organization_id != organization_id {
                        warn!(
                            snapshot_id = %snapshot_id,
                            owner = %existing.organization_id,
                            organization_id,
                            "snapshot identifier held by another tenant; directory not imported"
                        );
                    }
                    continue;
                }
                let created: DateTime<Utc> =
                    DateTime::from_timestamp_millis(*timestamp).unwrap_or_else(Utc::now);
                let snapshot = Snapshot {
                    snapshot_id: snapshot_id.clone(),
                    organization_id: organization_id.to_owned(),
                    version_id: version_id.to_owned(),
                    timestamp: *timestamp,
                    is_active: false,
                    tags: Vec::new(),
                    comment: String::new(),
                    create_date: created,
                    update_date: Utc::now(),
                };
                doc.snapshots.insert(snapshot_id, snapshot.clone());
                imported.push(snapshot);
            }
            Ok(imported)
        })?;
        if !imported.is_empty() {
            info!(organization_id, version_id, count = imported.len(), "imported snapshots from disk");
        }
        Ok(imported)
    }

    /// Directory holding a snapshot's config and data.
    pub fn snapshot_dir(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        self.store
            .read(|doc| data_dir(doc, &self.layout, snapshot))
    }

    fn version(&self, version_id: &str) -> Result<Version> {
        self.store.read(|doc| {
            doc.versions
                .get(version_id)
                .cloned()
                .ok_or_else(|| PersistenceError::not_found("version", version_id))
        })
    }
}

fn version_snapshots<'a>(
    doc: &'a StateDocument,
    organization_id: &'a str,
    version_id: &'a str,
) -> impl Iterator<Item = &'a Snapshot> + 'a {
    doc.snapshots.values().filter(move |snapshot| {
        snapshot.organization_id == organization_id && snapshot.version_id == version_id
    })
}

fn data_dir(doc: &StateDocument, layout: &DataLayout, snapshot: &Snapshot) -> Result<PathBuf> {
    let version = doc
        .versions
        .get(&snapshot.version_id)
        .ok_or_else(|| PersistenceError::not_found("version", &snapshot.version_id))?;
    Ok(layout.snapshot_dir(
        &snapshot.organization_id,
        &version.service_id,
        &version.product,
        &version.name,
        snapshot.timestamp,
    ))
}

fn holds_source_tag(doc: &StateDocument, snapshot_id: &str) -> Result<bool> {
    let snapshot = doc
        .snapshots
        .get(snapshot_id)
        .ok_or_else(|| PersistenceError::not_found("snapshot", snapshot_id))?;
    Ok(snapshot
        .tags
        .iter()
        .filter_map(|held| doc.tags.get(held))
        .any(Tag::is_source))
}

fn apply_tag(
    doc: &mut StateDocument,
    snapshot_id: &str,
    tag_id: &str,
    force: bool,
    privileged: bool,
) -> Result<TagAssignment> {
    let tag = doc
        .tags
        .get(tag_id)
        .cloned()
        .ok_or_else(|| PersistenceError::not_found("tag", tag_id))?;
    let snapshot = doc
        .snapshots
        .get(snapshot_id)
        .cloned()
        .ok_or_else(|| PersistenceError::not_found("snapshot", snapshot_id))?;

    if snapshot.has_tag(tag_id) {
        return Ok(TagAssignment::AlreadyHeld);
    }
    if let Some(owner) = &tag.organization_id {
        if owner != &snapshot.organization_id {
            return Err(PersistenceError::Forbidden(format!(
                "tag {tag_id} belongs to organization {owner}"
            )));
        }
    }
    if tag.is_source() && !privileged {
        return Err(PersistenceError::Forbidden(format!(
            "source tag {tag_id} requires a privileged caller"
        )));
    }
    if holds_source_tag(doc, snapshot_id)? {
        return Err(PersistenceError::Forbidden(format!(
            "snapshot {snapshot_id} holds a source tag and is immutable"
        )));
    }

    let holder = version_snapshots(doc, &snapshot.organization_id, &snapshot.version_id)
        .find(|other| other.snapshot_id != snapshot_id && other.has_tag(tag_id))
        .map(|other| other.snapshot_id.clone());
    let slot = snapshot
        .tags
        .iter()
        .filter_map(|held| doc.tags.get(held))
        .find(|held| held.system)
        .map(|held| SlotOccupant::Held {
            tag_id: held.tag_id.clone(),
            unique: held.unique,
        })
        .unwrap_or(SlotOccupant::Empty);

    let decision = decide(&TagRequest {
        system: tag.system,
        unique: tag.unique,
        holder,
        force,
        slot,
    });

    let (stripped_from, replaced) = match decision {
        TagDecision::Reject(conflict) => return Ok(TagAssignment::Conflict(conflict)),
        TagDecision::Grant => (None, None),
        TagDecision::StripHolderAndGrant { holder } => (Some(holder), None),
        TagDecision::ReplaceSlot { previous } => (None, Some(previous)),
        TagDecision::StripHolderAndReplaceSlot { holder, previous } => {
            (Some(holder), Some(previous))
        }
    };

    let now = Utc::now();
    if let Some(holder) = &stripped_from {
        if let Some(other) = doc.snapshots.get_mut(holder) {
            other.tags.retain(|held| held != tag_id);
            other.update_date = now;
        }
    }
    if let Some(target) = doc.snapshots.get_mut(snapshot_id) {
        if let Some(previous) = &replaced {
            target.tags.retain(|held| held != previous);
        }
        target.tags.push(tag_id.to_owned());
        target.update_date = now;
    }
    Ok(TagAssignment::Assigned {
        stripped_from,
        replaced,
    })
}
