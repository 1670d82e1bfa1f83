//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Snapshot ledger commands: list, tag, untag, delete, prune, import."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use tso_persistence::{Snapshot, TagAssignment};

use crate::context::{print_json, StateContext};

/// Dispatch entry point for snapshot subcommands.
pub fn run(context: &StateContext, command: SnapshotsCommand) -> Result<()> {
    match command {
        SnapshotsCommand::List(cmd) => {
            context.registry.organization(&cmd.org)?;
            context.registry.version(&cmd.version)?;
            print_json(&context.ledger.list(&cmd.org, &cmd.version))
        }
        SnapshotsCommand::Tag(cmd) => cmd.execute(context),
        SnapshotsCommand::Untag(cmd) => {
            owned_snapshot(context, &cmd.target.org, &cmd.target.snapshot)?;
            let removed = context
                .ledger
                .unassign_tag(&cmd.target.snapshot, &cmd.tag)?;
            if removed {
                context.journal.record(
                    "tag_unassigned",
                    json!({ "snapshot_id": cmd.target.snapshot, "tag_id": cmd.tag }),
                );
            }
            print_json(&json!({ "removed": removed }))
        }
        SnapshotsCommand::Delete(cmd) => {
            owned_snapshot(context, &cmd.org, &cmd.snapshot)?;
            context.ledger.delete(&cmd.snapshot)?;
            context
                .journal
                .record("snapshot_deleted", json!({ "snapshot_id": cmd.snapshot }));
            print_json(&json!({ "deleted": cmd.snapshot }))
        }
        SnapshotsCommand::Prune(cmd) => {
            context.registry.organization(&cmd.org)?;
            let pruned = context.ledger.prune(&cmd.org, &cmd.version)?;
            if !pruned.is_empty() {
                context.journal.record(
                    "snapshots_pruned",
                    json!({ "organization_id": cmd.org, "snapshot_ids": pruned }),
                );
            }
            print_json(&pruned)
        }
        SnapshotsCommand::Import(cmd) => {
            context.registry.organization(&cmd.org)?;
            let mut imported = Vec::new();
            for binding in context.registry.bindings_for(&cmd.org) {
                imported.extend(context.ledger.import_from_fs(&cmd.org, &binding.version_id)?);
            }
            if !imported.is_empty() {
                context.journal.record(
                    "snapshots_imported",
                    json!({
                        "organization_id": cmd.org,
                        "snapshot_ids": imported.iter().map(|s| &s.snapshot_id).collect::<Vec<_>>(),
                    }),
                );
            }
            print_json(&imported)
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SnapshotsCommand {
    /// Snapshots of a tenant's version, newest first.
    List(VersionArgs),
    /// Assign a tag under the exclusivity rules.
    Tag(TagCommand),
    /// Remove a tag from a snapshot.
    Untag(UntagCommand),
    /// Delete an untagged snapshot and its data.
    Delete(SnapshotArgs),
    /// Forget untagged snapshots whose data directory is gone.
    Prune(VersionArgs),
    /// Record snapshot directories found on disk for every bound version.
    Import(OrgArgs),
}

#[derive(Debug, Args)]
pub struct OrgArgs {
    #[arg(long, value_name = "ID")]
    org: String,
}

#[derive(Debug, Args)]
pub struct VersionArgs {
    #[arg(long, value_name = "ID")]
    org: String,
    #[arg(long, value_name = "VERSION_ID")]
    version: String,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[arg(long, value_name = "ID")]
    org: String,
    #[arg(long, value_name = "SNAPSHOT_ID")]
    snapshot: String,
}

#[derive(Debug, Args)]
pub struct UntagCommand {
    #[command(flatten)]
    target: SnapshotArgs,
    #[arg(long, value_name = "TAG_ID")]
    tag: String,
}

#[derive(Debug, Args)]
pub struct TagCommand {
    #[command(flatten)]
    target: SnapshotArgs,
    #[arg(long, value_name = "TAG_ID")]
    tag: String,
    /// Move a unique tag or replace the snapshot's system tag.
    #[arg(long)]
    force: bool,
    /// Allow source tags.
    #[arg(long)]
    admin: bool,
}

impl TagCommand {
    fn execute(self, context: &StateContext) -> Result<()> {
        let snapshot_id = &self.target.snapshot;
        owned_snapshot(context, &self.target.org, snapshot_id)?;
        let outcome = context
            .ledger
            .assign_tag(snapshot_id, &self.tag, self.force, self.admin)?;
        match outcome {
            TagAssignment::AlreadyHeld => print_json(&json!({ "result": "already_held" })),
            TagAssignment::Assigned {
                stripped_from,
                replaced,
            } => {
                let report = json!({
                    "result": "assigned",
                    "snapshot_id": snapshot_id,
                    "tag_id": self.tag,
                    "stripped_from": stripped_from,
                    "replaced": replaced,
                });
                context.journal.record("tag_assigned", report.clone());
                print_json(&report)
            }
            TagAssignment::Conflict(conflict) => {
                print_json(&conflict)?;
                bail!("{conflict}; pass --force to override")
            }
        }
    }
}

fn owned_snapshot(context: &StateContext, org: &str, snapshot_id: &str) -> Result<Snapshot> {
    let snapshot = context.ledger.get(snapshot_id)?;
    if snapshot.organization_id != org {
        bail!("snapshot {snapshot_id} does not belong to {org}");
    }
    Ok(snapshot)
}
