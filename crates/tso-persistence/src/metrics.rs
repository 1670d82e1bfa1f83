//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    commits: IntCounter,
    commit_failures: IntCounter,
    revision_conflicts: IntCounter,
    snapshots_created: IntCounterVec,
    journal_bytes: IntCounter,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let commits = IntCounter::with_opts(Opts::new(
            "tso_store_commits_total",
            "State document mutations successfully committed",
        ))?;
        registry.register(Box::new(commits.clone()))?;

        let commit_failures = IntCounter::with_opts(Opts::new(
            "tso_store_commit_failures_total",
            "State document mutations that could not be written",
        ))?;
        registry.register(Box::new(commit_failures.clone()))?;

        let revision_conflicts = IntCounter::with_opts(Opts::new(
            "tso_revision_conflicts_total",
            "Binding transitions rejected by the revision check",
        ))?;
        registry.register(Box::new(revision_conflicts.clone()))?;

        let snapshots_created = IntCounterVec::new(
            Opts::new(
                "tso_snapshots_created_total",
                "Snapshot records created, labelled by the tag applied at creation",
            ),
            &["tag"],
        )?;
        registry.register(Box::new(snapshots_created.clone()))?;

        let journal_bytes = IntCounter::with_opts(Opts::new(
            "tso_journal_bytes_total",
            "Bytes appended to the transition journal",
        ))?;
        registry.register(Box::new(journal_bytes.clone()))?;

        Ok(Self {
            commits,
            commit_failures,
            revision_conflicts,
            snapshots_created,
            journal_bytes,
        })
    }

    /// Record a committed mutation.
    pub fn record_commit(&self) {
        self.commits.inc();
    }

    /// Record a mutation whose write failed.
    pub fn record_commit_failure(&self) {
        self.commit_failures.inc();
    }

    /// Record a stale-revision rejection.
    pub fn record_revision_conflict(&self) {
        self.revision_conflicts.inc();
    }

    /// Record a snapshot creation; `tag` is `none` for untagged records.
    pub fn record_snapshot_created(&self, tag: &str) {
        self.snapshots_created.with_label_values(&[tag]).inc();
    }

    /// Add to the total number of bytes written to the journal.
    pub fn record_journal_bytes(&self, bytes: usize) {
        self.journal_bytes.inc_by(bytes as u64);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
