//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Opens the persisted state shared by every tsoctl command."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tso_common::{AppConfig, DataLayout};
use tso_persistence::{Journal, ServiceRegistry, SnapshotLedger, StateStore};

/// Registry, ledger and journal over the configured state file.
pub struct StateContext {
    pub registry: ServiceRegistry,
    pub ledger: SnapshotLedger,
    pub journal: Journal,
}

impl StateContext {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut candidates = Vec::new();
        if let Some(path) = config_path {
            candidates.push(path.to_path_buf());
        }
        candidates.push(PathBuf::from("configs/tso.toml"));
        let config = AppConfig::load(&candidates)?;

        let storage = &config.storage;
        let store = Arc::new(
            StateStore::open(&storage.state_file)
                .with_context(|| format!("opening state file {}", storage.state_file.display()))?,
        );
        let journal = Journal::open(&storage.journal_file, None)
            .with_context(|| format!("opening journal {}", storage.journal_file.display()))?;
        let layout = DataLayout::new(config.platform.data_path.clone());
        Ok(Self {
            registry: ServiceRegistry::new(store.clone()),
            ledger: SnapshotLedger::new(store, layout),
            journal,
        })
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
