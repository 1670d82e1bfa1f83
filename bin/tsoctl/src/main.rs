//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for administrators managing orchestrator state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tso_common::init_stderr_tracing;

mod bindings;
mod catalog;
mod context;
mod snapshots;

use context::StateContext;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("tsoctl ", env!("CARGO_PKG_VERSION")),
    about = "Tenant service orchestrator administrative utility",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Services, versions and tenants")]
    Catalog(catalog::CatalogCommand),
    #[command(subcommand, about = "Tenant to version bindings")]
    Bindings(bindings::BindingsCommand),
    #[command(subcommand, about = "Snapshot ledger and tags")]
    Snapshots(snapshots::SnapshotsCommand),
}

fn main() -> Result<()> {
    init_stderr_tracing("warn");
    let cli = Cli::parse();
    let context = StateContext::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Catalog(cmd) => catalog::run(&context, cmd)?,
        Commands::Bindings(cmd) => bindings::run(&context, cmd)?,
        Commands::Snapshots(cmd) => snapshots::run(&context, cmd)?,
    }
    Ok(())
}
