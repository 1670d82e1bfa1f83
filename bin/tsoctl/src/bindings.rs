//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inspect and change which version each tenant service runs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use crate::context::{print_json, StateContext};

pub fn run(context: &StateContext, command: BindingsCommand) -> Result<()> {
    match command {
        BindingsCommand::List(cmd) => {
            context.registry.organization(&cmd.org)?;
            print_json(&context.registry.bindings_for(&cmd.org))
        }
        BindingsCommand::Bind(cmd) => cmd.execute(context),
    }
}

#[derive(Debug, Subcommand)]
pub enum BindingsCommand {
    /// Show the bindings of a tenant with their status and progress.
    List(ListBindingsCommand),
    /// Bind a tenant to a version, replacing the service's current binding.
    Bind(BindCommand),
}

#[derive(Debug, Args)]
pub struct ListBindingsCommand {
    #[arg(long, value_name = "ID")]
    org: String,
}

#[derive(Debug, Args)]
pub struct BindCommand {
    #[arg(long, value_name = "ID")]
    org: String,
    #[arg(long, value_name = "VERSION_ID")]
    version: String,
    /// Service that must be running first; repeatable.
    #[arg(long = "depends-on", value_name = "SERVICE_ID")]
    depends_on: Vec<String>,
}

impl BindCommand {
    fn execute(self, context: &StateContext) -> Result<()> {
        let binding = context
            .registry
            .bind(&self.org, &self.version, self.depends_on)?;
        context.journal.record(
            "version_bound",
            json!({
                "organization_id": binding.organization_id,
                "service_id": binding.service_id,
                "version_id": binding.version_id,
            }),
        );
        print_json(&binding)
    }
}
