//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Catalog maintenance: services, versions and tenants."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use indexmap::IndexMap;
use serde_json::json;
use tso_persistence::{Organization, Service, Version};

use crate::context::{print_json, StateContext};

/// Dispatch entry point for catalog subcommands.
pub fn run(context: &StateContext, command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::AddService(cmd) => cmd.execute(context),
        CatalogCommand::AddVersion(cmd) => cmd.execute(context),
        CatalogCommand::AddOrg(cmd) => cmd.execute(context),
        CatalogCommand::Orgs => print_json(&context.registry.organizations()),
    }
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// Create or rename a service.
    #[command(name = "add-service")]
    AddService(AddServiceCommand),
    /// Register a deployable version of a service.
    #[command(name = "add-version")]
    AddVersion(AddVersionCommand),
    /// Create or update a tenant.
    #[command(name = "add-org")]
    AddOrg(AddOrgCommand),
    /// List tenants.
    Orgs,
}

#[derive(Debug, Args)]
pub struct AddServiceCommand {
    #[arg(long, value_name = "ID")]
    id: String,
    #[arg(long)]
    name: String,
}

impl AddServiceCommand {
    fn execute(self, context: &StateContext) -> Result<()> {
        let service = Service {
            service_id: self.id,
            name: self.name,
        };
        context.registry.upsert_service(service.clone())?;
        context.journal.record("service_upserted", json!(service));
        print_json(&service)
    }
}

#[derive(Debug, Args)]
pub struct AddVersionCommand {
    #[arg(long, value_name = "ID")]
    service: String,
    #[arg(long)]
    product: String,
    /// Version name within the product (e.g. v2).
    #[arg(long)]
    name: String,
    /// Node pool the workloads are scheduled on.
    #[arg(long, value_name = "POOL")]
    pool: String,
}

impl AddVersionCommand {
    fn execute(self, context: &StateContext) -> Result<()> {
        let version = Version::new(self.service, self.product, self.name, self.pool);
        context.registry.upsert_version(version.clone())?;
        context.journal.record("version_upserted", json!(version));
        print_json(&version)
    }
}

#[derive(Debug, Args)]
pub struct AddOrgCommand {
    #[arg(long, value_name = "ID")]
    id: String,
    #[arg(long)]
    name: String,
    /// Public URL of a service, as SERVICE=URL.
    #[arg(long = "url", value_name = "SERVICE=URL")]
    urls: Vec<String>,
    /// SSH port of the tenant's durable data host.
    #[arg(long)]
    ssh_port: Option<u16>,
}

impl AddOrgCommand {
    fn execute(self, context: &StateContext) -> Result<()> {
        let service_urls = parse_urls(&self.urls)?;
        let organization = Organization {
            organization_id: self.id,
            name: self.name,
            service_urls,
            ssh_port: self.ssh_port,
        };
        context.registry.upsert_organization(organization.clone())?;
        context
            .journal
            .record("organization_upserted", json!(organization));
        print_json(&organization)
    }
}

fn parse_urls(raw: &[String]) -> Result<IndexMap<String, String>> {
    raw.iter()
        .map(|entry| {
            let (service, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid url '{entry}'; expected SERVICE=URL"))?;
            if service.trim().is_empty() || url.trim().is_empty() {
                return Err(anyhow!("invalid url '{entry}'; expected SERVICE=URL"));
            }
            Ok((service.trim().to_owned(), url.trim().to_owned()))
        })
        .collect()
}
