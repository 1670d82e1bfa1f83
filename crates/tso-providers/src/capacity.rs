//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Compute capacity: one node pool per tenant and pool id, scaled between
//! zero and one node.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::kubectl::{has_condition, items, Kubectl};
use crate::poll::{poll_until, PollSpec};
use crate::Result;

/// Cluster-visible name of a tenant's pool.
pub fn pool_name(organization_id: &str, pool: &str) -> String {
    format!("{organization_id}-{pool}")
}

#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Scale every pool to one node and wait until each has a ready node.
    async fn ensure_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()>;

    /// Scale every pool to zero and wait until its nodes are gone.
    async fn release_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()>;
}

/// Patches `nodepool` custom resources and watches labelled nodes.
#[derive(Debug, Clone)]
pub struct KubectlCapacity {
    kubectl: Kubectl,
    create: PollSpec,
    delete: PollSpec,
}

impl KubectlCapacity {
    pub fn new(kubectl: Kubectl, create: PollSpec, delete: PollSpec) -> Self {
        Self {
            kubectl,
            create,
            delete,
        }
    }

    async fn patch(&self, organization_id: &str, pool: &str, desired: u32) -> Result<()> {
        let patch = format!(r#"{{"spec":{{"desiredNodes":{desired}}}}}"#);
        let spec = self.kubectl.command(
            organization_id,
            [
                "patch".to_owned(),
                "nodepool".to_owned(),
                pool_name(organization_id, pool),
                "--type=merge".to_owned(),
                format!("--patch={patch}"),
            ],
        );
        self.kubectl.run_checked(&spec).await?;
        info!(organization = organization_id, pool, desired, "node pool patched");
        Ok(())
    }

    async fn nodes(&self, organization_id: &str, pool: &str) -> Result<Vec<Value>> {
        let spec = self.kubectl.command(
            organization_id,
            [
                "get".to_owned(),
                "nodes".to_owned(),
                "-l".to_owned(),
                format!("nodepool={}", pool_name(organization_id, pool)),
                "-o".to_owned(),
                "json".to_owned(),
            ],
        );
        Ok(match self.kubectl.get_json(&spec).await? {
            Some(list) => items(&list).into_iter().cloned().collect(),
            None => Vec::new(),
        })
    }
}

#[async_trait]
impl CapacityProvider for KubectlCapacity {
    async fn ensure_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()> {
        for pool in pools {
            self.patch(organization_id, pool, 1).await?;
        }
        for pool in pools {
            let operation = format!("node ready in {}", pool_name(organization_id, pool));
            poll_until(&operation, self.create, || async move {
                let nodes = self.nodes(organization_id, pool).await?;
                Ok::<_, crate::ProviderError>(nodes.iter().any(|node| has_condition(node, "Ready")))
            })
            .await?;
            info!(organization = organization_id, pool = %pool, "node pool ready");
        }
        Ok(())
    }

    async fn release_capacity(&self, organization_id: &str, pools: &[String]) -> Result<()> {
        for pool in pools {
            self.patch(organization_id, pool, 0).await?;
        }
        for pool in pools {
            let operation = format!("nodes removed from {}", pool_name(organization_id, pool));
            poll_until(&operation, self.delete, || async move {
                Ok::<_, crate::ProviderError>(self.nodes(organization_id, pool).await?.is_empty())
            })
            .await?;
            info!(organization = organization_id, pool = %pool, "node pool released");
        }
        Ok(())
    }
}
