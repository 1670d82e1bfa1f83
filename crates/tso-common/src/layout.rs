//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives for the orchestrator workspace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! On-disk layout of tenant data below the platform data root.
//!
//! ```text
//! <root>/<org>/k8s/kubeconfig.yaml
//! <root>/<org>/ssh/id_ed25519
//! <root>/<org>/<service>/                                   node-local working copy
//! <root>/<org>/service/<service>/<product>/<version>/active/ running instance
//! <root>/<org>/service/<service>/<product>/<version>/<ts>/   snapshot
//! ```

use std::path::{Path, PathBuf};

/// Name of the working directory of a running service instance.
pub const ACTIVE_DIR: &str = "active";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn organization_dir(&self, organization_id: &str) -> PathBuf {
        self.root.join(organization_id)
    }

    pub fn kubeconfig(&self, organization_id: &str) -> PathBuf {
        self.organization_dir(organization_id)
            .join("k8s")
            .join("kubeconfig.yaml")
    }

    pub fn ssh_private_key(&self, organization_id: &str) -> PathBuf {
        self.organization_dir(organization_id)
            .join("ssh")
            .join("id_ed25519")
    }

    /// Directory the synchronisation workload reads from and writes to on the node.
    pub fn node_data_dir(&self, organization_id: &str, service_id: &str) -> PathBuf {
        self.organization_dir(organization_id).join(service_id)
    }

    pub fn version_dir(
        &self,
        organization_id: &str,
        service_id: &str,
        product: &str,
        version: &str,
    ) -> PathBuf {
        self.organization_dir(organization_id)
            .join("service")
            .join(service_id)
            .join(product)
            .join(version)
    }

    pub fn active_dir(
        &self,
        organization_id: &str,
        service_id: &str,
        product: &str,
        version: &str,
    ) -> PathBuf {
        self.version_dir(organization_id, service_id, product, version)
            .join(ACTIVE_DIR)
    }

    pub fn snapshot_dir(
        &self,
        organization_id: &str,
        service_id: &str,
        product: &str,
        version: &str,
        timestamp: i64,
    ) -> PathBuf {
        self.version_dir(organization_id, service_id, product, version)
            .join(timestamp.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_tenant_hierarchy() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.kubeconfig("acme"),
            PathBuf::from("/data/acme/k8s/kubeconfig.yaml")
        );
        assert_eq!(
            layout.active_dir("acme", "mail", "mailserver", "v2"),
            PathBuf::from("/data/acme/service/mail/mailserver/v2/active")
        );
        assert_eq!(
            layout.snapshot_dir("acme", "mail", "mailserver", "v2", 1700000000000),
            PathBuf::from("/data/acme/service/mail/mailserver/v2/1700000000000")
        );
        assert_eq!(
            layout.node_data_dir("acme", "mail"),
            PathBuf::from("/data/acme/mail")
        );
    }
}
