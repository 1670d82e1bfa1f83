//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use serde_json::Value;
use tso_common::DataLayout;

use crate::shell::{CommandOutput, CommandRunner, CommandSpec};
use crate::{ProviderError, Result};

/// Per-tenant `kubectl` invocations: every call carries the tenant's
/// kubeconfig and the configured namespace.
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    namespace: String,
    layout: DataLayout,
}

impl Kubectl {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        namespace: impl Into<String>,
        layout: DataLayout,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            namespace: namespace.into(),
            layout,
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn command<I, S>(&self, organization_id: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.binary.clone())
            .arg("--kubeconfig")
            .arg(self.layout.kubeconfig(organization_id).display().to_string())
            .arg("-n")
            .arg(self.namespace.clone())
            .args(args)
    }

    /// Run and return the output whatever the exit status.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner.run(spec).await
    }

    /// Run and fail on a non-zero exit.
    pub async fn run_checked(&self, spec: &CommandSpec) -> Result<String> {
        Ok(self.runner.run(spec).await?.require_success(spec)?.output)
    }

    /// `get ... -o json`; `None` when the object does not exist.
    pub async fn get_json(&self, spec: &CommandSpec) -> Result<Option<Value>> {
        let output = self.runner.run(spec).await?;
        if !output.success {
            if is_not_found(&output.output) {
                return Ok(None);
            }
            return Err(ProviderError::Command {
                command: spec.display(),
                output: output.output,
            });
        }
        serde_json::from_str(&output.output)
            .map(Some)
            .map_err(|err| ProviderError::Parse {
                command: spec.display(),
                detail: err.to_string(),
            })
    }
}

impl std::fmt::Debug for Kubectl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubectl")
            .field("binary", &self.binary)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_not_found(output: &str) -> bool {
    output.contains("NotFound") || output.contains("not found")
}

/// `status.conditions[type == kind].status == "True"`.
pub(crate) fn has_condition(object: &Value, kind: &str) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(kind)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// `items` of a list response, or the object itself for a single get.
pub(crate) fn items(value: &Value) -> Vec<&Value> {
    match value.get("items").and_then(Value::as_array) {
        Some(items) => items.iter().collect(),
        None => vec![value],
    }
}

pub(crate) fn object_name(object: &Value) -> Option<&str> {
    object.pointer("/metadata/name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conditions_require_true_status() {
        let node = json!({"status": {"conditions": [
            {"type": "MemoryPressure", "status": "False"},
            {"type": "Ready", "status": "True"}
        ]}});
        assert!(has_condition(&node, "Ready"));
        let pending = json!({"status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}});
        assert!(!has_condition(&pending, "Ready"));
        assert!(!has_condition(&json!({}), "Ready"));
    }

    #[test]
    fn commands_carry_tenant_kubeconfig() {
        let kubectl = Kubectl::new(
            Arc::new(crate::TokioCommandRunner),
            "kubectl",
            "default",
            DataLayout::new("/data"),
        );
        let spec = kubectl.command("acme", ["get", "nodes"]);
        assert_eq!(
            spec.display(),
            "kubectl --kubeconfig /data/acme/k8s/kubeconfig.yaml -n default get nodes"
        );
    }
}
