//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Transitive `depends_on` closure, dependencies first.

use std::collections::HashSet;

use tracing::warn;

use crate::error::{OrchestratorError, Result};

/// Depth-first closure of `requested` over `depends_on`, de-duplicated,
/// with every service listed after its dependencies.
///
/// `depends_on` returns `None` for a service the tenant is not bound to.
/// A dependency cycle is broken at the edge that closes it.
pub fn resolve_order<F>(requested: &[String], depends_on: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    let mut order = Vec::new();
    let mut done = HashSet::new();
    let mut visiting = HashSet::new();
    for service_id in requested {
        visit(service_id, &depends_on, &mut visiting, &mut done, &mut order)?;
    }
    Ok(order)
}

fn visit<F>(
    service_id: &str,
    depends_on: &F,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<()>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    if done.contains(service_id) {
        return Ok(());
    }
    if !visiting.insert(service_id.to_owned()) {
        warn!(service = service_id, "dependency cycle detected; ignoring back edge");
        return Ok(());
    }
    let dependencies = depends_on(service_id).ok_or_else(|| OrchestratorError::NotFound {
        kind: "binding",
        id: service_id.to_owned(),
    })?;
    for dependency in &dependencies {
        visit(dependency, depends_on, visiting, done, order)?;
    }
    visiting.remove(service_id);
    done.insert(service_id.to_owned());
    order.push(service_id.to_owned());
    Ok(())
}
