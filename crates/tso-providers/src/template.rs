//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Materialise a workload descriptor set into a service's `active/config`.

use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::{ProviderError, Result};

/// Values substituted into template descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParams {
    pub organization_id: String,
    pub registry_url: String,
    pub node_pool: String,
}

impl TemplateParams {
    fn apply(&self, text: &str) -> String {
        text.replace("{{ORGANIZATION_ID}}", &self.organization_id)
            .replace("{{REGISTRY_URL}}", &self.registry_url)
            .replace(
                "{{NODEPOOL}}",
                &format!("{}-{}", self.organization_id, self.node_pool),
            )
    }
}

fn is_descriptor(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Copy `source` into `dest` recursively. With `params`, placeholders in
/// YAML files are substituted; snapshot configs are copied verbatim.
///
/// Returns the number of files written.
pub fn render_descriptors(
    source: &Path,
    dest: &Path,
    params: Option<&TemplateParams>,
) -> Result<usize> {
    if !source.is_dir() {
        return Err(ProviderError::Template {
            path: source.display().to_string(),
            reason: "descriptor directory does not exist".into(),
        });
    }
    fs::create_dir_all(dest)?;
    let mut written = 0usize;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|err| ProviderError::Template {
            path: source.display().to_string(),
            reason: err.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| ProviderError::Template {
                path: entry.path().display().to_string(),
                reason: err.to_string(),
            })?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        match params {
            Some(params) if is_descriptor(entry.path()) => {
                let text = fs::read_to_string(entry.path())?;
                fs::write(&target, params.apply(&text))?;
            }
            _ => {
                fs::copy(entry.path(), &target)?;
            }
        }
        written += 1;
    }
    debug!(source = %source.display(), dest = %dest.display(), files = written, templated = params.is_some(), "descriptors rendered");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> TemplateParams {
        TemplateParams {
            organization_id: "acme".into(),
            registry_url: "registry.local".into(),
            node_pool: "pool-a".into(),
        }
    }

    #[test]
    fn substitutes_placeholders_in_yaml_only() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("templates");
        fs::create_dir_all(source.join("letsencrypt")).unwrap();
        fs::write(
            source.join("deployment.yaml"),
            "name: {{ORGANIZATION_ID}}-mail\nimage: {{REGISTRY_URL}}/mail:1\nnodepool: {{NODEPOOL}}\n",
        )
        .unwrap();
        fs::write(source.join("letsencrypt/job.yml"), "ns: {{ORGANIZATION_ID}}").unwrap();
        fs::write(source.join("README"), "{{ORGANIZATION_ID}}").unwrap();

        let dest = dir.path().join("active/config");
        let written = render_descriptors(&source, &dest, Some(&params())).unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            fs::read_to_string(dest.join("deployment.yaml")).unwrap(),
            "name: acme-mail\nimage: registry.local/mail:1\nnodepool: acme-pool-a\n"
        );
        assert_eq!(fs::read_to_string(dest.join("letsencrypt/job.yml")).unwrap(), "ns: acme");
        assert_eq!(fs::read_to_string(dest.join("README")).unwrap(), "{{ORGANIZATION_ID}}");
    }

    #[test]
    fn snapshot_configs_are_copied_verbatim() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("1700/config");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("deployment.yaml"), "name: {{ORGANIZATION_ID}}").unwrap();
        let dest = dir.path().join("active/config");
        render_descriptors(&source, &dest, None).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("deployment.yaml")).unwrap(),
            "name: {{ORGANIZATION_ID}}"
        );
    }

    #[test]
    fn missing_source_is_a_template_error() {
        let dir = tempdir().unwrap();
        let err = render_descriptors(&dir.path().join("nope"), &dir.path().join("out"), None)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Template { .. }));
    }
}
