//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External collaborators driven by the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::shell::{CommandRunner, CommandSpec};
use crate::{ProviderError, Result};

#[async_trait]
pub trait CertificateInspector: Send + Sync {
    /// Expiry (`notAfter`) of the PEM certificate at `pem`.
    async fn expires_at(&self, pem: &Path) -> Result<DateTime<Utc>>;
}

/// `openssl x509 -enddate -noout -in <pem>`.
#[derive(Clone)]
pub struct OpensslInspector {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl OpensslInspector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "openssl".into(),
        }
    }
}

/// Parse `notAfter=Feb 19 23:59:59 2024 GMT`.
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("notAfter="))?;
    let normalized = value
        .split_whitespace()
        .filter(|part| *part != "GMT")
        .collect::<Vec<_>>()
        .join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl CertificateInspector for OpensslInspector {
    async fn expires_at(&self, pem: &Path) -> Result<DateTime<Utc>> {
        if !pem.is_file() {
            return Err(ProviderError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("certificate {} not found", pem.display()),
            )));
        }
        let spec = CommandSpec::new(self.binary.clone()).args([
            "x509".to_owned(),
            "-enddate".to_owned(),
            "-noout".to_owned(),
            "-in".to_owned(),
            pem.display().to_string(),
        ]);
        let output = self.runner.run(&spec).await?.require_success(&spec)?;
        parse_not_after(&output.output).ok_or_else(|| ProviderError::Parse {
            command: spec.display(),
            detail: format!("no notAfter date in {:?}", output.output.trim()),
        })
    }
}
