//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives for the orchestrator workspace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_data_path() -> PathBuf {
    PathBuf::from("/data")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("kubernetes")
}

fn default_registry_url() -> String {
    "docker.io".to_owned()
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn default_kubectl() -> String {
    "kubectl".to_owned()
}

fn default_frontal_service() -> String {
    "frontal".to_owned()
}

fn default_node_create() -> Duration {
    Duration::from_secs(600)
}

fn default_node_create_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_node_delete() -> Duration {
    Duration::from_secs(600)
}

fn default_node_delete_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_node_create_attempts() -> usize {
    3
}

fn default_node_retry_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_service_create() -> Duration {
    Duration::from_secs(300)
}

fn default_service_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_job_completion() -> Duration {
    Duration::from_secs(600)
}

fn default_job_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_job_attempts() -> usize {
    3
}

fn default_rsync_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_key_path() -> String {
    "/root/id_ed25519".to_owned()
}

fn default_remote_log_path() -> String {
    "/tmp/rsync.log".to_owned()
}

fn default_daily() -> Duration {
    Duration::from_secs(86_400)
}

fn default_stop_all_comment() -> String {
    "Service stopped automatically".to_owned()
}

fn default_cert_threshold_days() -> u32 {
    30
}

fn default_state_file() -> PathBuf {
    PathBuf::from("var/tso/state.json")
}

fn default_journal_file() -> PathBuf {
    PathBuf::from("var/tso/journal.log")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the orchestrator daemon and CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "TSO_CONFIG";

    /// Load configuration from disk, respecting the `TSO_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.platform.data_path.as_os_str().is_empty() {
            return Err(anyhow!("platform.data_path must not be empty"));
        }
        self.timeouts.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Where tenant data lives and how the cluster is addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_frontal_service")]
    pub frontal_service: String,
    /// Capacity provider calls are skipped entirely when false.
    #[serde(default)]
    pub use_infra: bool,
    /// Release node capacity after every deactivation.
    #[serde(default)]
    pub delete_nodes: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            templates_dir: default_templates_dir(),
            registry_url: default_registry_url(),
            namespace: default_namespace(),
            kubectl: default_kubectl(),
            frontal_service: default_frontal_service(),
            use_infra: false,
            delete_nodes: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_node_create")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_create: Duration,
    #[serde(default = "default_node_create_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_create_interval: Duration,
    #[serde(default = "default_node_delete")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_delete: Duration,
    #[serde(default = "default_node_delete_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_delete_interval: Duration,
    #[serde(default = "default_node_create_attempts")]
    pub node_create_attempts: usize,
    #[serde(default = "default_node_retry_cooldown")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_retry_cooldown: Duration,
    #[serde(default = "default_service_create")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub service_create: Duration,
    #[serde(default = "default_service_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub service_interval: Duration,
    #[serde(default = "default_job_completion")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub job_completion: Duration,
    #[serde(default = "default_job_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub job_interval: Duration,
    #[serde(default = "default_job_attempts")]
    pub job_attempts: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            node_create: default_node_create(),
            node_create_interval: default_node_create_interval(),
            node_delete: default_node_delete(),
            node_delete_interval: default_node_delete_interval(),
            node_create_attempts: default_node_create_attempts(),
            node_retry_cooldown: default_node_retry_cooldown(),
            service_create: default_service_create(),
            service_interval: default_service_interval(),
            job_completion: default_job_completion(),
            job_interval: default_job_interval(),
            job_attempts: default_job_attempts(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("node_create", self.node_create, self.node_create_interval),
            ("node_delete", self.node_delete, self.node_delete_interval),
            ("service_create", self.service_create, self.service_interval),
            ("job_completion", self.job_completion, self.job_interval),
        ];
        for (name, timeout, interval) in pairs {
            if interval.is_zero() {
                return Err(anyhow!("timeouts.{name} poll interval must be non-zero"));
            }
            if interval > timeout {
                return Err(anyhow!(
                    "timeouts.{name} poll interval ({}s) exceeds its timeout ({}s)",
                    interval.as_secs(),
                    timeout.as_secs()
                ));
            }
        }
        if self.node_create_attempts == 0 || self.job_attempts == 0 {
            return Err(anyhow!("attempt counts must be at least 1"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// When false every transfer runs as a dry run.
    #[serde(default)]
    pub use_rsync: bool,
    #[serde(default = "default_rsync_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rsync_timeout: Duration,
    #[serde(default)]
    pub host_address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_remote_key_path")]
    pub remote_key_path: String,
    #[serde(default = "default_remote_log_path")]
    pub remote_log_path: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            use_rsync: false,
            rsync_timeout: default_rsync_timeout(),
            host_address: String::new(),
            ssh_port: default_ssh_port(),
            remote_key_path: default_remote_key_path(),
            remote_log_path: default_remote_log_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub stop_all_enabled: bool,
    #[serde(default = "default_daily")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stop_all_interval: Duration,
    #[serde(default = "default_stop_all_comment")]
    pub stop_all_comment: String,
    #[serde(default)]
    pub cert_renewal_enabled: bool,
    #[serde(default = "default_daily")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cert_renewal_interval: Duration,
    #[serde(default = "default_cert_threshold_days")]
    pub cert_renewal_threshold_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_all_enabled: false,
            stop_all_interval: default_daily(),
            stop_all_comment: default_stop_all_comment(),
            cert_renewal_enabled: false,
            cert_renewal_interval: default_daily(),
            cert_renewal_threshold_days: default_cert_threshold_days(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stop_all_interval.is_zero() || self.cert_renewal_interval.is_zero() {
            return Err(anyhow!("scheduler intervals must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_journal_file")]
    pub journal_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            journal_file: default_journal_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.platform.data_path, PathBuf::from("/data"));
        assert_eq!(config.timeouts.node_create, Duration::from_secs(600));
        assert_eq!(config.timeouts.node_create_attempts, 3);
        assert!(!config.transfer.use_rsync);
        assert_eq!(config.scheduler.cert_renewal_threshold_days, 30);
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let config: AppConfig = r#"
            [timeouts]
            service_create = 120
            service_interval = 2
        "#
        .parse()
        .unwrap();
        assert_eq!(config.timeouts.service_create, Duration::from_secs(120));
        assert_eq!(config.timeouts.service_interval, Duration::from_secs(2));
    }

    #[test]
    fn interval_longer_than_timeout_is_rejected() {
        let result: Result<AppConfig> = r#"
            [timeouts]
            job_completion = 5
            job_interval = 10
        "#
        .parse();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("job_completion"), "{err}");
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let result: Result<AppConfig> = "[timeouts]\nnode_create_attempts = 0\n".parse();
        assert!(result.is_err());
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let config: AppConfig = include_str!("../../../configs/tso.toml").parse().unwrap();
        assert_eq!(config.platform.frontal_service, "frontal");
        assert_eq!(config.transfer.host_address, "backup.internal");
        assert_eq!(config.scheduler.stop_all_interval, Duration::from_secs(86_400));
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }
}
