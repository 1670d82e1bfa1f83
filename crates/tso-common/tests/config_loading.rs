//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration loading tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use tempfile::tempdir;
use tso_common::config::AppConfig;
use tso_common::LogFormat;

#[test]
fn first_existing_candidate_wins() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("tso.toml");
    fs::write(
        &present,
        r#"
[platform]
data_path = "/srv/tenants"
use_infra = true

[transfer]
use_rsync = true
host_address = "backup.internal"
ssh_port = 2222

[scheduler]
stop_all_enabled = true
stop_all_interval = 3600

[logging]
format = "pretty"
"#,
    )
    .unwrap();

    let loaded = AppConfig::load_with_source(&[&missing, &present]).unwrap();
    assert_eq!(loaded.source, present);
    let config = loaded.config;
    assert_eq!(config.platform.data_path.to_str(), Some("/srv/tenants"));
    assert!(config.platform.use_infra);
    assert!(!config.platform.delete_nodes);
    assert_eq!(config.transfer.ssh_port, 2222);
    assert_eq!(config.scheduler.stop_all_interval, Duration::from_secs(3600));
    assert_eq!(config.logging.format, LogFormat::Pretty);
}

#[test]
fn missing_candidates_report_inspected_paths() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = AppConfig::load_with_source(&[&missing]).unwrap_err();
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
fn invalid_file_carries_path_context() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[timeouts]\nservice_interval = \"soon\"\n").unwrap();
    let err = AppConfig::load_with_source(&[&path]).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
}
