//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared fixture for orchestrator integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tso_common::{AppConfig, DataLayout};
use tso_core::{Collaborators, Orchestrator, RecordingNotifier};
use tso_metrics::prometheus::proto::MetricType;
use tso_metrics::{new_registry, OrchestratorMetrics, SharedRegistry};
use tso_persistence::{Journal, Organization, Service, StateStore, Version};
use tso_providers::fake::{FakeCertificates, FakeCluster, FakeDataMover};

pub const ORG: &str = "acme";
pub const FRONTAL: &str = "frontal";
pub const MAIL: &str = "mail";
pub const DRIVE: &str = "drive";
pub const FRONTAL_VERSION: &str = "frontal_nginx_v1";
pub const MAIL_VERSION: &str = "mail_mailserver_v2";
pub const DRIVE_VERSION: &str = "drive_nextcloud_v27";

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub cluster: Arc<FakeCluster>,
    pub mover: Arc<FakeDataMover>,
    pub certificates: Arc<FakeCertificates>,
    pub notifier: Arc<RecordingNotifier>,
    pub metrics: SharedRegistry,
    pub layout: DataLayout,
}

pub fn fast_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.platform.data_path = root.join("data");
    config.platform.templates_dir = root.join("templates");
    config.platform.registry_url = "registry.example.test/tso".into();
    config.platform.use_infra = true;
    let timeouts = &mut config.timeouts;
    timeouts.node_create_attempts = 3;
    timeouts.node_retry_cooldown = Duration::from_millis(1);
    timeouts.service_create = Duration::from_millis(10);
    timeouts.service_interval = Duration::from_millis(1);
    timeouts.job_completion = Duration::from_millis(10);
    timeouts.job_interval = Duration::from_millis(1);
    timeouts.job_attempts = 2;
    config.scheduler.stop_all_comment = "nightly stop".into();
    config.storage.journal_file = root.join("journal.log");
    config
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(adjust: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempdir().unwrap();
    let mut config = fast_config(dir.path());
    adjust(&mut config);
    write_templates(&config.platform.templates_dir);

    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let journal = Arc::new(Journal::open(&config.storage.journal_file, None).unwrap());
    let cluster = Arc::new(FakeCluster::new());
    let mover = Arc::new(FakeDataMover::new());
    let certificates = Arc::new(FakeCertificates::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let metrics = new_registry();
    let layout = DataLayout::new(config.platform.data_path.clone());

    let collaborators = Collaborators {
        capacity: cluster.clone(),
        runtime: cluster.clone(),
        data_mover: mover.clone(),
        certificates: certificates.clone(),
        notifier: notifier.clone(),
    };
    let orchestrator = Orchestrator::new(Arc::new(config), store, journal, collaborators)
        .with_metrics(OrchestratorMetrics::new(metrics.clone()).unwrap());
    seed_catalog(&orchestrator);

    Harness {
        dir,
        orchestrator: Arc::new(orchestrator),
        cluster,
        mover,
        certificates,
        notifier,
        metrics,
        layout,
    }
}

/// frontal (pool edge) fronts mail and drive, which share pool apps.
fn seed_catalog(orchestrator: &Orchestrator) {
    let registry = orchestrator.registry();
    for (id, name) in [(FRONTAL, "Frontal"), (MAIL, "Mail"), (DRIVE, "Drive")] {
        registry
            .upsert_service(Service {
                service_id: id.into(),
                name: name.into(),
            })
            .unwrap();
    }
    registry
        .upsert_version(Version::new(FRONTAL, "nginx", "v1", "edge"))
        .unwrap();
    registry
        .upsert_version(Version::new(MAIL, "mailserver", "v2", "apps"))
        .unwrap();
    registry
        .upsert_version(Version::new(DRIVE, "nextcloud", "v27", "apps"))
        .unwrap();
    registry
        .upsert_organization(Organization {
            organization_id: ORG.into(),
            name: "Acme".into(),
            service_urls: [
                (MAIL.to_owned(), "https://mail.acme.test/".to_owned()),
                (DRIVE.to_owned(), "https://drive.acme.test".to_owned()),
            ]
            .into_iter()
            .collect(),
            ssh_port: None,
        })
        .unwrap();
    registry.bind(ORG, FRONTAL_VERSION, Vec::new()).unwrap();
    registry
        .bind(ORG, MAIL_VERSION, vec![FRONTAL.to_owned()])
        .unwrap();
    registry
        .bind(ORG, DRIVE_VERSION, vec![FRONTAL.to_owned()])
        .unwrap();
}

fn write_templates(root: &Path) {
    for (service, product, version) in [
        (FRONTAL, "nginx", "v1"),
        (MAIL, "mailserver", "v2"),
        (DRIVE, "nextcloud", "v27"),
    ] {
        let dir = root.join(service).join(product).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("deployment.yaml"),
            format!(
                "name: {{{{ORGANIZATION_ID}}}}-{service}\nimage: {{{{REGISTRY_URL}}}}/{product}:{version}\npool: {{{{NODEPOOL}}}}\n"
            ),
        )
        .unwrap();
    }
    let jobs = root.join(FRONTAL).join("nginx").join("v1").join("letsencrypt");
    fs::create_dir_all(&jobs).unwrap();
    fs::write(jobs.join("renew.yaml"), "kind: Job\nname: {{ORGANIZATION_ID}}-certbot\n").unwrap();
}

impl Harness {
    pub fn active_dir(&self, service: &str) -> PathBuf {
        let (product, version) = product_of(service);
        self.layout.active_dir(ORG, service, product, version)
    }

    pub fn snapshot_dir(&self, service: &str, timestamp: i64) -> PathBuf {
        let (product, version) = product_of(service);
        self.layout
            .snapshot_dir(ORG, service, product, version, timestamp)
    }

    /// Record a snapshot and materialise its directory with a rendered config.
    pub fn saved_snapshot(&self, service: &str, timestamp: i64, tag: Option<&str>) -> String {
        let version = version_of(service);
        let dir = self.snapshot_dir(service, timestamp);
        fs::create_dir_all(dir.join("config").join("letsencrypt")).unwrap();
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("config").join("deployment.yaml"), format!("name: {ORG}-{service}\n")).unwrap();
        fs::write(
            dir.join("config").join("letsencrypt").join("renew.yaml"),
            format!("kind: Job\nname: {ORG}-certbot\n"),
        )
        .unwrap();
        self.orchestrator
            .ledger()
            .create(ORG, version, timestamp, "seeded", tag)
            .unwrap()
            .snapshot_id
    }

    pub fn gather(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        for family in self.metrics.gather() {
            if family.get_name() != name {
                continue;
            }
            for metric in family.get_metric() {
                let matches = labels.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                });
                if matches {
                    return match family.get_field_type() {
                        MetricType::COUNTER => metric.get_counter().get_value(),
                        MetricType::GAUGE => metric.get_gauge().get_value(),
                        _ => metric.get_histogram().get_sample_count() as f64,
                    };
                }
            }
        }
        0.0
    }
}

pub fn version_of(service: &str) -> &'static str {
    match service {
        FRONTAL => FRONTAL_VERSION,
        MAIL => MAIL_VERSION,
        DRIVE => DRIVE_VERSION,
        other => panic!("unknown service {other}"),
    }
}

fn product_of(service: &str) -> (&'static str, &'static str) {
    match service {
        FRONTAL => ("nginx", "v1"),
        MAIL => ("mailserver", "v2"),
        DRIVE => ("nextcloud", "v27"),
        other => panic!("unknown service {other}"),
    }
}
