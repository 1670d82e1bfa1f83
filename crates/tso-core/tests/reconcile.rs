//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Stop-all, recovery, import and scheduler scenarios."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::fs;
use std::time::Duration;

use common::*;
use tso_core::{ActivationRequest, ReconciliationScheduler, ServiceSelection};
use tso_persistence::{BindingStatus, Organization, Transition, VALID_TAG_ID};

async fn run_everything(h: &Harness) {
    h.orchestrator
        .activate(ActivationRequest::new(
            ORG,
            vec![ServiceSelection::new(MAIL), ServiceSelection::new(DRIVE)],
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn stop_all_saves_every_running_service() {
    let h = harness();
    run_everything(&h).await;

    let summary = h.orchestrator.reconcile_all_tenants().await;
    assert!(summary.failed.is_empty());
    let mut stopped: Vec<_> = summary.stopped.iter().map(|(_, s)| s.as_str()).collect();
    stopped.sort_unstable();
    assert_eq!(stopped, vec![DRIVE, FRONTAL, MAIL]);

    for service in [FRONTAL, MAIL, DRIVE] {
        let binding = h.orchestrator.registry().binding(ORG, service).unwrap();
        assert_eq!(binding.status, BindingStatus::Inactive);
        let snapshots = h.orchestrator.snapshots(ORG, service).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].comment, "nightly stop");
        assert_eq!(snapshots[0].tags, vec![VALID_TAG_ID.to_owned()]);
    }
    assert!(!h.cluster.pool_ready(ORG, "apps"));
    assert!(!h.cluster.pool_ready(ORG, "edge"));
}

#[tokio::test]
async fn tenants_saving_the_same_version_get_their_own_snapshots() {
    let h = harness();
    let registry = h.orchestrator.registry();
    registry
        .upsert_organization(Organization {
            organization_id: "globex".into(),
            name: "Globex".into(),
            service_urls: Default::default(),
            ssh_port: None,
        })
        .unwrap();
    registry.bind("globex", MAIL_VERSION, Vec::new()).unwrap();
    let ahead = chrono::Utc::now().timestamp_millis() + 3_600_000;
    h.orchestrator
        .ledger()
        .create(ORG, MAIL_VERSION, ahead, "clock ahead", None)
        .unwrap();
    h.orchestrator
        .activate(ActivationRequest::new(
            "globex",
            vec![ServiceSelection::new(MAIL)],
        ))
        .await
        .unwrap();

    let summary = h.orchestrator.reconcile_all_tenants().await;
    assert!(summary.failed.is_empty(), "{summary:?}");
    let globex = h.orchestrator.snapshots("globex", MAIL).unwrap();
    assert_eq!(globex.len(), 1);
    assert_eq!(globex[0].organization_id, "globex");
    assert!(globex[0].timestamp > ahead);
    assert_eq!(h.orchestrator.snapshots(ORG, MAIL).unwrap().len(), 1);
}

#[tokio::test]
async fn stop_all_with_nothing_running_is_a_no_op() {
    let h = harness();
    let summary = h.orchestrator.reconcile_all_tenants().await;
    assert!(summary.stopped.is_empty());
    assert_eq!(h.cluster.mutations(), 0);
}

#[tokio::test]
async fn interrupted_transitions_are_cleared() {
    let h = harness();
    let registry = h.orchestrator.registry();
    for service in [MAIL, DRIVE] {
        let binding = registry.binding(ORG, service).unwrap();
        registry
            .begin_transition(ORG, service, binding.revision, Transition::Activate)
            .unwrap();
    }
    assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 2);
    assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 0);
    assert!(registry
        .bindings_for(ORG)
        .iter()
        .all(|binding| !binding.in_transition()));
}

#[tokio::test]
async fn snapshot_directories_are_imported_once() {
    let h = harness();
    fs::create_dir_all(h.snapshot_dir(MAIL, 1_700_000_000_000).join("data")).unwrap();
    fs::create_dir_all(h.snapshot_dir(DRIVE, 1_700_000_500_000)).unwrap();
    fs::create_dir_all(h.active_dir(MAIL)).unwrap();

    let imported = h.orchestrator.import_snapshots_from_fs(ORG).unwrap();
    let mut ids: Vec<_> = imported.iter().map(|s| s.snapshot_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(
        ids,
        vec![
            "drive_nextcloud_v27_1700000500000",
            "mail_mailserver_v2_1700000000000"
        ]
    );
    assert!(h.orchestrator.import_snapshots_from_fs(ORG).unwrap().is_empty());
}

#[tokio::test]
async fn import_for_unknown_tenant_is_not_found() {
    let h = harness();
    let err = h.orchestrator.import_snapshots_from_fs("globex").unwrap_err();
    assert_eq!(err.status_hint(), 404);
}

#[tokio::test]
async fn scheduler_runs_stop_all_until_shut_down() {
    let h = harness_with(|config| {
        config.scheduler.stop_all_enabled = true;
        config.scheduler.stop_all_interval = Duration::from_millis(20);
    });
    run_everything(&h).await;

    let handle = ReconciliationScheduler::spawn(h.orchestrator.clone());
    assert_eq!(handle.jobs(), 1);
    let mut stopped = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if h.orchestrator.registry().active_bindings(ORG).is_empty() {
            stopped = true;
            break;
        }
    }
    handle.shutdown().await;
    assert!(stopped, "stop-all pass never ran");
    assert_eq!(h.orchestrator.snapshots(ORG, MAIL).unwrap().len(), 1);
}

#[tokio::test]
async fn disabled_scheduler_spawns_nothing() {
    let h = harness();
    let handle = ReconciliationScheduler::spawn(h.orchestrator.clone());
    assert_eq!(handle.jobs(), 0);
    handle.shutdown().await;
}
