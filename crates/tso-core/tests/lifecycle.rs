//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Activation and deactivation scenarios against fake collaborators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::fs;

use common::*;
use tso_core::{
    ActivationMode, ActivationRequest, AlertAudience, DeactivationRequest, Notification,
    OrchestratorError, ServiceOutcome, ServiceSelection, StopSelection, TriggerSource,
};
use tso_persistence::{
    BindingStatus, JournalReader, Transition, FAILED_TAG_ID, PROD_TAG_ID, PROGRESS_IDLE,
    VALID_TAG_ID,
};
use tso_providers::fake::{ClusterEvent, TransferCall};
use tso_providers::{RuntimeProvider, WorkloadState};

fn activate(services: &[&str]) -> ActivationRequest {
    ActivationRequest::new(
        ORG,
        services.iter().map(|s| ServiceSelection::new(*s)).collect(),
    )
}

fn stop(services: &[&str]) -> DeactivationRequest {
    DeactivationRequest::new(ORG, services.iter().map(|s| StopSelection::new(*s)).collect())
}

fn assert_settled(h: &Harness, service: &str, status: BindingStatus) {
    let binding = h.orchestrator.registry().binding(ORG, service).unwrap();
    assert_eq!(binding.status, status, "{service} status");
    assert!(!binding.is_creating, "{service} still creating");
    assert!(!binding.is_deleting, "{service} still deleting");
    assert_eq!(binding.progress, PROGRESS_IDLE);
}

#[tokio::test]
async fn clean_activation_and_saved_stop() {
    let h = harness();

    let report = h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    assert_eq!(report.launched(), vec![FRONTAL, MAIL]);
    assert!(report.not_launched().is_empty());
    assert_eq!(h.cluster.capacity_ensured(), 1);
    assert!(h.cluster.pool_ready(ORG, "apps"));
    assert!(h.cluster.pool_ready(ORG, "edge"));
    assert!(h.mover.calls().is_empty(), "no snapshot to restore from");
    assert_settled(&h, MAIL, BindingStatus::Active);
    assert_settled(&h, FRONTAL, BindingStatus::Active);
    assert!(h
        .orchestrator
        .registry()
        .binding(ORG, MAIL)
        .unwrap()
        .last_run_datetime
        .is_some());

    let rendered = fs::read_to_string(h.active_dir(MAIL).join("config/deployment.yaml")).unwrap();
    assert_eq!(
        rendered,
        "name: acme-mail\nimage: registry.example.test/tso/mailserver:v2\npool: acme-apps\n"
    );

    let report = h.orchestrator.deactivate(stop(&[MAIL])).await.unwrap();
    assert_eq!(report.stopped(), vec![MAIL, FRONTAL], "frontal cascades");
    assert_settled(&h, MAIL, BindingStatus::Inactive);
    assert_settled(&h, FRONTAL, BindingStatus::Inactive);

    let snapshots = h.orchestrator.snapshots(ORG, MAIL).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].tags, vec![VALID_TAG_ID.to_owned()]);
    assert!(!snapshots[0].is_active);
    assert!(!h.active_dir(MAIL).exists());
    assert!(h
        .snapshot_dir(MAIL, snapshots[0].timestamp)
        .join("config/deployment.yaml")
        .is_file());
    assert_eq!(h.cluster.workload(ORG, MAIL), WorkloadState::Absent);

    match &h.mover.calls()[0] {
        TransferCall::Save {
            target,
            base_timestamp,
            ..
        } => {
            assert_eq!(target.service_id, MAIL);
            assert_eq!(*base_timestamp, None);
        }
        other => panic!("expected a save, got {other:?}"),
    }

    assert_eq!(h.gather("tso_transitions_total", &[("operation", "activate"), ("outcome", "launched")]), 2.0);
    assert_eq!(h.gather("tso_active_services", &[("organization", ORG)]), 0.0);

    let kinds: Vec<String> = JournalReader::open(&h.dir.path().join("journal.log"))
        .unwrap()
        .map(|entry| entry.unwrap().kind)
        .collect();
    assert!(kinds.contains(&"service_activated".to_owned()));
    assert!(kinds.contains(&"service_deactivated".to_owned()));
}

#[tokio::test]
async fn activating_an_active_service_conflicts_without_side_effects() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    let before = h.cluster.mutations();

    let err = h.orchestrator.activate(activate(&[MAIL])).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)), "{err}");
    assert_eq!(err.status_hint(), 409);
    assert_eq!(h.cluster.mutations(), before);
    assert_settled(&h, MAIL, BindingStatus::Active);
}

#[tokio::test]
async fn active_dependencies_are_left_alone() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();

    let report = h.orchestrator.activate(activate(&[DRIVE])).await.unwrap();
    assert_eq!(report.launched(), vec![DRIVE]);
    assert_eq!(
        report.service(FRONTAL).unwrap().outcome,
        ServiceOutcome::DependencySatisfied
    );
    let frontal_applies = h
        .cluster
        .events()
        .iter()
        .filter(|event| matches!(event, ClusterEvent::WorkloadApplied { service_id, .. } if service_id == FRONTAL))
        .count();
    assert_eq!(frontal_applies, 1);
}

#[tokio::test]
async fn capacity_exhaustion_rolls_back_the_whole_batch() {
    let h = harness();
    h.cluster.fail_capacity(3);

    let err = h
        .orchestrator
        .activate(activate(&[FRONTAL, MAIL, DRIVE]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::InfrastructureTimeout { attempts: 3, .. }),
        "{err}"
    );
    assert!(err.is_retryable());
    assert_eq!(err.status_hint(), 504);
    assert_eq!(h.cluster.ensure_attempts(), 3);
    assert_eq!(h.cluster.capacity_released(), 1);
    for service in [FRONTAL, MAIL, DRIVE] {
        assert_settled(&h, service, BindingStatus::Inactive);
        assert_eq!(h.cluster.workload(ORG, service), WorkloadState::Absent);
    }
    assert_eq!(h.gather("tso_rollbacks_total", &[("phase", "capacity")]), 1.0);
}

#[tokio::test]
async fn capacity_rollback_keeps_pools_of_running_services() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    h.cluster.fail_capacity(3);

    let err = h
        .orchestrator
        .activate(activate(&[DRIVE]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::InfrastructureTimeout { .. }),
        "{err}"
    );
    assert_settled(&h, MAIL, BindingStatus::Active);
    assert_settled(&h, DRIVE, BindingStatus::Inactive);
    assert!(h.cluster.pool_ready(ORG, "apps"));
    assert!(h.cluster.pool_ready(ORG, "edge"));
    assert_eq!(h.cluster.capacity_released(), 0);
}

#[tokio::test]
async fn capacity_retry_recovers_within_attempts() {
    let h = harness();
    h.cluster.fail_capacity(2);

    let report = h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    assert_eq!(report.launched(), vec![FRONTAL, MAIL]);
    assert_eq!(h.cluster.ensure_attempts(), 3);
}

#[tokio::test]
async fn stalled_workload_only_rolls_back_its_own_service() {
    let h = harness();
    h.cluster.stall_service(DRIVE);

    let report = h
        .orchestrator
        .activate(activate(&[MAIL, DRIVE]))
        .await
        .unwrap();
    assert_eq!(report.launched(), vec![FRONTAL, MAIL]);
    assert_eq!(report.not_launched(), vec![DRIVE]);
    assert_settled(&h, DRIVE, BindingStatus::Inactive);
    assert_settled(&h, MAIL, BindingStatus::Active);
    assert!(!h.active_dir(DRIVE).exists());
    assert_eq!(h.cluster.workload(ORG, DRIVE), WorkloadState::Absent);
    assert!(h.cluster.events().iter().any(|event| matches!(
        event,
        ClusterEvent::WorkloadDeleted { service_id, .. } if service_id == DRIVE
    )));
    assert_eq!(h.gather("tso_rollbacks_total", &[("phase", "workload")]), 1.0);

    let alerts: Vec<_> = h
        .notifier
        .received()
        .into_iter()
        .filter(|n| matches!(n, Notification::ActivationReport { .. }))
        .collect();
    assert_eq!(
        alerts,
        vec![Notification::ActivationReport {
            organization_id: ORG.into(),
            launched: vec![FRONTAL.into(), MAIL.into()],
            not_launched: vec![DRIVE.into()],
        }]
    );
}

#[tokio::test]
async fn explicit_snapshot_is_restored_and_marked_active() {
    let h = harness();
    let older = h.saved_snapshot(MAIL, 1_700_000_000_000, None);
    h.saved_snapshot(MAIL, 1_700_000_100_000, None);

    let request = ActivationRequest::new(
        ORG,
        vec![ServiceSelection::from_snapshot(MAIL, older.clone())],
    );
    let report = h.orchestrator.activate(request).await.unwrap();
    assert_eq!(
        report.service(MAIL).unwrap().outcome,
        ServiceOutcome::Launched {
            basis_snapshot: Some(older.clone())
        }
    );
    assert!(h.mover.calls().iter().any(|call| matches!(
        call,
        TransferCall::Restore { target, base_timestamp: 1_700_000_000_000 } if target.service_id == MAIL
    )));
    let active: Vec<_> = h
        .orchestrator
        .snapshots(ORG, MAIL)
        .unwrap()
        .into_iter()
        .filter(|s| s.is_active)
        .map(|s| s.snapshot_id)
        .collect();
    assert_eq!(active, vec![older]);
}

#[tokio::test]
async fn snapshot_of_another_version_is_rejected() {
    let h = harness();
    let drive_snapshot = h.saved_snapshot(DRIVE, 1_700_000_000_000, None);
    let request = ActivationRequest::new(
        ORG,
        vec![ServiceSelection::from_snapshot(MAIL, drive_snapshot)],
    );
    let err = h.orchestrator.activate(request).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)), "{err}");
    assert_eq!(h.cluster.mutations(), 0);
}

#[tokio::test]
async fn failed_restore_reports_the_service_as_not_launched() {
    let h = harness();
    h.saved_snapshot(MAIL, 1_700_000_000_000, None);
    h.mover.fail_restores(true);

    let report = h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    assert_eq!(report.not_launched(), vec![MAIL]);
    assert_settled(&h, MAIL, BindingStatus::Inactive);
    assert!(!h.active_dir(MAIL).exists());
    assert_eq!(h.cluster.workload(ORG, MAIL), WorkloadState::Absent);
}

#[tokio::test]
async fn stop_without_save_discards_the_working_directory() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL, DRIVE])).await.unwrap();

    let request = DeactivationRequest::new(ORG, vec![StopSelection::new(MAIL).without_save()]);
    let report = h.orchestrator.deactivate(request).await.unwrap();
    assert_eq!(
        report.service(MAIL).unwrap().outcome,
        ServiceOutcome::Stopped {
            snapshot_id: None,
            tag_id: None
        }
    );
    assert!(report.service(FRONTAL).is_none(), "drive still needs the proxy");
    assert!(h.orchestrator.snapshots(ORG, MAIL).unwrap().is_empty());
    assert!(!h.active_dir(MAIL).exists());
    assert!(h.mover.calls().is_empty());
}

#[tokio::test]
async fn failed_save_still_records_a_failed_snapshot() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    h.mover.fail_saves(true);

    let request = DeactivationRequest::new(
        ORG,
        vec![StopSelection::new(MAIL).with_comment("before upgrade")],
    );
    let report = h.orchestrator.deactivate(request).await.unwrap();
    assert_settled(&h, MAIL, BindingStatus::Inactive);
    let snapshots = h.orchestrator.snapshots(ORG, MAIL).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].tags, vec![FAILED_TAG_ID.to_owned()]);
    assert_eq!(snapshots[0].comment, "before upgrade");
    assert_eq!(
        report.service(MAIL).unwrap().outcome,
        ServiceOutcome::Stopped {
            snapshot_id: Some(snapshots[0].snapshot_id.clone()),
            tag_id: Some(FAILED_TAG_ID.to_owned()),
        }
    );
}

#[tokio::test]
async fn connector_stop_carries_the_production_tag_forward() {
    let h = harness();
    let prod = h.saved_snapshot(MAIL, 1_700_000_000_000, Some(PROD_TAG_ID));

    h.orchestrator
        .activate(activate(&[MAIL]).with_source(TriggerSource::Connector))
        .await
        .unwrap();
    h.orchestrator
        .deactivate(stop(&[MAIL]).with_source(TriggerSource::Connector))
        .await
        .unwrap();

    let snapshots = h.orchestrator.snapshots(ORG, MAIL).unwrap();
    assert_eq!(snapshots.len(), 2);
    let newest = &snapshots[0];
    assert_ne!(newest.snapshot_id, prod);
    assert_eq!(newest.tags, vec![PROD_TAG_ID.to_owned()]);
    assert!(snapshots[1].tags.is_empty(), "unique tag moved");
    assert!(h.mover.calls().iter().any(|call| matches!(
        call,
        TransferCall::Save { base_timestamp: Some(1_700_000_000_000), .. }
    )));
}

#[tokio::test]
async fn operator_stop_tags_valid_even_after_production_basis() {
    let h = harness();
    h.saved_snapshot(MAIL, 1_700_000_000_000, Some(PROD_TAG_ID));
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    h.orchestrator.deactivate(stop(&[MAIL])).await.unwrap();

    let snapshots = h.orchestrator.snapshots(ORG, MAIL).unwrap();
    assert_eq!(snapshots[0].tags, vec![VALID_TAG_ID.to_owned()]);
    assert_eq!(snapshots[1].tags, vec![PROD_TAG_ID.to_owned()]);
}

#[tokio::test]
async fn mode_activation_needs_production_snapshots() {
    let h = harness();
    h.saved_snapshot(MAIL, 1_700_000_000_000, Some(PROD_TAG_ID));

    let err = h
        .orchestrator
        .activate(ActivationRequest::new(ORG, Vec::new()).with_mode(ActivationMode::Survival))
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::NotFound { kind: "production snapshot", .. }),
        "{err}"
    );
    assert_eq!(h.cluster.mutations(), 0);

    let drive_prod = h.saved_snapshot(DRIVE, 1_700_000_000_000, Some(PROD_TAG_ID));
    let report = h
        .orchestrator
        .activate(ActivationRequest::new(ORG, Vec::new()).with_mode(ActivationMode::Survival))
        .await
        .unwrap();
    assert_eq!(report.launched(), vec![FRONTAL, MAIL, DRIVE]);
    assert_eq!(
        report.service(DRIVE).unwrap().outcome,
        ServiceOutcome::Launched {
            basis_snapshot: Some(drive_prod)
        }
    );
    assert!(h.notifier.received().contains(&Notification::Alert {
        organization_id: ORG.into(),
        mode: ActivationMode::Survival,
        audience: AlertAudience::AllUsers,
    }));
}

#[tokio::test]
async fn preheat_mode_sends_no_alert() {
    let h = harness();
    h.saved_snapshot(MAIL, 1_700_000_000_000, Some(PROD_TAG_ID));
    h.saved_snapshot(DRIVE, 1_700_000_000_000, Some(PROD_TAG_ID));
    h.orchestrator
        .activate(ActivationRequest::new(ORG, Vec::new()).with_mode(ActivationMode::Preheat))
        .await
        .unwrap();
    assert!(!h
        .notifier
        .received()
        .iter()
        .any(|n| matches!(n, Notification::Alert { .. })));
}

#[tokio::test]
async fn running_workload_is_adopted_not_relaunched() {
    let h = harness();
    h.cluster.seed_workload(ORG, MAIL, WorkloadState::Available);

    let report = h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    assert_eq!(report.service(MAIL).unwrap().outcome, ServiceOutcome::AlreadyRunning);
    assert_eq!(report.not_launched(), vec![MAIL]);
    assert_settled(&h, MAIL, BindingStatus::Active);
    assert!(!h.cluster.events().iter().any(|event| matches!(
        event,
        ClusterEvent::WorkloadApplied { service_id, .. } if service_id == MAIL
    )));
}

#[tokio::test]
async fn stopping_an_absent_workload_takes_no_snapshot() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL, DRIVE])).await.unwrap();
    h.cluster
        .delete_workload(ORG, MAIL, &h.active_dir(MAIL).join("config"))
        .await
        .unwrap();

    let report = h.orchestrator.deactivate(stop(&[MAIL])).await.unwrap();
    assert_eq!(report.service(MAIL).unwrap().outcome, ServiceOutcome::AlreadyStopped);
    assert_settled(&h, MAIL, BindingStatus::Inactive);
    assert!(h.orchestrator.snapshots(ORG, MAIL).unwrap().is_empty());
}

#[tokio::test]
async fn shared_pool_is_released_only_when_unused() {
    let h = harness();
    h.orchestrator.activate(activate(&[MAIL, DRIVE])).await.unwrap();

    h.orchestrator
        .deactivate(stop(&[MAIL]).releasing_capacity())
        .await
        .unwrap();
    assert_eq!(h.cluster.capacity_released(), 0, "drive still runs on apps");
    assert!(h.cluster.pool_ready(ORG, "apps"));

    h.orchestrator
        .deactivate(stop(&[DRIVE]).releasing_capacity())
        .await
        .unwrap();
    assert_eq!(h.cluster.capacity_released(), 1);
    assert!(!h.cluster.pool_ready(ORG, "apps"));
    assert!(!h.cluster.pool_ready(ORG, "edge"));
    assert_settled(&h, FRONTAL, BindingStatus::Inactive);
}

#[tokio::test]
async fn infrastructure_is_untouched_when_disabled() {
    let h = harness_with(|config| config.platform.use_infra = false);
    h.orchestrator.activate(activate(&[MAIL])).await.unwrap();
    h.orchestrator
        .deactivate(stop(&[MAIL]).releasing_capacity())
        .await
        .unwrap();
    assert_eq!(h.cluster.ensure_attempts(), 0);
    assert_eq!(h.cluster.capacity_released(), 0);
}

#[tokio::test]
async fn transition_in_flight_blocks_both_directions() {
    let h = harness();
    let binding = h.orchestrator.registry().binding(ORG, MAIL).unwrap();
    h.orchestrator
        .registry()
        .begin_transition(ORG, MAIL, binding.revision, Transition::Activate)
        .unwrap();

    let err = h.orchestrator.activate(activate(&[MAIL])).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)), "{err}");
    let err = h.orchestrator.deactivate(stop(&[MAIL])).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)), "{err}");
    assert_eq!(h.cluster.mutations(), 0);
}

#[tokio::test]
async fn unbound_service_is_not_found() {
    let h = harness();
    let err = h.orchestrator.activate(activate(&["chat"])).await.unwrap_err();
    assert_eq!(err.status_hint(), 404);
}
