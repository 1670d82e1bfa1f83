//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Snapshot ledger invariant tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::sync::Arc;

use prometheus::Registry;
use tempfile::{tempdir, TempDir};
use tso_common::DataLayout;
use tso_persistence::{
    Organization, PersistenceError, PersistenceMetrics, Service, ServiceRegistry, SnapshotLedger,
    StateStore, Tag, TagAssignment, TagConflict, TagType, Version, PROD_TAG_ID, VALID_TAG_ID,
};

const VERSION: &str = "drive_nextcloud_v27";

struct Fixture {
    dir: TempDir,
    layout: DataLayout,
    ledger: SnapshotLedger,
    registry: Arc<Registry>,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let layout = DataLayout::new(dir.path().join("data"));
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(registry.clone()).unwrap();
    let store = Arc::new(
        StateStore::open(dir.path().join("state.json"))
            .unwrap()
            .with_metrics(metrics),
    );
    let services = ServiceRegistry::new(store.clone());
    services
        .upsert_service(Service {
            service_id: "drive".into(),
            name: "Drive".into(),
        })
        .unwrap();
    services
        .upsert_version(Version::new("drive", "nextcloud", "v27", "pool-drive"))
        .unwrap();
    services
        .upsert_organization(Organization {
            organization_id: "acme".into(),
            name: "Acme".into(),
            service_urls: Default::default(),
            ssh_port: None,
        })
        .unwrap();
    let ledger = SnapshotLedger::new(store, layout.clone());
    Fixture {
        dir,
        layout,
        ledger,
        registry,
    }
}

fn materialise(layout: &DataLayout, timestamp: i64) {
    fs::create_dir_all(
        layout
            .snapshot_dir("acme", "drive", "nextcloud", "v27", timestamp)
            .join("data"),
    )
    .unwrap();
}

#[test]
fn unique_tag_conflict_mutates_nothing_and_force_moves_it() {
    let fx = fixture();
    let first = fx.ledger.create("acme", VERSION, 1000, "", Some(PROD_TAG_ID)).unwrap();
    let second = fx.ledger.create("acme", VERSION, 2000, "", None).unwrap();

    let outcome = fx
        .ledger
        .assign_tag(&second.snapshot_id, PROD_TAG_ID, false, false)
        .unwrap();
    assert_eq!(
        outcome,
        TagAssignment::Conflict(TagConflict::UniqueTagHeldElsewhere {
            holder: first.snapshot_id.clone()
        })
    );
    assert!(fx.ledger.get(&first.snapshot_id).unwrap().has_tag(PROD_TAG_ID));
    assert!(fx.ledger.get(&second.snapshot_id).unwrap().tags.is_empty());

    let outcome = fx
        .ledger
        .assign_tag(&second.snapshot_id, PROD_TAG_ID, true, false)
        .unwrap();
    assert_eq!(
        outcome,
        TagAssignment::Assigned {
            stripped_from: Some(first.snapshot_id.clone()),
            replaced: None
        }
    );
    let holders: Vec<_> = fx
        .ledger
        .list("acme", VERSION)
        .into_iter()
        .filter(|s| s.has_tag(PROD_TAG_ID))
        .map(|s| s.snapshot_id)
        .collect();
    assert_eq!(holders, vec![second.snapshot_id]);
}

#[test]
fn second_system_tag_needs_force_to_replace_the_first() {
    let fx = fixture();
    let snap = fx.ledger.create("acme", VERSION, 1000, "", Some(VALID_TAG_ID)).unwrap();

    let refused = fx
        .ledger
        .assign_tag(&snap.snapshot_id, PROD_TAG_ID, false, false)
        .unwrap();
    assert!(matches!(
        refused,
        TagAssignment::Conflict(TagConflict::SystemSlotOccupied { .. })
    ));

    fx.ledger
        .assign_tag(&snap.snapshot_id, PROD_TAG_ID, true, false)
        .unwrap();
    assert_eq!(fx.ledger.get(&snap.snapshot_id).unwrap().tags, vec![PROD_TAG_ID]);
    assert_eq!(
        fx.ledger
            .assign_tag(&snap.snapshot_id, PROD_TAG_ID, false, false)
            .unwrap(),
        TagAssignment::AlreadyHeld
    );
}

#[test]
fn tagged_snapshot_cannot_be_deleted() {
    let fx = fixture();
    materialise(&fx.layout, 1000);
    let snap = fx.ledger.create("acme", VERSION, 1000, "", Some(VALID_TAG_ID)).unwrap();

    let err = fx.ledger.delete(&snap.snapshot_id).unwrap_err();
    assert!(matches!(err, PersistenceError::Forbidden(_)));

    assert!(fx.ledger.unassign_tag(&snap.snapshot_id, VALID_TAG_ID).unwrap());
    fx.ledger.delete(&snap.snapshot_id).unwrap();
    assert!(!fx
        .layout
        .snapshot_dir("acme", "drive", "nextcloud", "v27", 1000)
        .exists());
    assert!(fx.ledger.get(&snap.snapshot_id).is_err());
}

#[test]
fn failed_commit_keeps_the_snapshot_data() {
    let fx = fixture();
    materialise(&fx.layout, 1000);
    let snap = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();
    // The commit writes a sibling temp file first; a directory in its place fails it.
    let blocker = fx.dir.path().join("state.json.tmp");
    fs::create_dir_all(&blocker).unwrap();

    assert!(fx.ledger.delete(&snap.snapshot_id).is_err());
    assert!(fx
        .layout
        .snapshot_dir("acme", "drive", "nextcloud", "v27", 1000)
        .join("data")
        .is_dir());
    assert!(fx.ledger.get(&snap.snapshot_id).is_ok());

    fs::remove_dir(&blocker).unwrap();
    fx.ledger.delete(&snap.snapshot_id).unwrap();
    assert!(!fx
        .layout
        .snapshot_dir("acme", "drive", "nextcloud", "v27", 1000)
        .exists());
}

#[test]
fn identifiers_are_never_shared_between_tenants() {
    let fx = fixture();
    let acme = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();
    assert_eq!(fx.ledger.newest_timestamp(VERSION), Some(1000));

    let err = fx.ledger.create("globex", VERSION, 1000, "", None).unwrap_err();
    assert!(matches!(err, PersistenceError::Conflict(_)), "{err}");
    assert!(fx.ledger.list("globex", VERSION).is_empty());
    assert_eq!(fx.ledger.get(&acme.snapshot_id).unwrap().organization_id, "acme");

    let again = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();
    assert_eq!(again, acme);
    let globex = fx.ledger.create("globex", VERSION, 1001, "", None).unwrap();
    assert_eq!(globex.organization_id, "globex");
    assert_eq!(fx.ledger.newest_timestamp(VERSION), Some(1001));
    assert_eq!(fx.ledger.newest_timestamp("drive_nextcloud_v28"), None);
}

#[test]
fn source_tag_freezes_the_snapshot() {
    let fx = fixture();
    fx.ledger
        .upsert_tag(Tag {
            tag_id: "source_1".into(),
            name: "source".into(),
            description: String::new(),
            system: false,
            unique: false,
            tag_type: TagType::Source,
            organization_id: None,
        })
        .unwrap();
    let snap = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();

    assert!(matches!(
        fx.ledger.assign_tag(&snap.snapshot_id, "source_1", false, false),
        Err(PersistenceError::Forbidden(_))
    ));
    fx.ledger
        .assign_tag(&snap.snapshot_id, "source_1", false, true)
        .unwrap();

    assert!(matches!(
        fx.ledger.assign_tag(&snap.snapshot_id, VALID_TAG_ID, true, true),
        Err(PersistenceError::Forbidden(_))
    ));
    assert!(matches!(
        fx.ledger.unassign_tag(&snap.snapshot_id, "source_1"),
        Err(PersistenceError::Forbidden(_))
    ));
    assert!(matches!(
        fx.ledger.delete(&snap.snapshot_id),
        Err(PersistenceError::Forbidden(_))
    ));
}

#[test]
fn prune_drops_only_untagged_records_without_data() {
    let fx = fixture();
    materialise(&fx.layout, 1000);
    let kept_on_disk = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();
    let missing = fx.ledger.create("acme", VERSION, 2000, "", None).unwrap();
    let tagged = fx.ledger.create("acme", VERSION, 3000, "", Some(VALID_TAG_ID)).unwrap();
    let active = fx.ledger.create("acme", VERSION, 4000, "", None).unwrap();
    fx.ledger
        .mark_active("acme", VERSION, Some(&active.snapshot_id))
        .unwrap();

    let pruned = fx.ledger.prune("acme", VERSION).unwrap();
    assert_eq!(pruned, vec![missing.snapshot_id]);
    for survivor in [kept_on_disk, tagged, active] {
        assert!(fx.ledger.get(&survivor.snapshot_id).is_ok());
    }
}

#[test]
fn only_one_snapshot_is_active_per_version() {
    let fx = fixture();
    let a = fx.ledger.create("acme", VERSION, 1000, "", None).unwrap();
    let b = fx.ledger.create("acme", VERSION, 2000, "", None).unwrap();

    fx.ledger.mark_active("acme", VERSION, Some(&a.snapshot_id)).unwrap();
    fx.ledger.mark_active("acme", VERSION, Some(&b.snapshot_id)).unwrap();
    let active: Vec<_> = fx
        .ledger
        .list("acme", VERSION)
        .into_iter()
        .filter(|s| s.is_active)
        .map(|s| s.snapshot_id)
        .collect();
    assert_eq!(active, vec![b.snapshot_id.clone()]);

    fx.ledger.mark_active("acme", VERSION, None).unwrap();
    assert!(fx.ledger.active("acme", VERSION).is_none());
}

#[test]
fn import_records_directories_missing_from_the_ledger() {
    let fx = fixture();
    materialise(&fx.layout, 1000);
    materialise(&fx.layout, 2000);
    let version_dir = fx.layout.version_dir("acme", "drive", "nextcloud", "v27");
    fs::create_dir_all(version_dir.join("active")).unwrap();
    fs::create_dir_all(version_dir.join("scratch")).unwrap();
    fx.ledger.create("acme", VERSION, 1000, "kept", None).unwrap();

    let imported = fx.ledger.import_from_fs("acme", VERSION).unwrap();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].timestamp, 2000);
    assert_eq!(fx.ledger.list("acme", VERSION).len(), 2);
    assert!(fx.ledger.import_from_fs("acme", VERSION).unwrap().is_empty());
}

#[test]
fn creations_are_counted_by_tag() {
    let fx = fixture();
    fx.ledger.create("acme", VERSION, 1000, "", Some(VALID_TAG_ID)).unwrap();
    fx.ledger.create("acme", VERSION, 2000, "", None).unwrap();

    let families = fx.registry.gather();
    let created = families
        .iter()
        .find(|family| family.get_name() == "tso_snapshots_created_total")
        .unwrap();
    let total: f64 = created
        .get_metric()
        .iter()
        .map(|metric| metric.get_counter().get_value())
        .sum();
    assert_eq!(total, 2.0);
}
