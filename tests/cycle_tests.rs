use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tempfile::TempDir;
use tiered_backup_cloud::MemoryCloud;
use tiered_backup_common::{
    BlockDevice, Instance, Tags, BACKUP_LABEL_TAG, CONFIG_TAG, DELETE_ON_TAG, NAME_TAG,
};
use tiered_backup_engine::{BackupCycle, BackupError, InstanceOutcome, Settings};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn instance(id: &str, config: Option<&str>, volumes: &[&str]) -> Instance {
    let mut tags = Tags::new();
    tags.insert(NAME_TAG.to_string(), format!("{id}-name"));
    if let Some(config) = config {
        tags.insert(CONFIG_TAG.to_string(), config.to_string());
    }
    Instance {
        id: id.to_string(),
        tags,
        block_devices: volumes
            .iter()
            .enumerate()
            .map(|(n, v)| BlockDevice {
                device_name: format!("/dev/xvd{}", (b'a' + n as u8) as char),
                volume_id: v.to_string(),
            })
            .collect(),
    }
}

fn setup(instances: Vec<Instance>) -> (Arc<MemoryCloud>, BackupCycle) {
    let cloud = Arc::new(MemoryCloud::new());
    for i in instances {
        cloud.put_instance(i).unwrap();
    }
    let cycle = BackupCycle::new(cloud.clone(), Settings::default());
    (cloud, cycle)
}

// =========================================================================
// Test 1: one misconfigured instance does not block the others
// =========================================================================
#[tokio::test]
async fn test_bad_configuration_is_isolated() {
    let (cloud, cycle) = setup(vec![
        instance("i-1", Some("7,4,0,5"), &["vol-1"]),
        instance("i-2", Some("7,4,5"), &["vol-2"]),
        instance("i-3", Some("1,0,0,0"), &["vol-3a", "vol-3b"]),
        instance("i-4", None, &["vol-4"]),
    ]);

    let report = cycle.run(date(2024, 3, 4)).await.unwrap();

    // Untagged instances are never listed.
    assert_eq!(report.backup.instances.len(), 3);
    assert_eq!(report.backup.backed_up(), 2);
    assert_eq!(report.backup.failed(), 1);

    let Some(Err(BackupError::Config(err))) = report.backup.outcome("i-2") else {
        panic!("i-2 should fail with a configuration error");
    };
    assert_eq!(err.resource.id, "i-2");
    assert_eq!(err.raw, "7,4,5");

    // Instances run concurrently, so snapshot ids do not follow inventory order.
    let mut volumes: Vec<String> = cloud.snapshots().into_iter().map(|s| s.volume_id).collect();
    volumes.sort();
    assert_eq!(volumes, ["vol-1", "vol-3a", "vol-3b"]);
}

// =========================================================================
// Test 2: DeleteOn tag matches the scheduler's decision
// =========================================================================
#[tokio::test]
async fn test_delete_on_tag_matches_decision() {
    let (cloud, cycle) = setup(vec![instance("i-1", Some("1,1,1,1"), &["vol-1"])]);

    let report = cycle.run(date(2024, 1, 1)).await.unwrap();
    let Some(Ok(InstanceOutcome::BackedUp { tier, delete_on, snapshot_ids })) =
        report.backup.outcome("i-1")
    else {
        panic!("expected a backup on Jan 1");
    };
    assert_eq!(tier.as_str(), "yearly");
    assert_eq!(*delete_on, date(2025, 1, 1));

    let snapshot = cloud.snapshot(&snapshot_ids[0]).unwrap();
    assert_eq!(snapshot.tag(BACKUP_LABEL_TAG), Some("yearly"));
    assert_eq!(snapshot.tag(DELETE_ON_TAG), Some("2025-01-01"));
}

// =========================================================================
// Test 3: a daily backup disappears exactly on its expiration day
// =========================================================================
#[tokio::test]
async fn test_daily_backup_expires_on_schedule() {
    let (cloud, cycle) = setup(vec![instance("i-1", Some("3,0,0,0"), &["vol-1"])]);

    cycle.run(date(2024, 3, 4)).await.unwrap();
    let first = cloud.snapshots()[0].id.clone();

    for day in [date(2024, 3, 5), date(2024, 3, 6)] {
        let report = cycle.run(day).await.unwrap();
        assert!(report.sweep.deleted.is_empty(), "{day}");
        assert!(cloud.snapshot(&first).is_some());
    }

    let report = cycle.run(date(2024, 3, 7)).await.unwrap();
    assert_eq!(report.sweep.deleted, [first.clone()]);
    assert!(cloud.snapshot(&first).is_none());
    // A rolling window of three daily snapshots stays behind.
    assert_eq!(cloud.snapshots().len(), 3);
}

// =========================================================================
// Test 4: steady state of a daily+weekly policy over six weeks
// =========================================================================
#[tokio::test]
async fn test_rolling_window_steady_state() {
    let (cloud, cycle) = setup(vec![instance("i-1", Some("7,2,0,0"), &["vol-1"])]);

    // 2024-03-04 (Monday) through 2024-04-14 (Sunday); the only month start
    // in range is Apr 1, and monthly is disabled.
    let start = date(2024, 3, 4);
    for offset in 0..42 {
        let day = start.checked_add_days(Days::new(offset)).unwrap();
        cycle.run(day).await.unwrap();
    }

    let mut daily = 0;
    let mut weekly = 0;
    for s in cloud.snapshots() {
        match s.tag(BACKUP_LABEL_TAG) {
            Some("daily") => daily += 1,
            Some("weekly") => weekly += 1,
            other => panic!("unexpected label {other:?}"),
        }
    }
    // Dailies from Apr 8-13, weeklies from Apr 7 and Apr 14.
    assert_eq!(daily, 6);
    assert_eq!(weekly, 2);
}

// =========================================================================
// Test 5: failing volume is reported, other instances still backed up
// =========================================================================
#[tokio::test]
async fn test_cloud_failure_is_isolated() {
    let (cloud, cycle) = setup(vec![
        instance("i-1", Some("1,0,0,0"), &["vol-1"]),
        instance("i-2", Some("1,0,0,0"), &["vol-2"]),
    ]);
    cloud.fail_volume("vol-1");

    let report = cycle.run(date(2024, 3, 4)).await.unwrap();
    assert!(matches!(
        report.backup.outcome("i-1"),
        Some(Err(BackupError::Cloud { .. }))
    ));
    assert!(matches!(report.backup.outcome("i-2"), Some(Ok(_))));
    assert_eq!(cloud.snapshots().len(), 1);
}

// =========================================================================
// Test 6: consecutive runs against a state file
// =========================================================================
#[tokio::test]
async fn test_cycles_across_reopened_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let cloud = MemoryCloud::open(&path).unwrap();
        cloud
            .put_instance(instance("i-1", Some("1,0,0,0"), &["vol-1"]))
            .unwrap();
    }

    for day in [date(2024, 3, 4), date(2024, 3, 5)] {
        let cloud = Arc::new(MemoryCloud::open(&path).unwrap());
        let cycle = BackupCycle::new(cloud, Settings::default());
        cycle.run(day).await.unwrap();
    }

    // The Mar 4 snapshot expired on Mar 5; only the Mar 5 one is left.
    let cloud = MemoryCloud::open(&path).unwrap();
    let snapshots = cloud.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].tag(DELETE_ON_TAG), Some("2024-03-06"));
}
