//! End-to-end driver behaviour against the in-process array

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;

use storage_array_driver::array::{NARROW_EXTENT_POOL, SECONDARY_POOL};
use storage_array_driver::{
    ArrayCommand, ArrayDriver, ArrayGateway, ArraySimulator, ConnectionInfo, Connector,
    DriverConfig, Error, ErrorAction, Fault, MemoryCatalog, MigrationHint, ObjectKind, PollPolicy,
    SnapshotSpec, VolumeCatalog, VolumeSpec,
};

const SYSTEM_ID: &str = "0123456789ABCDEF";

fn test_config() -> DriverConfig {
    DriverConfig {
        san_ip: "192.0.2.10".into(),
        san_password: Some("secret".into()),
        flashcopy_poll_interval_ms: 1,
        ..Default::default()
    }
}

fn driver_for(config: DriverConfig, sim: &Arc<ArraySimulator>) -> ArrayDriver {
    ArrayDriver::new(config, sim.clone(), Arc::new(MemoryCatalog::new()))
        .with_poll_policy(PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(2)))
}

async fn setup() -> (ArrayDriver, Arc<ArraySimulator>) {
    let sim = Arc::new(ArraySimulator::new("volpool"));
    let driver = driver_for(test_config(), &sim);
    driver.do_setup().await.unwrap();
    driver.check_for_setup_error().await.unwrap();
    (driver, sim)
}

fn snapshot_of(volume: &VolumeSpec, name: &str) -> SnapshotSpec {
    SnapshotSpec {
        id: format!("snap-{}", name),
        name: name.to_string(),
        volume_name: volume.name.clone(),
        volume_size_gb: volume.size_gb,
    }
}

fn location(pool: &str) -> Option<String> {
    Some(format!("ArrayDriver:{}:{}", SYSTEM_ID, pool))
}

// =============================================================================
// Setup
// =============================================================================

#[tokio::test]
async fn test_unreachable_array_is_retryable() {
    let sim = Arc::new(ArraySimulator::new("volpool"));
    let driver = driver_for(test_config(), &sim);

    sim.inject("lssystem", Fault::Unreachable);
    let err = driver.do_setup().await.unwrap_err();
    assert_matches!(err, Error::CommandExecution { exit_code: 255, .. });
    assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

    driver.do_setup().await.unwrap();
    assert_eq!(driver.profile().unwrap().system_id, SYSTEM_ID);
}

#[tokio::test]
async fn test_missing_pool_fails_setup() {
    let sim = Arc::new(ArraySimulator::new("volpool"));
    let config = DriverConfig {
        volpool_name: "nosuchpool".into(),
        ..test_config()
    };
    let driver = driver_for(config, &sim);
    assert_matches!(driver.do_setup().await, Err(Error::InvalidInput(_)));
}

#[test]
fn test_simulator_answers_without_a_runtime() {
    let sim = ArraySimulator::new("volpool");
    let output = tokio_test::block_on(sim.execute(&ArrayCommand::ShowSystem)).unwrap();
    assert!(output.is_clean());
    assert!(output.stdout.contains(SYSTEM_ID));
}

// =============================================================================
// Volume lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_then_read_back() {
    let (driver, _sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 10);
    driver.create_volume(&volume).await.unwrap();

    let attrs = driver.get_volume_attributes("vol").await.unwrap().unwrap();
    assert_eq!(attrs.require_u64("capacity", "lsvdisk").unwrap(), 10 * 1024 * 1024 * 1024);
    assert_eq!(attrs.get("mdisk_grp_name"), Some("volpool"));

    let err = driver.create_volume(&volume).await.unwrap_err();
    assert_matches!(
        err,
        Error::AlreadyExists { kind: ObjectKind::Volume, ref name } if name == "vol"
    );
}

#[tokio::test]
async fn test_delete_missing_volume_is_ok() {
    let (driver, sim) = setup().await;
    driver.delete_volume("never-created").await.unwrap();
    assert_eq!(sim.issued("rmvdisk"), 0);
}

#[tokio::test]
async fn test_compression_without_license() {
    let sim = Arc::new(ArraySimulator::new("volpool"));
    sim.modify(|m| m.compression_licensed = false);
    let driver = driver_for(test_config(), &sim);
    driver.do_setup().await.unwrap();

    let volume = VolumeSpec::new("1", "vol", 1).with_option("drivers:compression", "true");
    assert_matches!(driver.create_volume(&volume).await, Err(Error::InvalidInput(_)));
    assert_eq!(sim.issued("mkvdisk"), 0);
    assert!(!driver.get_volume_stats(true).await.unwrap().compression_support);
}

#[tokio::test]
async fn test_extend_blocked_by_snapshot() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    let snapshot = snapshot_of(&volume, "vol-snap");
    driver.create_snapshot(&snapshot).await.unwrap();

    let err = driver.extend_volume(&volume, 2).await.unwrap_err();
    assert_matches!(err, Error::BackendApi { .. });
    assert_eq!(sim.issued("expandvdisksize"), 0);

    driver.delete_snapshot(&snapshot).await.unwrap();
    driver.extend_volume(&volume, 2).await.unwrap();
    let attrs = driver.get_volume_attributes("vol").await.unwrap().unwrap();
    assert_eq!(attrs.require_u64("capacity", "lsvdisk").unwrap(), 2 * 1024 * 1024 * 1024);
}

#[tokio::test]
async fn test_mapped_volume_cannot_be_deleted() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    driver
        .initialize_connection(&volume, &Connector::iscsi("h", "iqn.test:h"))
        .await
        .unwrap();

    let err = driver.delete_volume("vol").await.unwrap_err();
    assert_matches!(err, Error::InUse { .. });
    assert!(sim.inspect(|m| m.volumes.contains_key("vol")));
}

// =============================================================================
// Snapshots and clones
// =============================================================================

#[tokio::test]
async fn test_failed_start_leaves_no_target() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();

    sim.inject("startfcmap", Fault::BadId);
    let err = driver.create_snapshot(&snapshot_of(&volume, "vol-snap")).await.unwrap_err();
    assert_matches!(err, Error::NotFound { kind: ObjectKind::PitMapping, .. });

    assert!(!driver.volume_exists("vol-snap").await.unwrap());
    assert!(sim.inspect(|m| m.pit_mappings.is_empty()));
    assert!(driver.volume_exists("vol").await.unwrap());
}

#[tokio::test]
async fn test_clone_chain_through_snapshot() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 2);
    driver.create_volume(&volume).await.unwrap();
    let snapshot = snapshot_of(&volume, "vol-snap");
    driver.create_snapshot(&snapshot).await.unwrap();

    let restored = VolumeSpec::new("2", "restored", 2);
    driver.create_volume_from_snapshot(&restored, &snapshot).await.unwrap();
    let clone = VolumeSpec::new("3", "cloned", 2);
    driver.create_cloned_volume(&clone, "restored").await.unwrap();

    // Only the snapshot keeps its mapping
    assert_eq!(sim.inspect(|m| m.pit_mappings.len()), 1);
    for name in ["restored", "cloned"] {
        assert!(driver.volume_exists(name).await.unwrap());
    }

    let wrong_size = VolumeSpec::new("4", "bigger", 3);
    assert_matches!(
        driver.create_cloned_volume(&wrong_size, "vol").await,
        Err(Error::InvalidInput(_))
    );
    assert!(!driver.volume_exists("bigger").await.unwrap());

    // Deleting the source drains the snapshot's mapping first
    driver.delete_volume("vol").await.unwrap();
    assert!(sim.inspect(|m| m.pit_mappings.is_empty()));
    assert!(driver.volume_exists("vol-snap").await.unwrap());
}

// =============================================================================
// Connections
// =============================================================================

#[tokio::test]
async fn test_repeated_attach_reuses_host() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    let connector = Connector::iscsi("compute-1", "iqn.test:compute-1");

    let first = driver.initialize_connection(&volume, &connector).await.unwrap();
    let second = driver.initialize_connection(&volume, &connector).await.unwrap();
    assert_eq!(first.lun(), second.lun());
    assert_eq!(sim.issued("mkhost"), 1);
    assert_eq!(sim.issued("mkvdiskhostmap"), 1);
    assert_eq!(sim.inspect(|m| m.hosts.len()), 1);
}

#[tokio::test]
async fn test_detach_deletes_unused_host() {
    let (driver, sim) = setup().await;
    let connector = Connector::iscsi("compute-1", "iqn.test:compute-1");
    for (id, name) in [("1", "vol1"), ("2", "vol2")] {
        let volume = VolumeSpec::new(id, name, 1);
        driver.create_volume(&volume).await.unwrap();
        driver.initialize_connection(&volume, &connector).await.unwrap();
    }

    driver.terminate_connection("vol1", &connector).await.unwrap();
    assert_eq!(sim.inspect(|m| m.hosts.len()), 1);

    driver.terminate_connection("vol2", &connector).await.unwrap();
    assert!(sim.inspect(|m| m.hosts.is_empty() && m.host_mappings.is_empty()));

    // Detaching again finds nothing to do
    driver.terminate_connection("vol2", &connector).await.unwrap();
}

#[tokio::test]
async fn test_detach_with_unknown_connector() {
    let (driver, _sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    let stranger = Connector::iscsi("stranger", "iqn.test:stranger");

    driver.terminate_connection("vol", &stranger).await.unwrap();

    driver
        .initialize_connection(&volume, &Connector::iscsi("owner", "iqn.test:owner"))
        .await
        .unwrap();
    let err = driver.terminate_connection("vol", &stranger).await.unwrap_err();
    assert_matches!(err, Error::BackendApi { .. });
}

#[tokio::test]
async fn test_detach_without_host_name_unmaps_everywhere() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    for host in ["a", "b"] {
        let connector = Connector::iscsi(host, format!("iqn.test:{}", host));
        driver.initialize_connection(&volume, &connector).await.unwrap();
    }
    assert_eq!(sim.inspect(|m| m.mappings_of_volume("vol").count()), 2);

    let anonymous = Connector {
        initiator: Some("iqn.test:a".into()),
        ..Default::default()
    };
    driver.terminate_connection("vol", &anonymous).await.unwrap();
    assert!(sim.inspect(|m| m.host_mappings.is_empty() && m.hosts.is_empty()));
}

#[tokio::test]
async fn test_multihost_mapping_follows_config() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();
    driver
        .initialize_connection(&volume, &Connector::iscsi("a", "iqn.test:a"))
        .await
        .unwrap();

    let strict = driver_for(
        DriverConfig {
            multihostmap_enabled: false,
            ..test_config()
        },
        &sim,
    );
    strict.do_setup().await.unwrap();
    let err = strict
        .initialize_connection(&volume, &Connector::iscsi("b", "iqn.test:b"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::InUse { kind: ObjectKind::Volume, .. });
    assert_eq!(sim.inspect(|m| m.mappings_of_volume("vol").count()), 1);
    // The host registered for the refused attach is gone again
    sim.inspect(|m| {
        assert_eq!(m.hosts.len(), 1);
        assert!(m.hosts.keys().all(|h| m.mappings_of_host(h).count() > 0));
    });

    driver
        .initialize_connection(&volume, &Connector::iscsi("b", "iqn.test:b"))
        .await
        .unwrap();
    assert_eq!(sim.inspect(|m| m.mappings_of_volume("vol").count()), 2);
}

#[tokio::test]
async fn test_fibre_channel_targets() {
    let (driver, _sim) = setup().await;
    let connector = Connector::fibre_channel(
        "fc-host",
        vec!["21000024ff000001".into(), "21000024ff000002".into()],
    );

    let single = VolumeSpec::new("1", "vol1", 1).with_option("drivers:protocol", "FC");
    driver.create_volume(&single).await.unwrap();
    let info = driver.initialize_connection(&single, &connector).await.unwrap();
    let ConnectionInfo::FibreChannel(target) = info else {
        panic!("expected a Fibre Channel target");
    };
    assert_eq!(target.target_wwn, vec!["500507680210C744".to_string()]);
    assert_eq!(target.target_lun, 0);

    let multi = VolumeSpec::new("2", "vol2", 1)
        .with_option("drivers:protocol", "FC")
        .with_option("drivers:multipath", "true");
    driver.create_volume(&multi).await.unwrap();
    let info = driver.initialize_connection(&multi, &connector).await.unwrap();
    let ConnectionInfo::FibreChannel(target) = info else {
        panic!("expected a Fibre Channel target");
    };
    assert_eq!(target.target_wwn.len(), 2);
    assert!(target.target_wwn.contains(&"500507680220C745".to_string()));
    assert_eq!(target.target_lun, 1);
}

#[tokio::test]
async fn test_corrupt_fabric_listing_rolls_back() {
    let (driver, sim) = setup().await;
    let connector = Connector::fibre_channel("fc-host", vec!["21000024ff000001".into()]);
    let first = VolumeSpec::new("1", "vol1", 1).with_option("drivers:protocol", "FC");
    let second = VolumeSpec::new("2", "vol2", 1).with_option("drivers:protocol", "FC");
    for volume in [&first, &second] {
        driver.create_volume(volume).await.unwrap();
    }
    driver.initialize_connection(&first, &connector).await.unwrap();

    sim.inject("lsfabric", Fault::HeaderMismatch);
    let err = driver.initialize_connection(&second, &connector).await.unwrap_err();
    assert_matches!(err, Error::MalformedResponse { .. });

    // The host keeps its first volume, the failed map is gone
    assert_eq!(sim.inspect(|m| m.mappings_of_volume("vol2").count()), 0);
    assert_eq!(sim.inspect(|m| m.mappings_of_volume("vol1").count()), 1);
    assert_eq!(sim.inspect(|m| m.hosts.len()), 1);
}

// =============================================================================
// Migration
// =============================================================================

#[tokio::test]
async fn test_foreign_destination_is_not_moved() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();

    let hints = [
        MigrationHint::default(),
        MigrationHint {
            location_info: Some("OtherDriver:xyz:silver".into()),
            extent_size: Some(256),
        },
        MigrationHint {
            location_info: Some(format!("ArrayDriver:FEDCBA9876543210:{}", SECONDARY_POOL)),
            extent_size: Some(256),
        },
        MigrationHint {
            location_info: location(SECONDARY_POOL),
            extent_size: None,
        },
        MigrationHint {
            location_info: location("volpool"),
            extent_size: Some(256),
        },
    ];
    for hint in &hints {
        let outcome = driver.migrate_volume(&volume, hint).await.unwrap();
        assert!(!outcome.moved, "{:?} moved the volume", hint);
        assert!(outcome.model_update.is_none());
    }
    assert_eq!(sim.issued("migratevdisk") + sim.issued("addvdiskcopy"), 0);
}

#[tokio::test]
async fn test_migrate_between_equal_extents() {
    let sim = Arc::new(ArraySimulator::new("volpool"));
    let catalog = Arc::new(MemoryCatalog::new());
    let driver = ArrayDriver::new(test_config(), sim.clone(), catalog.clone())
        .with_poll_policy(PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(2)));
    driver.do_setup().await.unwrap();
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();

    let hint = MigrationHint {
        location_info: location(SECONDARY_POOL),
        extent_size: Some(256),
    };
    let outcome = driver.migrate_volume(&volume, &hint).await.unwrap();
    assert!(outcome.moved);
    assert_eq!(outcome.model_update.unwrap().pool, SECONDARY_POOL);
    assert_eq!(sim.issued("migratevdisk"), 1);
    assert_eq!(sim.inspect(|m| m.volumes["vol"].pool().to_string()), SECONDARY_POOL);

    let record = catalog.get_volume("1").await.unwrap().unwrap();
    assert_eq!(record.pool.as_deref(), Some(SECONDARY_POOL));
}

#[tokio::test]
async fn test_migrate_across_extent_sizes() {
    let (driver, sim) = setup().await;
    let volume = VolumeSpec::new("1", "vol", 1);
    driver.create_volume(&volume).await.unwrap();

    let hint = MigrationHint {
        location_info: location(NARROW_EXTENT_POOL),
        extent_size: Some(128),
    };
    let outcome = driver.migrate_volume(&volume, &hint).await.unwrap();
    assert!(outcome.moved);
    assert_eq!(sim.issued("migratevdisk"), 0);
    assert_eq!(sim.issued("addvdiskcopy"), 1);
    assert_eq!(sim.issued("rmvdiskcopy"), 1);
    sim.inspect(|m| {
        let vol = &m.volumes["vol"];
        assert_eq!(vol.copies.len(), 1);
        assert_eq!(vol.pool(), NARROW_EXTENT_POOL);
    });
}

// =============================================================================
// Capacity report
// =============================================================================

#[tokio::test]
async fn test_free_never_exceeds_total() {
    let (driver, sim) = setup().await;
    for base_used in [0, 1 << 40, u64::MAX / 2] {
        sim.modify(|m| {
            if let Some(pool) = m.pools.get_mut("volpool") {
                pool.base_used = base_used;
            }
        });
        let stats = driver.get_volume_stats(true).await.unwrap();
        assert!(stats.free_capacity_gb <= stats.total_capacity_gb);
        assert!(stats.free_capacity_gb >= 0.0);
    }
}

#[tokio::test]
async fn test_stats_shrink_as_volumes_grow() {
    let (driver, _sim) = setup().await;
    let before = driver.get_volume_stats(true).await.unwrap();
    driver
        .create_volume(&VolumeSpec::new("1", "thick", 100).with_option("drivers:rsize", "-1"))
        .await
        .unwrap();
    let after = driver.get_volume_stats(true).await.unwrap();
    assert_eq!(before.total_capacity_gb, after.total_capacity_gb);
    assert_eq!(before.free_capacity_gb - after.free_capacity_gb, 100.0);
}
