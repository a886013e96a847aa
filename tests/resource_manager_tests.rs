//! Primary/secondary resource lifecycle tests
//!
//! Both managers run in one process over a shared temp directory, which is
//! exactly the name-addressed contract: two handle tables agreeing on the
//! same backing files.

use iqflow::{
    Config, PacketPool, PoolSpec, PrimaryManager, RingSpec, Role, RuntimeConfig,
    SecondaryManager, ShmRing, StreamSpec, TransportError,
};
use tempfile::TempDir;

fn runtime(dir: &TempDir, prefix: &str) -> RuntimeConfig {
    RuntimeConfig {
        file_prefix: prefix.to_string(),
        huge_dir: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    }
}

fn ring_specs(names: &[&str], capacity: u32) -> Vec<RingSpec> {
    names
        .iter()
        .map(|n| RingSpec {
            name: n.to_string(),
            capacity,
        })
        .collect()
}

fn primary_config(dir: &TempDir) -> Config {
    let mut cfg = Config::for_role(Role::PrimaryTxSide, runtime(dir, "rm"));
    let block = cfg.role_block_mut(Role::PrimaryTxSide);
    block.pools.push(PoolSpec {
        name: "pool0".into(),
        capacity: 32,
        elt_bytes: 2048,
        cache: 0,
    });
    block.tx_stream = Some(StreamSpec {
        num_channels: 2,
        rings: ring_specs(&["tx0", "tx1"], 128),
        ..Default::default()
    });
    block.rx_stream = Some(StreamSpec {
        rings: ring_specs(&["inbound"], 256),
        ..Default::default()
    });
    cfg
}

fn secondary_config(dir: &TempDir) -> Config {
    let mut cfg = Config::for_role(Role::Tx, runtime(dir, "rm"));
    let block = cfg.role_block_mut(Role::Tx);
    block.pools.push(PoolSpec {
        name: "pool0".into(),
        capacity: 32,
        elt_bytes: 2048,
        cache: 0,
    });
    block.tx_stream = Some(StreamSpec {
        num_channels: 2,
        rings: ring_specs(&["tx0", "tx1"], 128),
        ..Default::default()
    });
    block.rx_stream = Some(StreamSpec {
        rings: ring_specs(&["inbound"], 256),
        ..Default::default()
    });
    cfg
}

#[test]
fn test_every_declared_ring_reachable_with_spec_capacity() {
    let dir = TempDir::new().unwrap();
    let mut primary = PrimaryManager::new(primary_config(&dir)).unwrap();
    primary.init_resources().unwrap();

    assert_eq!(primary.created_or_found_rings().len(), 3);

    let loc = primary.locator().clone();
    for (name, capacity) in [("tx0", 128u32), ("tx1", 128), ("inbound", 256)] {
        let ring = ShmRing::attach(&loc, name).unwrap();
        assert_eq!(ring.capacity(), capacity, "ring {name}");
    }
    let pool = PacketPool::attach(&loc, "pool0").unwrap();
    assert_eq!(pool.capacity(), 32);
    assert_eq!(pool.elt_bytes(), 2048);
}

#[test]
fn test_secondary_resolves_every_declared_name() {
    let dir = TempDir::new().unwrap();
    let mut primary = PrimaryManager::new(primary_config(&dir)).unwrap();
    primary.init_resources().unwrap();

    let mut secondary = SecondaryManager::new(secondary_config(&dir)).unwrap();
    secondary.init_resources().unwrap();

    assert_eq!(secondary.num_pools(), 1);
    assert_eq!(secondary.num_tx_queues(), 2);
    assert_eq!(secondary.num_rx_queues(), 1);
    assert!(secondary.pool_for_queue(0).is_some());
    assert!(secondary.tx_ring_for_queue(1).is_some());
    assert!(secondary.tx_ring_for_queue(2).is_none());
}

#[test]
fn test_secondary_without_primary_fails_not_found() {
    let dir = TempDir::new().unwrap();
    let mut secondary = SecondaryManager::new(secondary_config(&dir)).unwrap();
    let err = secondary.init_resources().unwrap_err();
    assert!(matches!(err, TransportError::NotFound { .. }));
}

#[test]
fn test_recreation_with_identical_spec_is_reuse() {
    let dir = TempDir::new().unwrap();
    let mut first = PrimaryManager::new(primary_config(&dir)).unwrap();
    first.init_resources().unwrap();

    // a second primary-side manager over the same segment finds every
    // object instead of failing
    let mut second = PrimaryManager::new(primary_config(&dir)).unwrap();
    second.init_resources().unwrap();
    assert_eq!(second.created_or_found_rings().len(), 3);
    assert_eq!(second.created_or_found_pools().len(), 1);
}

#[test]
fn test_recreation_with_conflicting_capacity_fails() {
    let dir = TempDir::new().unwrap();
    let mut first = PrimaryManager::new(primary_config(&dir)).unwrap();
    first.init_resources().unwrap();

    let mut cfg = primary_config(&dir);
    cfg.role_block_mut(Role::PrimaryTxSide)
        .tx_stream
        .as_mut()
        .unwrap()
        .rings[0]
        .capacity = 64;
    let mut conflicting = PrimaryManager::new(cfg).unwrap();
    let err = conflicting.init_resources().unwrap_err();
    assert!(matches!(err, TransportError::RingConflict { .. }));
}

#[test]
fn test_pool_conflict_detected() {
    let dir = TempDir::new().unwrap();
    let mut first = PrimaryManager::new(primary_config(&dir)).unwrap();
    first.init_resources().unwrap();

    let mut cfg = primary_config(&dir);
    cfg.role_block_mut(Role::PrimaryTxSide).pools[0].elt_bytes = 4096;
    let mut conflicting = PrimaryManager::new(cfg).unwrap();
    let err = conflicting.init_resources().unwrap_err();
    assert!(matches!(err, TransportError::PoolConflict { .. }));
}

#[test]
fn test_role_prefixed_segment_names() {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::for_role(Role::PrimaryTxSide, runtime(&dir, "pfx"));
    cfg.naming.prefix_with_role = true;
    cfg.role_block_mut(Role::PrimaryTxSide).tx_stream = Some(StreamSpec {
        rings: ring_specs(&["out"], 64),
        ..Default::default()
    });
    let mut primary = PrimaryManager::new(cfg).unwrap();
    primary.init_resources().unwrap();

    assert_eq!(
        primary.created_or_found_rings(),
        &["primary_tx_out".to_string()]
    );
    assert!(dir.path().join("pfx_primary_tx_out").exists());
}

#[test]
fn test_primary_teardown_removes_segment() {
    let dir = TempDir::new().unwrap();
    {
        let mut primary = PrimaryManager::new(primary_config(&dir)).unwrap();
        primary.init_resources().unwrap();
        assert!(dir.path().join("rm_tx0").exists());
    }
    // objects live for the lifetime of the primary
    assert!(!dir.path().join("rm_tx0").exists());
    assert!(!dir.path().join("rm_pool0").exists());
}

#[test]
fn test_interconnect_pair_between_primaries() {
    use iqflow::{IcDirection, IcRingSpec, InterconnectSpec};
    let dir = TempDir::new().unwrap();

    let ic_rings = vec![
        IcRingSpec {
            name: "a_to_b".into(),
            capacity: 64,
            direction: IcDirection::Outbound,
        },
        IcRingSpec {
            name: "b_to_a".into(),
            capacity: 64,
            direction: IcDirection::Inbound,
        },
    ];

    let mut creator_cfg = Config::for_role(Role::PrimaryTxSide, runtime(&dir, "ic"));
    creator_cfg.role_block_mut(Role::PrimaryTxSide).interconnect = Some(InterconnectSpec {
        rings: ic_rings.clone(),
        creator: true,
        pool: None,
    });
    let mut creator = PrimaryManager::new(creator_cfg).unwrap();
    creator.init_resources().unwrap();
    assert_eq!(creator.ic_rings().len(), 2);

    // the peer primary attaches to the same pair
    let mut attacher_cfg = Config::for_role(Role::PrimaryRxSide, runtime(&dir, "ic"));
    attacher_cfg.role_block_mut(Role::PrimaryRxSide).interconnect = Some(InterconnectSpec {
        rings: ic_rings,
        creator: false,
        pool: None,
    });
    let mut attacher = PrimaryManager::new(attacher_cfg).unwrap();
    attacher.init_resources().unwrap();
    assert_eq!(attacher.ic_rings().len(), 2);

    // traffic flows across the two handle tables
    creator.ic_rings()[0].enqueue(9).unwrap();
    assert_eq!(attacher.ic_rings()[0].dequeue().unwrap(), 9);
}
