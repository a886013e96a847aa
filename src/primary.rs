//! Primary-side resource manager
//!
//! The primary creates every pool and ring its role block declares and owns
//! their lifetime: handle tables here keep the backing regions alive, and
//! dropping the manager tears the segment down. Creation is
//! create-or-found: an object that already exists under the same name is
//! attached and re-checked against the requested geometry instead of
//! failing, so a restarted primary converges on the same segment.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::conf::{Config, IcRingSpec, PoolSpec, RingSpec};
use crate::error::{Result, TransportError};
use crate::memory::SegmentLocator;
use crate::names::NamePolicy;
use crate::pool::PacketPool;
use crate::ring::ShmRing;

/// Create-or-lookup manager for the primary roles
#[derive(Debug)]
pub struct PrimaryManager {
    config: Config,
    policy: NamePolicy,
    locator: SegmentLocator,

    pools: Vec<Arc<PacketPool>>,
    tx_rings: Vec<Arc<ShmRing>>,
    rx_rings: Vec<Arc<ShmRing>>,
    ic_rings: Vec<Arc<ShmRing>>,

    pools_by_name: HashMap<String, Arc<PacketPool>>,
    rings_by_name: HashMap<String, Arc<ShmRing>>,

    pool_names: Vec<String>,
    ring_names: Vec<String>,
}

impl PrimaryManager {
    /// Build a manager for a primary-role config. Non-primary roles are a
    /// caller error; they must use the secondary manager.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if !config.role.is_primary() {
            return Err(TransportError::config(format!(
                "role '{}' may not create shared objects",
                config.role
            )));
        }
        let policy = NamePolicy::from(&config.naming);
        let locator = SegmentLocator::new(&config.runtime.huge_dir, &config.runtime.file_prefix);
        Ok(Self {
            config,
            policy,
            locator,
            pools: Vec::new(),
            tx_rings: Vec::new(),
            rx_rings: Vec::new(),
            ic_rings: Vec::new(),
            pools_by_name: HashMap::new(),
            rings_by_name: HashMap::new(),
            pool_names: Vec::new(),
            ring_names: Vec::new(),
        })
    }

    /// Create (or find pre-existing) a packet buffer pool
    pub fn create_pool(&mut self, spec: &PoolSpec) -> Result<Arc<PacketPool>> {
        let name = self
            .policy
            .materialize_checked(self.config.role, &spec.name)?;
        if let Some(existing) = self.pools_by_name.get(&name) {
            return Ok(Arc::clone(existing));
        }

        let cache = self.config.pool_cache(spec);
        let pool = match PacketPool::create(&self.locator, &name, spec.capacity, spec.elt_bytes, cache)
        {
            Ok(pool) => {
                info!("pool created: {} ({}x{}B)", name, spec.capacity, spec.elt_bytes);
                pool
            }
            Err(TransportError::Io { source, .. })
                if source
                    .as_ref()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::AlreadyExists) =>
            {
                let found = PacketPool::attach(&self.locator, &name).map_err(|_| {
                    TransportError::pool_create(&name, "exists but not attachable")
                })?;
                check_pool_spec(&name, &found, spec)?;
                info!("pool found: {}", name);
                found
            }
            Err(TransportError::Io { message, .. }) => {
                return Err(TransportError::pool_create(&name, message));
            }
            Err(other) => return Err(other),
        };

        self.pool_names.push(name.clone());
        self.pools_by_name.insert(name, Arc::clone(&pool));
        self.pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Create (or find pre-existing) a single-producer single-consumer ring
    pub fn create_ring(&mut self, spec: &RingSpec) -> Result<Arc<ShmRing>> {
        let name = self
            .policy
            .materialize_checked(self.config.role, &spec.name)?;
        if let Some(existing) = self.rings_by_name.get(&name) {
            if existing.capacity() != spec.capacity {
                return Err(TransportError::RingConflict {
                    name,
                    expected: spec.capacity,
                    actual: existing.capacity(),
                });
            }
            return Ok(Arc::clone(existing));
        }

        let ring = match ShmRing::create(&self.locator, &name, spec.capacity) {
            Ok(ring) => {
                info!("ring created: {} (depth {})", name, spec.capacity);
                ring
            }
            Err(TransportError::Io { source, .. })
                if source
                    .as_ref()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::AlreadyExists) =>
            {
                let found = ShmRing::attach(&self.locator, &name)
                    .map_err(|_| TransportError::ring_create(&name))?;
                if found.capacity() != spec.capacity {
                    return Err(TransportError::RingConflict {
                        name,
                        expected: spec.capacity,
                        actual: found.capacity(),
                    });
                }
                info!("ring found: {}", name);
                found
            }
            Err(TransportError::Io { .. }) => {
                return Err(TransportError::ring_create(&name));
            }
            Err(other) => return Err(other),
        };

        self.ring_names.push(name.clone());
        self.rings_by_name.insert(name, Arc::clone(&ring));
        Ok(ring)
    }

    /// Create everything the role block declares: pools, then TX rings,
    /// then RX rings, then the interconnect. The first pool/ring error
    /// short-circuits; interconnect trouble is reported but non-fatal so a
    /// primary can come up without its peer.
    pub fn init_resources(&mut self) -> Result<()> {
        self.pools.clear();
        self.tx_rings.clear();
        self.rx_rings.clear();
        self.ic_rings.clear();
        self.pools_by_name.clear();
        self.rings_by_name.clear();
        self.pool_names.clear();
        self.ring_names.clear();

        for spec in self.config.pools().to_vec() {
            self.create_pool(&spec)?;
        }

        let tx_specs: Vec<RingSpec> = self
            .config
            .tx_stream()
            .map(|s| s.rings.clone())
            .unwrap_or_default();
        for spec in &tx_specs {
            let ring = self.create_ring(spec)?;
            self.tx_rings.push(ring);
        }

        let rx_specs: Vec<RingSpec> = self
            .config
            .rx_stream()
            .map(|s| s.rings.clone())
            .unwrap_or_default();
        for spec in &rx_specs {
            let ring = self.create_ring(spec)?;
            self.rx_rings.push(ring);
        }

        self.init_interconnect();

        info!(
            "primary {} initialized: {} pools, {} tx rings, {} rx rings, {} ic rings",
            self.config.role,
            self.pools.len(),
            self.tx_rings.len(),
            self.rx_rings.len(),
            self.ic_rings.len()
        );
        Ok(())
    }

    fn init_interconnect(&mut self) {
        let Some(ic) = self.config.interconnect().cloned() else {
            return;
        };

        if ic.creator {
            if let Some(pool_spec) = &ic.pool {
                if let Err(e) = self.create_pool(pool_spec) {
                    warn!("interconnect pool '{}' skipped: {}", pool_spec.name, e);
                }
            }
        }

        for spec in &ic.rings {
            match self.interconnect_ring(&ic, spec) {
                Ok(ring) => self.ic_rings.push(ring),
                Err(e) => warn!("interconnect ring '{}' skipped: {}", spec.name, e),
            }
        }
    }

    fn interconnect_ring(
        &mut self,
        ic: &crate::conf::InterconnectSpec,
        spec: &IcRingSpec,
    ) -> Result<Arc<ShmRing>> {
        if ic.creator {
            self.create_ring(&RingSpec {
                name: spec.name.clone(),
                capacity: spec.capacity,
            })
        } else {
            // the peer primary created this pair; attach by name
            let name = self
                .policy
                .materialize_checked(self.config.role, &spec.name)?;
            let ring = ShmRing::attach(&self.locator, &name)?;
            self.ring_names.push(name.clone());
            self.rings_by_name.insert(name, Arc::clone(&ring));
            Ok(ring)
        }
    }

    /// Ordered materialized pool names, for observability
    pub fn created_or_found_pools(&self) -> &[String] {
        &self.pool_names
    }

    /// Ordered materialized ring names, for observability
    pub fn created_or_found_rings(&self) -> &[String] {
        &self.ring_names
    }

    pub fn pools(&self) -> &[Arc<PacketPool>] {
        &self.pools
    }

    pub fn tx_rings(&self) -> &[Arc<ShmRing>] {
        &self.tx_rings
    }

    pub fn rx_rings(&self) -> &[Arc<ShmRing>] {
        &self.rx_rings
    }

    pub fn ic_rings(&self) -> &[Arc<ShmRing>] {
        &self.ic_rings
    }

    /// Handle-table lookup by materialized name
    pub fn pool(&self, name: &str) -> Option<&Arc<PacketPool>> {
        self.pools_by_name.get(name)
    }

    /// Handle-table lookup by materialized name
    pub fn ring(&self, name: &str) -> Option<&Arc<ShmRing>> {
        self.rings_by_name.get(name)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locator(&self) -> &SegmentLocator {
        &self.locator
    }
}

fn check_pool_spec(name: &str, found: &PacketPool, spec: &PoolSpec) -> Result<()> {
    if found.capacity() != spec.capacity {
        return Err(TransportError::PoolConflict {
            name: name.to_string(),
            field: "capacity",
            expected: spec.capacity,
            actual: found.capacity(),
        });
    }
    if found.elt_bytes() != spec.elt_bytes {
        return Err(TransportError::PoolConflict {
            name: name.to_string(),
            field: "elt_bytes",
            expected: spec.elt_bytes,
            actual: found.elt_bytes(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{Role, RuntimeConfig, StreamSpec};
    use tempfile::TempDir;

    fn config(dir: &TempDir, role: Role) -> Config {
        Config::for_role(
            role,
            RuntimeConfig {
                file_prefix: "prim".to_string(),
                huge_dir: dir.path().to_string_lossy().into_owned(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_non_primary_role_rejected() {
        let dir = TempDir::new().unwrap();
        let err = PrimaryManager::new(config(&dir, Role::Tx)).unwrap_err();
        assert!(matches!(err, TransportError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_create_pool_and_recreate_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut mgr = PrimaryManager::new(config(&dir, Role::PrimaryTxSide)).unwrap();
        let spec = PoolSpec {
            name: "outbound_pool".into(),
            capacity: 8,
            elt_bytes: 1024,
            cache: 0,
        };
        let first = mgr.create_pool(&spec).unwrap();
        let second = mgr.create_pool(&spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mgr.created_or_found_pools(), &["outbound_pool".to_string()]);
    }

    #[test]
    fn test_ring_conflict_detected() {
        let dir = TempDir::new().unwrap();
        let mut mgr = PrimaryManager::new(config(&dir, Role::PrimaryTxSide)).unwrap();
        mgr.create_ring(&RingSpec {
            name: "tx0".into(),
            capacity: 64,
        })
        .unwrap();

        let err = mgr
            .create_ring(&RingSpec {
                name: "tx0".into(),
                capacity: 128,
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::RingConflict { .. }));
    }

    #[test]
    fn test_init_resources_order_and_lists() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, Role::PrimaryRxSide);
        let block = cfg.role_block_mut(Role::PrimaryRxSide);
        block.pools.push(PoolSpec {
            name: "inbound_pool".into(),
            capacity: 16,
            elt_bytes: 2048,
            cache: 0,
        });
        block.tx_stream = Some(StreamSpec {
            rings: vec![RingSpec {
                name: "tx0".into(),
                capacity: 32,
            }],
            ..Default::default()
        });
        block.rx_stream = Some(StreamSpec {
            rings: vec![
                RingSpec {
                    name: "rx0".into(),
                    capacity: 32,
                },
                RingSpec {
                    name: "rx1".into(),
                    capacity: 32,
                },
            ],
            num_channels: 2,
            ..Default::default()
        });

        let mut mgr = PrimaryManager::new(cfg).unwrap();
        mgr.init_resources().unwrap();

        assert_eq!(mgr.pools().len(), 1);
        assert_eq!(mgr.tx_rings().len(), 1);
        assert_eq!(mgr.rx_rings().len(), 2);
        assert_eq!(
            mgr.created_or_found_rings(),
            &["tx0".to_string(), "rx0".to_string(), "rx1".to_string()]
        );
        assert!(mgr.ring("tx0").is_some());
        assert!(mgr.pool("inbound_pool").is_some());
    }

    #[test]
    fn test_missing_interconnect_peer_is_nonfatal() {
        use crate::conf::{IcDirection, InterconnectSpec};
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, Role::PrimaryTxSide);
        cfg.role_block_mut(Role::PrimaryTxSide).interconnect = Some(InterconnectSpec {
            rings: vec![IcRingSpec {
                name: "peer_to_us".into(),
                capacity: 64,
                direction: IcDirection::Inbound,
            }],
            creator: false,
            pool: None,
        });

        let mut mgr = PrimaryManager::new(cfg).unwrap();
        mgr.init_resources().unwrap();
        assert!(mgr.ic_rings().is_empty());
    }
}
