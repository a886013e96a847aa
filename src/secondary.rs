//! Secondary-side resource manager
//!
//! Secondaries never create: every pool and ring is resolved by name
//! against objects a primary already put in the segment. The handle table
//! here is a pure view — rebuilding it is idempotent, and dropping it only
//! unmaps. A missing object is `NotFound`; retry and backoff belong to the
//! caller, typically an orchestrator that gates on primary readiness.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::conf::Config;
use crate::error::{Result, TransportError};
use crate::memory::SegmentLocator;
use crate::names::NamePolicy;
use crate::pool::PacketPool;
use crate::ring::ShmRing;

/// Lookup-only manager for the secondary roles
#[derive(Debug)]
pub struct SecondaryManager {
    config: Config,
    policy: NamePolicy,
    locator: SegmentLocator,

    pools: Vec<Arc<PacketPool>>,
    tx_rings: Vec<Arc<ShmRing>>,
    rx_rings: Vec<Arc<ShmRing>>,
    ic_rings: Vec<Arc<ShmRing>>,

    pools_by_name: HashMap<String, Arc<PacketPool>>,
    rings_by_name: HashMap<String, Arc<ShmRing>>,
}

impl SecondaryManager {
    /// Build a manager for a secondary-role config. Primary roles are a
    /// caller error; they must use the primary manager.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.role.is_primary() {
            return Err(TransportError::config(format!(
                "role '{}' creates objects; use the primary manager",
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
        })
    }

    /// Resolve a pool by base name
    pub fn lookup_pool(&mut self, base: &str) -> Result<Arc<PacketPool>> {
        let name = self.policy.materialize_checked(self.config.role, base)?;
        if let Some(existing) = self.pools_by_name.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let pool = PacketPool::attach(&self.locator, &name)?;
        info!("pool found: {}", name);
        self.pools_by_name.insert(name, Arc::clone(&pool));
        Ok(pool)
    }

    /// Resolve a ring by base name
    pub fn lookup_ring(&mut self, base: &str) -> Result<Arc<ShmRing>> {
        let name = self.policy.materialize_checked(self.config.role, base)?;
        if let Some(existing) = self.rings_by_name.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let ring = ShmRing::attach(&self.locator, &name)?;
        info!("ring found: {}", name);
        self.rings_by_name.insert(name, Arc::clone(&ring));
        Ok(ring)
    }

    /// Resolve everything the role block declares: pools (only when
    /// declared — pure consumers need none), then TX rings, then RX rings,
    /// then any interconnect rings. The first failure short-circuits; the
    /// secondary does not retry.
    pub fn init_resources(&mut self) -> Result<()> {
        self.pools.clear();
        self.tx_rings.clear();
        self.rx_rings.clear();
        self.ic_rings.clear();
        self.pools_by_name.clear();
        self.rings_by_name.clear();

        let pool_names: Vec<String> =
            self.config.pools().iter().map(|p| p.name.clone()).collect();
        for base in &pool_names {
            let pool = self.lookup_pool(base)?;
            self.pools.push(pool);
        }

        let tx_names: Vec<String> = self
            .config
            .tx_stream()
            .map(|s| s.rings.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default();
        for base in &tx_names {
            let ring = self.lookup_ring(base)?;
            self.tx_rings.push(ring);
        }

        let rx_names: Vec<String> = self
            .config
            .rx_stream()
            .map(|s| s.rings.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default();
        for base in &rx_names {
            let ring = self.lookup_ring(base)?;
            self.rx_rings.push(ring);
        }

        let ic_names: Vec<String> = self
            .config
            .interconnect()
            .map(|ic| ic.rings.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default();
        for base in &ic_names {
            let ring = self.lookup_ring(base)?;
            self.ic_rings.push(ring);
        }

        info!(
            "secondary {} attached: {} pools, {} tx rings, {} rx rings, {} ic rings",
            self.config.role,
            self.pools.len(),
            self.tx_rings.len(),
            self.rx_rings.len(),
            self.ic_rings.len()
        );
        Ok(())
    }

    /// O(1) indexed TX ring access for the hot path; `None` out of range
    pub fn tx_ring_for_queue(&self, qid: usize) -> Option<&Arc<ShmRing>> {
        self.tx_rings.get(qid)
    }

    /// O(1) indexed RX ring access for the hot path; `None` out of range
    pub fn rx_ring_for_queue(&self, qid: usize) -> Option<&Arc<ShmRing>> {
        self.rx_rings.get(qid)
    }

    /// O(1) indexed pool access for the hot path; `None` out of range
    pub fn pool_for_queue(&self, qid: usize) -> Option<&Arc<PacketPool>> {
        self.pools.get(qid)
    }

    pub fn num_tx_queues(&self) -> usize {
        self.tx_rings.len()
    }

    pub fn num_rx_queues(&self) -> usize {
        self.rx_rings.len()
    }

    pub fn num_pools(&self) -> usize {
        self.pools.len()
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

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locator(&self) -> &SegmentLocator {
        &self.locator
    }
}
