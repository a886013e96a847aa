//! Typed configuration model for the transport substrate
//!
//! The on-disk format and its parser live outside the core; everything here
//! is the in-memory shape the rest of the crate consumes. Per-role blocks
//! overlay the `defaults` section, mirroring how deployments share one
//! config document between the primary and its secondaries.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Process role. Exactly the primary variants may create shared objects;
/// the plain variants only look them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Primary that owns the TX-side objects
    PrimaryTxSide,
    /// Primary that owns the RX-side objects
    PrimaryRxSide,
    /// Secondary on the TX side
    Tx,
    /// Secondary on the RX side
    Rx,
}

impl Role {
    /// Stable lowercase token used in materialized object names
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::PrimaryTxSide => "primary_tx",
            Role::PrimaryRxSide => "primary_rx",
            Role::Tx => "tx",
            Role::Rx => "rx",
        }
    }

    /// True for the roles allowed to create pools and rings
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::PrimaryTxSide | Role::PrimaryRxSide)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload layout across channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// One packet's payload contains samples of exactly one channel;
    /// channel identity comes from arrival position
    Planar,
    /// One packet's payload interleaves all channels round-robin;
    /// channel identity comes from the header stream id
    Interleaved,
}

/// Sample wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Complex signed 16-bit (I, Q) pairs, host byte order
    Sc16,
}

/// Shared-memory runtime parameters, consumed by the EAL bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Namespace prefix for every backing file of this deployment
    pub file_prefix: String,
    /// Directory holding the hugepage mount (or any shared filesystem)
    pub huge_dir: String,
    /// Per-socket memory budget, e.g. "512,512"
    #[serde(default)]
    pub socket_mem: String,
    /// IO address mode: "va" or "pa"
    #[serde(default = "default_iova")]
    pub iova: String,
    /// Skip PCI device scanning
    #[serde(default = "default_true")]
    pub no_pci: bool,
    /// Core list in runtime syntax, e.g. "0-3,5"
    #[serde(default)]
    pub lcores: Option<String>,
    /// Main core index
    #[serde(default)]
    pub main_lcore: Option<u32>,
    /// Per-socket allocation hard limit, e.g. "1024,1024"
    #[serde(default)]
    pub socket_limit: Option<String>,
}

fn default_iova() -> String {
    "va".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            file_prefix: "iqflow".to_string(),
            huge_dir: "/dev/hugepages".to_string(),
            socket_mem: String::new(),
            iova: default_iova(),
            no_pci: true,
            lcores: None,
            main_lcore: None,
            socket_limit: None,
        }
    }
}

/// Describes a packet buffer pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Base name; materialized through the naming policy
    pub name: String,
    /// Total packet buffers in the pool
    #[serde(default = "default_pool_capacity")]
    pub capacity: u32,
    /// Data room per element; a full packet (header + payload) must fit
    #[serde(default = "default_elt_bytes")]
    pub elt_bytes: u32,
    /// Per-consumer cache hint; 0 falls back to `Defaults::mp_cache`
    #[serde(default)]
    pub cache: u32,
}

fn default_pool_capacity() -> u32 {
    8192
}

fn default_elt_bytes() -> u32 {
    2048
}

/// Describes a single lock-free ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSpec {
    /// Base name; materialized through the naming policy
    pub name: String,
    /// Usable depth in packets
    #[serde(default = "default_ring_capacity")]
    pub capacity: u32,
}

fn default_ring_capacity() -> u32 {
    512
}

/// One direction of streaming (TX or RX) for a role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Payload layout across channels
    pub layout: Layout,
    /// Number of logical channels
    pub num_channels: u32,
    /// Samples per packet on the TX path
    #[serde(default = "default_spp")]
    pub spp: u32,
    /// Whether a send may end with a short packet
    #[serde(default = "default_true")]
    pub allow_partial: bool,
    /// Per-call wait budget in microseconds
    #[serde(default = "default_timeout_us")]
    pub timeout_us: u32,
    /// Spin instead of sleeping at pause points
    #[serde(default = "default_true")]
    pub busy_poll: bool,
    /// Ordered rings; position assigns channel identity under Planar
    pub rings: Vec<RingSpec>,
}

fn default_spp() -> u32 {
    1024
}

fn default_timeout_us() -> u32 {
    10
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            layout: Layout::Planar,
            num_channels: 1,
            spp: default_spp(),
            allow_partial: true,
            timeout_us: default_timeout_us(),
            busy_poll: true,
            rings: Vec::new(),
        }
    }
}

/// Direction of an interconnect ring relative to the local primary.
/// Direction is configuration, never parsed out of the ring name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcDirection {
    /// Local primary produces into this ring
    Outbound,
    /// Local primary consumes from this ring
    Inbound,
}

/// One interconnect ring between two cooperating primaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcRingSpec {
    pub name: String,
    #[serde(default = "default_ring_capacity")]
    pub capacity: u32,
    pub direction: IcDirection,
}

/// Interconnect block: a named ring pair (or more) plus an optional
/// dedicated pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterconnectSpec {
    #[serde(default)]
    pub rings: Vec<IcRingSpec>,
    /// Whether this primary creates the interconnect objects (creator)
    /// or attaches to objects its peer created (attacher)
    #[serde(default)]
    pub creator: bool,
    #[serde(default)]
    pub pool: Option<PoolSpec>,
}

/// Deployment-wide fallback values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Default pool capacity when a PoolSpec omits it
    pub nb_mbuf: u32,
    /// Default per-consumer pool cache when a PoolSpec says 0
    pub mp_cache: u32,
    /// Default ring depth when a RingSpec omits it
    pub ring_capacity: u32,
    /// Sample format for every stream
    pub data_format: DataFormat,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            nb_mbuf: default_pool_capacity(),
            mp_cache: 256,
            ring_capacity: default_ring_capacity(),
            data_format: DataFormat::Sc16,
        }
    }
}

/// Per-role resource block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub tx_stream: Option<StreamSpec>,
    #[serde(default)]
    pub rx_stream: Option<StreamSpec>,
    /// Pools this role creates (primaries) or needs resolved (secondaries
    /// that produce into a pool)
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub interconnect: Option<InterconnectSpec>,
}

/// Naming policy shared by the create and lookup paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Prefix materialized names with the role token
    #[serde(default)]
    pub prefix_with_role: bool,
    /// Separator between role token and base name
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "_".to_string()
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix_with_role: false,
            separator: default_separator(),
        }
    }
}

/// Top-level configuration consumed by the transport core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub naming: NamingConfig,
    /// Role of the calling process
    pub role: Role,
    /// Resource blocks keyed by role
    #[serde(default)]
    pub primary_tx: Option<RoleConfig>,
    #[serde(default)]
    pub primary_rx: Option<RoleConfig>,
    #[serde(default)]
    pub tx: Option<RoleConfig>,
    #[serde(default)]
    pub rx: Option<RoleConfig>,
}

impl Config {
    /// Minimal valid config for the given role
    pub fn for_role(role: Role, runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            defaults: Defaults::default(),
            naming: NamingConfig::default(),
            role,
            primary_tx: None,
            primary_rx: None,
            tx: None,
            rx: None,
        }
    }

    /// Resource block for an arbitrary role
    pub fn role_block(&self, role: Role) -> Option<&RoleConfig> {
        match role {
            Role::PrimaryTxSide => self.primary_tx.as_ref(),
            Role::PrimaryRxSide => self.primary_rx.as_ref(),
            Role::Tx => self.tx.as_ref(),
            Role::Rx => self.rx.as_ref(),
        }
    }

    /// Mutable resource block for an arbitrary role, created on demand
    pub fn role_block_mut(&mut self, role: Role) -> &mut RoleConfig {
        let slot = match role {
            Role::PrimaryTxSide => &mut self.primary_tx,
            Role::PrimaryRxSide => &mut self.primary_rx,
            Role::Tx => &mut self.tx,
            Role::Rx => &mut self.rx,
        };
        slot.get_or_insert_with(RoleConfig::default)
    }

    /// Resource block for the active role
    pub fn active_block(&self) -> Option<&RoleConfig> {
        self.role_block(self.role)
    }

    /// Effective TX stream for the active role
    pub fn tx_stream(&self) -> Option<&StreamSpec> {
        self.active_block().and_then(|b| b.tx_stream.as_ref())
    }

    /// Effective RX stream for the active role
    pub fn rx_stream(&self) -> Option<&StreamSpec> {
        self.active_block().and_then(|b| b.rx_stream.as_ref())
    }

    /// Pools declared under the active role
    pub fn pools(&self) -> &[PoolSpec] {
        self.active_block().map(|b| b.pools.as_slice()).unwrap_or(&[])
    }

    /// Interconnect block for the active role
    pub fn interconnect(&self) -> Option<&InterconnectSpec> {
        self.active_block().and_then(|b| b.interconnect.as_ref())
    }

    /// Effective cache hint for a pool spec
    pub fn pool_cache(&self, spec: &PoolSpec) -> u32 {
        if spec.cache == 0 {
            self.defaults.mp_cache
        } else {
            spec.cache
        }
    }

    /// Semantic validation of the whole document
    pub fn validate(&self) -> Result<()> {
        if self.runtime.file_prefix.is_empty() {
            return Err(TransportError::config("runtime.file_prefix is empty"));
        }
        if self.runtime.huge_dir.is_empty() {
            return Err(TransportError::config("runtime.huge_dir is empty"));
        }
        for (label, stream) in [("tx_stream", self.tx_stream()), ("rx_stream", self.rx_stream())]
        {
            let Some(stream) = stream else { continue };
            if stream.num_channels == 0 {
                return Err(TransportError::config(format!(
                    "{label}: num_channels must be nonzero"
                )));
            }
            if stream.spp == 0 {
                return Err(TransportError::config(format!(
                    "{label}: spp must be nonzero"
                )));
            }
            for ring in &stream.rings {
                if ring.name.is_empty() {
                    return Err(TransportError::config(format!("{label}: unnamed ring")));
                }
                if ring.capacity == 0 {
                    return Err(TransportError::config(format!(
                        "{label}: ring '{}' has zero capacity",
                        ring.name
                    )));
                }
            }
            if stream.layout == Layout::Planar
                && !stream.rings.is_empty()
                && stream.rings.len() != 1
                && (stream.rings.len() as u32) != stream.num_channels
            {
                return Err(TransportError::config(format!(
                    "{label}: planar layout needs 1 or num_channels rings, got {}",
                    stream.rings.len()
                )));
            }
        }
        for pool in self.pools() {
            if pool.name.is_empty() {
                return Err(TransportError::config("unnamed pool"));
            }
            if pool.capacity == 0 || pool.elt_bytes == 0 {
                return Err(TransportError::config(format!(
                    "pool '{}' has zero capacity or element size",
                    pool.name
                )));
            }
        }
        if let Some(ic) = self.interconnect() {
            if ic.creator && !self.role.is_primary() {
                return Err(TransportError::config(
                    "only a primary role may create interconnect rings",
                ));
            }
            for ring in &ic.rings {
                if ring.name.is_empty() {
                    return Err(TransportError::config("unnamed interconnect ring"));
                }
            }
        }
        Ok(())
    }
}
