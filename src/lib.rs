//! # iqflow - Shared-Memory SDR Transport Substrate
//!
//! iqflow is the dataplane plumbing between a software-defined radio's
//! packet producers and its sample consumers. A privileged **primary**
//! process creates named lock-free rings and packet buffer pools inside a
//! shared memory segment (hugepage-backed); **secondary** processes attach
//! to those objects by name and exchange in-place packets with the primary.
//! A streaming layer on top fragments contiguous IQ sample streams into
//! timestamped packets, demultiplexes them across per-channel queues, and
//! exposes blocking burst-oriented streamer APIs to the radio stack.
//!
//! ## Architecture
//!
//! ```text
//! RX: producer -> ingress ring -> RxDemux -> per-channel queues -> RxStreamer
//! TX: caller -> TxStreamer (packetize + header) -> egress ring -> consumer
//!
//! ┌──────────────────────────────────────────────────┐
//! │                 SdrDevice facade                 │
//! │  streamer factories + RF control passthrough     │
//! ├──────────────────────────────────────────────────┤
//! │ PrimaryManager (create)  │ SecondaryManager      │
//! │  pools / rings / ic      │  (lookup-only views)  │
//! ├──────────────────────────────────────────────────┤
//! │   PacketPool + ShmRing in SharedMemoryRegion     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Both sides agree on objects purely by name: the naming policy, the
//! segment locator, and the on-wire header are the whole contract.

pub mod chan;
pub mod conf;
pub mod device;
pub mod eal;
pub mod error;
pub mod memory;
pub mod names;
pub mod pool;
pub mod primary;
pub mod ring;
pub mod rx_demux;
pub mod rx_stream;
pub mod secondary;
pub mod tx_stream;
pub mod vrt;

// Main API re-exports
pub use chan::{ChannelFifo, PacketRecord};
pub use conf::{
    Config, DataFormat, Defaults, IcDirection, IcRingSpec, InterconnectSpec, Layout, NamingConfig,
    PoolSpec, RingSpec, Role, RoleConfig, RuntimeConfig, StreamSpec,
};
pub use device::{
    default_endpoint, ControlClient, ControlUnit, DeviceArgs, DeviceInfo, LoopbackControl,
    RxStreamArgs, SdrDevice,
};
pub use eal::{EalBootstrap, ProcType, RuntimeContext};
pub use error::{Result, TransportError};
pub use memory::{SegmentLocator, SharedMemoryRegion};
pub use names::NamePolicy;
pub use pool::{PacketBuf, PacketPool};
pub use primary::PrimaryManager;
pub use ring::ShmRing;
pub use rx_demux::{DemuxConfig, DemuxStats, RxDemux};
pub use rx_stream::{RxMetadata, RxStreamer};
pub use secondary::SecondaryManager;
pub use tx_stream::{
    FlushReport, ShmTxBackend, TxBackend, TxMetadata, TxPush, TxStreamArgs, TxStreamer,
};
pub use vrt::{DecodedHeader, HeaderFields, Sc16, VrtLayout};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod defaults {
    /// Packet header bytes in front of the payload
    pub const HEADER_BYTES: usize = 32;

    /// Byte offset of the 64-bit timestamp inside the header
    pub const TSF_OFFSET: usize = 24;

    /// Samples per TX packet
    pub const SPP: usize = 1024;

    /// Ring depth in packets
    pub const RING_CAPACITY: u32 = 512;

    /// Packet buffers per pool
    pub const POOL_CAPACITY: u32 = 8192;

    /// Data room per pool element
    pub const POOL_ELT_BYTES: u32 = 2048;

    /// Packets dequeued per demux turn
    pub const RX_BURST: usize = 64;

    /// Staged packets per TX batch enqueue
    pub const TX_BURST: usize = 32;
}
