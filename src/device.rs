//! Device facade over an attached transport
//!
//! Wraps a [`SecondaryManager`] with streamer factories and the RF
//! parameter surface. Streamers borrow non-owning handles from the
//! manager's tables; RF parameters pass through to an injected
//! [`ControlClient`] whose real implementation talks to the remote
//! control-plane at `DEVICE_ADDR`.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::error::{Result, TransportError};
use crate::rx_demux::{DemuxConfig, RxDemux, DEFAULT_BURST, DEFAULT_FIFO_DEPTH};
use crate::rx_stream::RxStreamer;
use crate::secondary::SecondaryManager;
use crate::tx_stream::{ShmTxBackend, TxStreamArgs, TxStreamer};
use crate::vrt::VrtLayout;

/// Which RF chain a control-plane call addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlUnit {
    Rx,
    Tx,
}

/// Static device description from the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub serial: String,
    pub num_rx_channels: u32,
    pub num_tx_channels: u32,
}

/// Remote RF-parameter control plane. Each setter returns the value the
/// hardware actually coerced to.
pub trait ControlClient: Send {
    fn set_freq(&mut self, unit: ControlUnit, chan: usize, target_hz: f64) -> Result<f64>;
    fn set_gain(&mut self, unit: ControlUnit, chan: usize, gain_db: f64) -> Result<f64>;
    fn set_rate(&mut self, unit: ControlUnit, chan: usize, rate_sps: f64) -> Result<f64>;
    fn device_info(&mut self) -> Result<DeviceInfo>;
}

/// Control client that coerces and echoes locally. Stands in when no
/// control plane is reachable and in tests.
#[derive(Debug, Default)]
pub struct LoopbackControl {
    freqs: HashMap<(ControlUnit, usize), f64>,
    gains: HashMap<(ControlUnit, usize), f64>,
    rates: HashMap<(ControlUnit, usize), f64>,
}

impl ControlClient for LoopbackControl {
    fn set_freq(&mut self, unit: ControlUnit, chan: usize, target_hz: f64) -> Result<f64> {
        let actual = target_hz.clamp(1e6, 6e9);
        self.freqs.insert((unit, chan), actual);
        Ok(actual)
    }

    fn set_gain(&mut self, unit: ControlUnit, chan: usize, gain_db: f64) -> Result<f64> {
        let actual = gain_db.clamp(0.0, 70.0);
        self.gains.insert((unit, chan), actual);
        Ok(actual)
    }

    fn set_rate(&mut self, unit: ControlUnit, chan: usize, rate_sps: f64) -> Result<f64> {
        let actual = rate_sps.clamp(1e3, 100e6);
        self.rates.insert((unit, chan), actual);
        Ok(actual)
    }

    fn device_info(&mut self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            name: "iqflow-loopback".to_string(),
            serial: "0".to_string(),
            num_rx_channels: 1,
            num_tx_channels: 1,
        })
    }
}

/// Default control-plane endpoint, overridable through `DEVICE_ADDR`
pub fn default_endpoint() -> String {
    std::env::var("DEVICE_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string())
}

/// Device-level parameters shared by both streamers
#[derive(Debug, Clone)]
pub struct DeviceArgs {
    pub endpoint: String,
    /// Device ticks per second
    pub tick_rate: f64,
    /// RX samples per second; cached independently of the TX rate
    pub rx_sample_rate: f64,
    /// TX samples per second; drives the TX timestamp increment
    pub tx_sample_rate: f64,
}

impl Default for DeviceArgs {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            tick_rate: 30_720_000.0,
            rx_sample_rate: 30_720_000.0,
            tx_sample_rate: 30_720_000.0,
        }
    }
}

/// RX streamer construction knobs beyond what the config carries
#[derive(Debug, Clone)]
pub struct RxStreamArgs {
    pub vrt: VrtLayout,
    /// Consecutive packets per channel group under the planar layout
    pub pkts_per_chan: u32,
    pub fifo_depth: usize,
    pub burst: usize,
}

impl Default for RxStreamArgs {
    fn default() -> Self {
        Self {
            vrt: VrtLayout::default(),
            pkts_per_chan: 8,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            burst: DEFAULT_BURST,
        }
    }
}

/// Facade tying the attached transport to streamers and RF control
pub struct SdrDevice {
    secondary: SecondaryManager,
    control: Box<dyn ControlClient>,
    args: DeviceArgs,
}

impl std::fmt::Debug for SdrDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdrDevice")
            .field("endpoint", &self.args.endpoint)
            .field("tick_rate", &self.args.tick_rate)
            .finish_non_exhaustive()
    }
}

impl SdrDevice {
    pub fn new(
        secondary: SecondaryManager,
        control: Box<dyn ControlClient>,
        args: DeviceArgs,
    ) -> Self {
        info!("device over endpoint {}", args.endpoint);
        Self {
            secondary,
            control,
            args,
        }
    }

    /// Facade with the local loopback control plane
    pub fn with_loopback(secondary: SecondaryManager, args: DeviceArgs) -> Self {
        Self::new(secondary, Box::<LoopbackControl>::default(), args)
    }

    pub fn secondary(&self) -> &SecondaryManager {
        &self.secondary
    }

    pub fn tick_rate(&self) -> f64 {
        self.args.tick_rate
    }

    pub fn rx_sample_rate(&self) -> f64 {
        self.args.rx_sample_rate
    }

    pub fn tx_sample_rate(&self) -> f64 {
        self.args.tx_sample_rate
    }

    /// Build an RX streamer over the role's ingress ring. Spawns the demux
    /// worker; the worker stops when the streamer drops.
    pub fn rx_stream(&self, args: &RxStreamArgs) -> Result<RxStreamer> {
        let spec = self
            .secondary
            .config()
            .rx_stream()
            .cloned()
            .ok_or_else(|| TransportError::config("no rx_stream in role block"))?;

        let ring = self
            .secondary
            .rx_ring_for_queue(0)
            .ok_or_else(|| TransportError::not_found("rx ingress ring"))?;
        let pool = self
            .secondary
            .pool_for_queue(0)
            .ok_or_else(|| TransportError::not_found("rx packet pool"))?;

        let demux = RxDemux::start(
            Arc::clone(ring),
            Arc::clone(pool),
            DemuxConfig {
                layout: spec.layout,
                num_channels: spec.num_channels,
                pkts_per_chan: args.pkts_per_chan,
                vrt: args.vrt,
                burst: args.burst,
                fifo_depth: args.fifo_depth,
            },
        )?;
        Ok(RxStreamer::with_demux(demux, self.args.tick_rate))
    }

    /// Build a TX streamer over the role's per-channel pool + ring pairs
    pub fn tx_stream(&self, vrt: VrtLayout, stream_id: u32) -> Result<TxStreamer<ShmTxBackend>> {
        let spec = self
            .secondary
            .config()
            .tx_stream()
            .cloned()
            .ok_or_else(|| TransportError::config("no tx_stream in role block"))?;

        let mut channels = Vec::with_capacity(spec.num_channels as usize);
        for ch in 0..spec.num_channels as usize {
            let ring = self
                .secondary
                .tx_ring_for_queue(ch)
                .ok_or_else(|| TransportError::not_found(format!("tx ring for channel {ch}")))?;
            // channels may share one pool; fall back to pool 0
            let pool = self
                .secondary
                .pool_for_queue(ch)
                .or_else(|| self.secondary.pool_for_queue(0))
                .ok_or_else(|| TransportError::not_found("tx packet pool"))?;
            channels.push((Arc::clone(pool), Arc::clone(ring)));
        }

        let backend = ShmTxBackend::new(channels, vrt);
        TxStreamer::new(
            backend,
            TxStreamArgs {
                spp: spec.spp as usize,
                allow_partial: spec.allow_partial,
                tick_rate: self.args.tick_rate,
                sample_rate: self.args.tx_sample_rate,
                stream_id,
            },
        )
    }

    // ---- RF parameter passthrough -----------------------------------

    pub fn set_rx_freq(&mut self, chan: usize, target_hz: f64) -> Result<f64> {
        self.control.set_freq(ControlUnit::Rx, chan, target_hz)
    }

    pub fn set_tx_freq(&mut self, chan: usize, target_hz: f64) -> Result<f64> {
        self.control.set_freq(ControlUnit::Tx, chan, target_hz)
    }

    pub fn set_rx_gain(&mut self, chan: usize, gain_db: f64) -> Result<f64> {
        self.control.set_gain(ControlUnit::Rx, chan, gain_db)
    }

    pub fn set_tx_gain(&mut self, chan: usize, gain_db: f64) -> Result<f64> {
        self.control.set_gain(ControlUnit::Tx, chan, gain_db)
    }

    pub fn set_rx_rate(&mut self, chan: usize, rate_sps: f64) -> Result<f64> {
        let actual = self.control.set_rate(ControlUnit::Rx, chan, rate_sps)?;
        self.args.rx_sample_rate = actual;
        Ok(actual)
    }

    pub fn set_tx_rate(&mut self, chan: usize, rate_sps: f64) -> Result<f64> {
        let actual = self.control.set_rate(ControlUnit::Tx, chan, rate_sps)?;
        self.args.tx_sample_rate = actual;
        Ok(actual)
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        self.control.device_info()
    }
}
