//! Burst-oriented TX streamer
//!
//! `send` fragments caller IQ into `spp`-sample packets, stamps each
//! header with a derived timestamp, and pushes them through an injected
//! [`TxBackend`]. The production backend stages packets per channel and
//! batch-enqueues them onto the channel's shared ring, releasing whatever
//! a partial enqueue rejects; the streamer maps those released packets
//! back to a sample count so a caller always learns exactly how much made
//! it onto the wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Result, TransportError};
use crate::pool::PacketPool;
use crate::ring::ShmRing;
use crate::vrt::{self, HeaderFields, Sc16, VrtLayout};

/// Staged packets per channel before a batch enqueue
pub const DEFAULT_TX_BURST: usize = 32;

/// Metadata attached to one send burst
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TxMetadata {
    pub has_time_spec: bool,
    /// Burst start time in seconds; multiplied by the tick rate for the
    /// first packet's timestamp
    pub time_spec: f64,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

/// Outcome of a batch enqueue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Packets handed to the ring
    pub enqueued: u32,
    /// Packets released back to their pool because the ring was full
    pub released: u32,
}

/// Outcome of staging one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPush {
    /// Packet staged; the burst has room left
    Staged,
    /// Packet staged and the burst was flushed
    Flushed(FlushReport),
    /// Nothing accepted (pool exhausted); retry after a pause
    Full,
}

/// Capability injected into the streamer at construction. The streamer
/// never learns what sits behind it, which is what keeps it testable
/// without shared memory.
pub trait TxBackend {
    fn num_channels(&self) -> usize;

    /// Build and stage one packet for `chan`
    fn send_packet(&mut self, chan: usize, hdr: &HeaderFields, samples: &[Sc16])
        -> Result<TxPush>;

    /// Batch-enqueue whatever is staged for `chan`
    fn flush(&mut self, chan: usize) -> Result<FlushReport>;
}

/// Production backend: one pool + ring pair per channel
#[derive(Debug)]
pub struct ShmTxBackend {
    channels: Vec<TxChannel>,
    vrt: VrtLayout,
    burst: usize,
}

#[derive(Debug)]
struct TxChannel {
    pool: Arc<PacketPool>,
    ring: Arc<ShmRing>,
    staged: Vec<u32>,
}

impl ShmTxBackend {
    pub fn new(channels: Vec<(Arc<PacketPool>, Arc<ShmRing>)>, vrt: VrtLayout) -> Self {
        Self::with_burst(channels, vrt, DEFAULT_TX_BURST)
    }

    pub fn with_burst(
        channels: Vec<(Arc<PacketPool>, Arc<ShmRing>)>,
        vrt: VrtLayout,
        burst: usize,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|(pool, ring)| TxChannel {
                pool,
                ring,
                staged: Vec::new(),
            })
            .collect();
        Self {
            channels,
            vrt,
            burst: burst.max(1),
        }
    }

    pub fn vrt(&self) -> &VrtLayout {
        &self.vrt
    }

    fn flush_channel(ch: &mut TxChannel) -> FlushReport {
        if ch.staged.is_empty() {
            return FlushReport::default();
        }
        let enqueued = ch.ring.enqueue_burst(&ch.staged);
        for &handle in &ch.staged[enqueued..] {
            ch.pool.release_handle(handle);
        }
        let report = FlushReport {
            enqueued: enqueued as u32,
            released: (ch.staged.len() - enqueued) as u32,
        };
        ch.staged.clear();
        report
    }
}

impl TxBackend for ShmTxBackend {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn send_packet(
        &mut self,
        chan: usize,
        hdr: &HeaderFields,
        samples: &[Sc16],
    ) -> Result<TxPush> {
        let vrt = self.vrt;
        let burst = self.burst;
        let ch = self
            .channels
            .get_mut(chan)
            .ok_or_else(|| TransportError::config(format!("no TX channel {chan}")))?;

        let mut buf = match ch.pool.alloc() {
            Ok(buf) => buf,
            Err(TransportError::PoolExhausted { .. }) => return Ok(TxPush::Full),
            Err(e) => return Err(e),
        };
        // a failed encode or append drops `buf`, which releases it
        vrt::encode_header(&mut buf, &vrt, hdr, samples.len() * Sc16::BYTES)?;
        vrt::append_samples(&mut buf, samples)?;
        ch.staged.push(buf.into_handle());

        if ch.staged.len() >= burst {
            Ok(TxPush::Flushed(Self::flush_channel(ch)))
        } else {
            Ok(TxPush::Staged)
        }
    }

    fn flush(&mut self, chan: usize) -> Result<FlushReport> {
        let ch = self
            .channels
            .get_mut(chan)
            .ok_or_else(|| TransportError::config(format!("no TX channel {chan}")))?;
        Ok(Self::flush_channel(ch))
    }
}

impl Drop for ShmTxBackend {
    fn drop(&mut self) {
        for ch in &mut self.channels {
            let report = Self::flush_channel(ch);
            if report.released > 0 {
                debug!(
                    "tx backend drop: {} staged packets released on ring '{}'",
                    report.released,
                    ch.ring.name()
                );
            }
        }
    }
}

/// TX streamer construction parameters
#[derive(Debug, Clone)]
pub struct TxStreamArgs {
    /// Samples per packet
    pub spp: usize,
    /// Whether the last packet of a send may be short
    pub allow_partial: bool,
    /// Device ticks per second
    pub tick_rate: f64,
    /// Samples per second; with `tick_rate == sample_rate` timestamps
    /// advance by exactly the per-packet sample count
    pub sample_rate: f64,
    /// Stream id of channel 0; channel `c` uses `stream_id + c`
    pub stream_id: u32,
}

impl Default for TxStreamArgs {
    fn default() -> Self {
        Self {
            spp: 1024,
            allow_partial: true,
            tick_rate: 30_720_000.0,
            sample_rate: 30_720_000.0,
            stream_id: 0,
        }
    }
}

/// Synchronous multi-channel sender. Single-caller: one thread drives
/// `send` at a time.
#[derive(Debug)]
pub struct TxStreamer<B: TxBackend> {
    backend: B,
    args: TxStreamArgs,
    ticks_per_sample: f64,
    running_tsf: u64,
}

impl<B: TxBackend> TxStreamer<B> {
    pub fn new(backend: B, args: TxStreamArgs) -> Result<Self> {
        if args.spp == 0 {
            return Err(TransportError::config("spp must be nonzero"));
        }
        if args.sample_rate <= 0.0 || args.tick_rate <= 0.0 {
            return Err(TransportError::config("rates must be positive"));
        }
        let ticks_per_sample = args.tick_rate / args.sample_rate;
        Ok(Self {
            backend,
            args,
            ticks_per_sample,
            running_tsf: 0,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.backend.num_channels()
    }

    /// Largest useful `nsamps_per_buff` per packet
    pub fn max_num_samps(&self) -> usize {
        self.args.spp
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Send `nsamps_per_buff` samples from every channel buffer.
    ///
    /// Returns the per-channel count of samples that made it into
    /// enqueued packets. Backpressure surfaces as a partial count, never
    /// as an error; the call does not block past `timeout`.
    pub fn send(
        &mut self,
        buffs: &[&[Sc16]],
        nsamps_per_buff: usize,
        md: &TxMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        let nch = self.backend.num_channels();
        if buffs.len() < nch {
            return Err(TransportError::config(format!(
                "send needs {} buffers, got {}",
                nch,
                buffs.len()
            )));
        }
        if nsamps_per_buff == 0 || buffs.iter().any(|b| b.len() < nsamps_per_buff) {
            return Err(TransportError::config("undersized send buffer"));
        }

        let spp = self.args.spp;
        if !self.args.allow_partial && nsamps_per_buff % spp != 0 {
            return Ok(0);
        }

        let base_tsf = if md.has_time_spec {
            (md.time_spec * self.args.tick_rate).round() as u64
        } else {
            self.running_tsf
        };

        let deadline = Instant::now() + timeout;
        // per-channel sample counts of packets staged during this call,
        // oldest first, so released suffixes map back to samples
        let mut staged_samps: Vec<VecDeque<u32>> = vec![VecDeque::new(); nch];
        let mut accepted: Vec<u64> = vec![0; nch];
        let mut aborted = false;

        let mut offset = 0usize;
        'chunks: while offset < nsamps_per_buff {
            let chunk = spp.min(nsamps_per_buff - offset);
            let first = offset == 0;
            let last = offset + chunk == nsamps_per_buff;
            let cur_tsf = base_tsf + (offset as f64 * self.ticks_per_sample).round() as u64;

            for ch in 0..nch {
                let hdr = HeaderFields {
                    stream_id: self.args.stream_id + ch as u32,
                    tsf_ticks: Some(cur_tsf),
                    sob: md.start_of_burst && first,
                    eob: md.end_of_burst && last,
                };
                let samples = &buffs[ch][offset..offset + chunk];

                loop {
                    match self.backend.send_packet(ch, &hdr, samples)? {
                        TxPush::Staged => {
                            staged_samps[ch].push_back(chunk as u32);
                            accepted[ch] += chunk as u64;
                            break;
                        }
                        TxPush::Flushed(report) => {
                            staged_samps[ch].push_back(chunk as u32);
                            accepted[ch] += chunk as u64;
                            let lost =
                                subtract_released(&mut staged_samps[ch], report.released);
                            if lost > 0 {
                                accepted[ch] -= lost;
                                aborted = true;
                                break 'chunks;
                            }
                            staged_samps[ch].clear();
                            break;
                        }
                        TxPush::Full => {
                            if Instant::now() >= deadline {
                                aborted = true;
                                break 'chunks;
                            }
                            std::hint::spin_loop();
                            std::thread::yield_now();
                        }
                    }
                }
            }
            offset += chunk;
        }

        // drain the per-channel stages so the accepted counts are exact
        for ch in 0..nch {
            let report = self.backend.flush(ch)?;
            let lost = subtract_released(&mut staged_samps[ch], report.released);
            accepted[ch] -= lost;
        }

        let sent = accepted.iter().copied().min().unwrap_or(0) as usize;
        if aborted {
            debug!(
                "tx send backpressured: {}/{} samples accepted",
                sent, nsamps_per_buff
            );
        }
        self.running_tsf =
            base_tsf + (sent as f64 * self.ticks_per_sample).round() as u64;
        Ok(sent)
    }

    /// Flush any staged packets without sending new samples
    pub fn flush(&mut self) -> Result<()> {
        for ch in 0..self.backend.num_channels() {
            self.backend.flush(ch)?;
        }
        Ok(())
    }
}

/// Sum of the newest `released` staged packet sizes
fn subtract_released(staged: &mut VecDeque<u32>, released: u32) -> u64 {
    let mut lost = 0u64;
    for _ in 0..released {
        match staged.pop_back() {
            Some(samps) => lost += samps as u64,
            None => break,
        }
    }
    lost
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every packet; ring capacity bounds how many enqueue
    #[derive(Debug, Default)]
    struct MockBackend {
        nch: usize,
        capacity: usize,
        enqueued: Vec<Vec<(HeaderFields, usize)>>,
        staged: Vec<Vec<(HeaderFields, usize)>>,
        burst: usize,
    }

    impl MockBackend {
        fn new(nch: usize, capacity: usize, burst: usize) -> Self {
            Self {
                nch,
                capacity,
                enqueued: vec![Vec::new(); nch],
                staged: vec![Vec::new(); nch],
                burst,
            }
        }
    }

    impl TxBackend for MockBackend {
        fn num_channels(&self) -> usize {
            self.nch
        }

        fn send_packet(
            &mut self,
            chan: usize,
            hdr: &HeaderFields,
            samples: &[Sc16],
        ) -> Result<TxPush> {
            self.staged[chan].push((*hdr, samples.len()));
            if self.staged[chan].len() >= self.burst {
                return Ok(TxPush::Flushed(self.flush(chan)?));
            }
            Ok(TxPush::Staged)
        }

        fn flush(&mut self, chan: usize) -> Result<FlushReport> {
            let staged = std::mem::take(&mut self.staged[chan]);
            let room = self.capacity.saturating_sub(self.enqueued[chan].len());
            let take = room.min(staged.len());
            let released = (staged.len() - take) as u32;
            self.enqueued[chan].extend(staged.into_iter().take(take));
            Ok(FlushReport {
                enqueued: take as u32,
                released,
            })
        }
    }

    fn args(spp: usize, allow_partial: bool) -> TxStreamArgs {
        TxStreamArgs {
            spp,
            allow_partial,
            tick_rate: 1_000_000.0,
            sample_rate: 1_000_000.0,
            stream_id: 0x10,
        }
    }

    fn samples(n: usize) -> Vec<Sc16> {
        (0..n as i16).map(|i| Sc16::new(i, 0)).collect()
    }

    #[test]
    fn test_partial_disallowed_rejects_odd_burst() {
        let backend = MockBackend::new(1, 1024, 32);
        let mut tx = TxStreamer::new(backend, args(1024, false)).unwrap();
        let buf = samples(1500);
        let sent = tx
            .send(&[&buf], 1500, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(sent, 0);
        assert!(tx.backend().enqueued[0].is_empty());
    }

    #[test]
    fn test_partial_allowed_splits_packets() {
        let backend = MockBackend::new(1, 1024, 32);
        let mut tx = TxStreamer::new(backend, args(1024, true)).unwrap();
        let buf = samples(1500);
        let sent = tx
            .send(&[&buf], 1500, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(sent, 1500);
        let pkts = &tx.backend().enqueued[0];
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].1, 1024);
        assert_eq!(pkts[1].1, 476);
    }

    #[test]
    fn test_timestamp_derivation_and_monotonicity() {
        let backend = MockBackend::new(1, 64, 32);
        let mut tx = TxStreamer::new(backend, args(100, true)).unwrap();
        let buf = samples(350);
        let md = TxMetadata {
            has_time_spec: true,
            time_spec: 2.0,
            ..Default::default()
        };
        tx.send(&[&buf], 350, &md, Duration::from_millis(10)).unwrap();

        let pkts = &tx.backend().enqueued[0];
        let tsf: Vec<u64> = pkts.iter().map(|(h, _)| h.tsf_ticks.unwrap()).collect();
        assert_eq!(tsf, vec![2_000_000, 2_000_100, 2_000_200, 2_000_300]);
        for w in tsf.windows(2) {
            assert_eq!(w[1] - w[0], 100);
        }
    }

    #[test]
    fn test_running_counter_continues() {
        let backend = MockBackend::new(1, 64, 32);
        let mut tx = TxStreamer::new(backend, args(64, true)).unwrap();
        let buf = samples(128);
        tx.send(&[&buf], 128, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();
        tx.send(&[&buf], 128, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();

        let tsf: Vec<u64> = tx.backend().enqueued[0]
            .iter()
            .map(|(h, _)| h.tsf_ticks.unwrap())
            .collect();
        assert_eq!(tsf, vec![0, 64, 128, 192]);
    }

    #[test]
    fn test_burst_flags_on_edges() {
        let backend = MockBackend::new(1, 64, 32);
        let mut tx = TxStreamer::new(backend, args(50, true)).unwrap();
        let buf = samples(150);
        let md = TxMetadata {
            start_of_burst: true,
            end_of_burst: true,
            ..Default::default()
        };
        tx.send(&[&buf], 150, &md, Duration::from_millis(10)).unwrap();

        let pkts = &tx.backend().enqueued[0];
        assert_eq!(pkts.len(), 3);
        assert!(pkts[0].0.sob && !pkts[0].0.eob);
        assert!(!pkts[1].0.sob && !pkts[1].0.eob);
        assert!(!pkts[2].0.sob && pkts[2].0.eob);
    }

    #[test]
    fn test_backpressure_returns_enqueued_prefix() {
        // ring takes 3 packets; the 4th and 5th are released at flush
        let backend = MockBackend::new(1, 3, 32);
        let mut tx = TxStreamer::new(backend, args(100, true)).unwrap();
        let buf = samples(500);
        let sent = tx
            .send(&[&buf], 500, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(sent, 300);
        assert_eq!(tx.backend().enqueued[0].len(), 3);
    }

    #[test]
    fn test_multichannel_stream_ids() {
        let backend = MockBackend::new(2, 64, 32);
        let mut tx = TxStreamer::new(backend, args(32, true)).unwrap();
        let a = samples(32);
        let b = samples(32);
        tx.send(&[&a, &b], 32, &TxMetadata::default(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(tx.backend().enqueued[0][0].0.stream_id, 0x10);
        assert_eq!(tx.backend().enqueued[1][0].0.stream_id, 0x11);
    }
}
