//! RX demultiplexer worker
//!
//! One dedicated thread drains the ingress ring in bursts and fans packets
//! out to per-channel queues. Under the planar layout a packet's channel is
//! its arrival position: groups of `pkts_per_chan` consecutive packets
//! belong to channel `(group mod num_channels)`, the first packet of a
//! group is start-of-burst and the last is end-of-burst. The first packet
//! of a whole block (`num_channels * pkts_per_chan` packets) is the
//! authoritative timestamp carrier; later packets in the block whose
//! header has no timestamp field inherit it. Presence is structural
//! (the layout carries the field or it does not); a timestamp of zero
//! is a valid tick count and propagates like any other.
//!
//! The worker never blocks and never panics on malformed input: decode
//! failures are counted and the buffer released, queue-full pushes are
//! counted and the record dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error};

use crate::chan::{ChannelFifo, PacketRecord};
use crate::conf::Layout;
use crate::error::{Result, TransportError};
use crate::pool::PacketPool;
use crate::ring::ShmRing;
use crate::vrt::{self, VrtLayout};

/// Packets dequeued from the ingress ring per turn
pub const DEFAULT_BURST: usize = 64;

/// Per-channel queue depth
pub const DEFAULT_FIFO_DEPTH: usize = 1 << 14;

/// Demux construction parameters
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    pub layout: Layout,
    pub num_channels: u32,
    /// Consecutive packets per channel group under the planar layout
    pub pkts_per_chan: u32,
    pub vrt: VrtLayout,
    pub burst: usize,
    pub fifo_depth: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Planar,
            num_channels: 1,
            pkts_per_chan: 8,
            vrt: VrtLayout::default(),
            burst: DEFAULT_BURST,
            fifo_depth: DEFAULT_FIFO_DEPTH,
        }
    }
}

/// Steady-state counters. Per-packet trouble never propagates upward;
/// these are the observability surface.
#[derive(Debug, Default)]
pub struct DemuxStats {
    /// Records delivered to a channel queue
    pub handled: AtomicU64,
    /// Packets dropped for malformed headers or bad handles
    pub parse_errors: AtomicU64,
}

impl DemuxStats {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }
}

/// Handle to a running demux worker. Dropping stops and joins the thread.
#[derive(Debug)]
pub struct RxDemux {
    fifos: Vec<Arc<ChannelFifo<PacketRecord>>>,
    run_flag: Arc<AtomicBool>,
    stats: Arc<DemuxStats>,
    thread: Option<JoinHandle<()>>,
}

impl RxDemux {
    /// Spawn the worker over an ingress ring and its packet pool
    pub fn start(ring: Arc<ShmRing>, pool: Arc<PacketPool>, config: DemuxConfig) -> Result<Self> {
        if config.num_channels == 0 {
            return Err(TransportError::config("demux needs at least one channel"));
        }
        if config.pkts_per_chan == 0 {
            return Err(TransportError::config("pkts_per_chan must be nonzero"));
        }

        let fifos: Vec<Arc<ChannelFifo<PacketRecord>>> = (0..config.num_channels)
            .map(|_| Arc::new(ChannelFifo::new(config.fifo_depth)))
            .collect();
        let run_flag = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(DemuxStats::default());

        let worker_fifos = fifos.clone();
        let worker_flag = Arc::clone(&run_flag);
        let worker_stats = Arc::clone(&stats);

        let thread = std::thread::Builder::new()
            .name("iqflow-rx-demux".to_string())
            .spawn(move || {
                demux_loop(ring, pool, config, worker_fifos, worker_flag, worker_stats)
            })
            .map_err(|e| TransportError::from_io(e, "spawn demux thread"))?;

        Ok(Self {
            fifos,
            run_flag,
            stats,
            thread: Some(thread),
        })
    }

    /// Per-channel output queues, in channel order
    pub fn fifos(&self) -> &[Arc<ChannelFifo<PacketRecord>>] {
        &self.fifos
    }

    pub fn stats(&self) -> &Arc<DemuxStats> {
        &self.stats
    }

    /// Records rejected because a channel queue was full
    pub fn queue_drops(&self) -> u64 {
        self.fifos.iter().map(|f| f.dropped()).sum()
    }

    pub fn run_flag(&self) -> &Arc<AtomicBool> {
        &self.run_flag
    }

    /// Flip the run flag and join the worker
    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("demux worker panicked");
            }
        }
    }
}

impl Drop for RxDemux {
    fn drop(&mut self) {
        self.stop();
    }
}

fn demux_loop(
    ring: Arc<ShmRing>,
    pool: Arc<PacketPool>,
    config: DemuxConfig,
    fifos: Vec<Arc<ChannelFifo<PacketRecord>>>,
    run_flag: Arc<AtomicBool>,
    stats: Arc<DemuxStats>,
) {
    let nch = config.num_channels as u64;
    let ppc = config.pkts_per_chan as u64;
    let block_len = nch * ppc;
    let mut burst = vec![0u32; config.burst.max(1)];

    let mut pkt_idx: u64 = 0;
    let mut block_tsf: Option<u64> = None;

    while run_flag.load(Ordering::Relaxed) {
        let n = ring.dequeue_burst(&mut burst);
        if n == 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
            continue;
        }

        for (i, &handle) in burst[..n].iter().enumerate() {
            if !run_flag.load(Ordering::Relaxed) {
                // shutting down: release the undelivered tail of this burst
                for &rest in &burst[i..n] {
                    pool.release_handle(rest);
                }
                log_exit(&stats, &fifos);
                return;
            }

            let record = match decode_packet(&pool, handle, &config, pkt_idx, &mut block_tsf) {
                Some(record) => record,
                None => {
                    stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    pkt_idx += 1;
                    continue;
                }
            };

            let chan = record.chan as usize;
            if chan < fifos.len() {
                if fifos[chan].push(record).is_ok() {
                    stats.handled.fetch_add(1, Ordering::Relaxed);
                }
                // a full queue already counted the drop; producer advances
            } else {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }

            pkt_idx += 1;
            if pkt_idx % block_len == 0 {
                block_tsf = None;
            }
        }
    }
    log_exit(&stats, &fifos);
}

fn decode_packet(
    pool: &Arc<PacketPool>,
    handle: u32,
    config: &DemuxConfig,
    pkt_idx: u64,
    block_tsf: &mut Option<u64>,
) -> Option<PacketRecord> {
    // taking the handle makes this side responsible for the release;
    // the buffer goes back to the pool when `buf` drops below
    let buf = pool.buf_from_handle(handle).ok()?;
    let decoded = vrt::decode_header(buf.as_slice(), &config.vrt).ok()?;
    if decoded.payload_bytes == 0 {
        return None;
    }
    let samples = vrt::read_samples(&buf.as_slice()[config.vrt.header_bytes..]);
    drop(buf);

    let nch = config.num_channels as u64;
    let ppc = config.pkts_per_chan as u64;

    // presence comes from the header layout, never from the value;
    // ticks == 0 is a legitimate stamp on the first burst
    if pkt_idx % (nch * ppc) == 0 {
        *block_tsf = decoded.tsf_ticks;
    }
    let tsf_ticks = decoded.tsf_ticks.or(*block_tsf);

    let record = match config.layout {
        Layout::Planar => PacketRecord {
            stream_id: decoded.stream_id,
            tsf_ticks,
            chan: ((pkt_idx / ppc) % nch) as u32,
            sob: pkt_idx % ppc == 0,
            eob: pkt_idx % ppc == ppc - 1,
            samples,
        },
        Layout::Interleaved => {
            // channel identity and burst flags come from the header
            if decoded.stream_id as u64 >= nch {
                return None;
            }
            PacketRecord {
                stream_id: decoded.stream_id,
                tsf_ticks,
                chan: decoded.stream_id,
                sob: decoded.sob,
                eob: decoded.eob,
                samples,
            }
        }
    };
    Some(record)
}

fn log_exit(stats: &DemuxStats, fifos: &[Arc<ChannelFifo<PacketRecord>>]) {
    debug!(
        "demux exit: handled={} parse_errors={} drops={}",
        stats.handled(),
        stats.parse_errors(),
        fifos.iter().map(|f| f.dropped()).sum::<u64>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SegmentLocator;
    use crate::vrt::{HeaderFields, Sc16};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn setup(dir: &TempDir, pool_cap: u32) -> (Arc<ShmRing>, Arc<PacketPool>) {
        let loc = SegmentLocator::new(dir.path(), "demux_test");
        let ring = ShmRing::create(&loc, "ingress", 256).unwrap();
        let pool = PacketPool::create(&loc, "pool", pool_cap, 4096, 0).unwrap();
        (ring, pool)
    }

    fn produce(ring: &ShmRing, pool: &Arc<PacketPool>, fields: &HeaderFields, samples: &[Sc16]) {
        let mut buf = pool.alloc().unwrap();
        let layout = VrtLayout::default();
        vrt::encode_header(&mut buf, &layout, fields, samples.len() * Sc16::BYTES).unwrap();
        vrt::append_samples(&mut buf, samples).unwrap();
        ring.enqueue(buf.into_handle()).unwrap();
    }

    fn wait_for(fifo: &ChannelFifo<PacketRecord>, n: usize) -> Vec<PacketRecord> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < n && Instant::now() < deadline {
            if let Some(rec) = fifo.pop() {
                out.push(rec);
            } else {
                std::thread::yield_now();
            }
        }
        out
    }

    #[test]
    fn test_planar_channel_assignment() {
        let dir = TempDir::new().unwrap();
        let (ring, pool) = setup(&dir, 64);
        let config = DemuxConfig {
            num_channels: 2,
            pkts_per_chan: 2,
            ..Default::default()
        };
        let demux = RxDemux::start(Arc::clone(&ring), Arc::clone(&pool), config).unwrap();

        // 8 packets: groups of 2 alternate channels 0,1,0,1
        for i in 0..8i16 {
            produce(
                &ring,
                &pool,
                &HeaderFields {
                    stream_id: 7,
                    tsf_ticks: Some(1000),
                    ..Default::default()
                },
                &[Sc16::new(i, -i)],
            );
        }

        let ch0 = wait_for(&demux.fifos()[0], 4);
        let ch1 = wait_for(&demux.fifos()[1], 4);
        assert_eq!(ch0.len(), 4);
        assert_eq!(ch1.len(), 4);

        let ids0: Vec<i16> = ch0.iter().map(|r| r.samples[0].i).collect();
        let ids1: Vec<i16> = ch1.iter().map(|r| r.samples[0].i).collect();
        assert_eq!(ids0, vec![0, 1, 4, 5]);
        assert_eq!(ids1, vec![2, 3, 6, 7]);

        // group flags: first of each pair sob, second eob
        assert!(ch0[0].sob && !ch0[0].eob);
        assert!(!ch0[1].sob && ch0[1].eob);
        assert_eq!(demux.stats().handled(), 8);
    }

    #[test]
    fn test_per_packet_timestamps_reported() {
        let dir = TempDir::new().unwrap();
        let (ring, pool) = setup(&dir, 64);
        let config = DemuxConfig {
            num_channels: 2,
            pkts_per_chan: 2,
            ..Default::default()
        };
        let demux = RxDemux::start(Arc::clone(&ring), Arc::clone(&pool), config).unwrap();

        // every packet carries its own stamp; nothing is rewritten
        for i in 0..4i16 {
            produce(
                &ring,
                &pool,
                &HeaderFields {
                    stream_id: 0,
                    tsf_ticks: Some(5555 + i as u64),
                    ..Default::default()
                },
                &[Sc16::new(i, 0)],
            );
        }

        let ch0 = wait_for(&demux.fifos()[0], 2);
        let ch1 = wait_for(&demux.fifos()[1], 2);
        assert_eq!(ch0[0].tsf_ticks, Some(5555));
        assert_eq!(ch0[1].tsf_ticks, Some(5556));
        assert_eq!(ch1[0].tsf_ticks, Some(5557));
        assert_eq!(ch1[1].tsf_ticks, Some(5558));
    }

    #[test]
    fn test_zero_block_leader_timestamp_is_present() {
        let dir = TempDir::new().unwrap();
        let (ring, pool) = setup(&dir, 64);
        let config = DemuxConfig {
            num_channels: 2,
            pkts_per_chan: 2,
            ..Default::default()
        };
        let demux = RxDemux::start(Arc::clone(&ring), Arc::clone(&pool), config).unwrap();

        // a first burst legitimately starts at tick zero; zero is a
        // value, not absence
        for i in 0..4i16 {
            produce(
                &ring,
                &pool,
                &HeaderFields {
                    stream_id: 0,
                    tsf_ticks: Some(0),
                    ..Default::default()
                },
                &[Sc16::new(i, 0)],
            );
        }

        let ch0 = wait_for(&demux.fifos()[0], 2);
        let ch1 = wait_for(&demux.fifos()[1], 2);
        for rec in ch0.iter().chain(ch1.iter()) {
            assert_eq!(rec.tsf_ticks, Some(0));
        }
    }

    #[test]
    fn test_malformed_packet_counted_and_released() {
        let dir = TempDir::new().unwrap();
        let (ring, pool) = setup(&dir, 8);
        let demux = RxDemux::start(
            Arc::clone(&ring),
            Arc::clone(&pool),
            DemuxConfig::default(),
        )
        .unwrap();

        // a packet shorter than the header
        let mut buf = pool.alloc().unwrap();
        buf.append(8).unwrap().fill(0);
        ring.enqueue(buf.into_handle()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while demux.stats().parse_errors() == 0 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(demux.stats().parse_errors(), 1);
        assert_eq!(demux.stats().handled(), 0);

        // the buffer went back to the pool
        drop(demux);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_stop_joins_worker() {
        let dir = TempDir::new().unwrap();
        let (ring, pool) = setup(&dir, 8);
        let mut demux = RxDemux::start(ring, pool, DemuxConfig::default()).unwrap();
        demux.stop();
        assert!(!demux.run_flag().load(Ordering::Relaxed));
        // second stop is a no-op
        demux.stop();
    }
}
