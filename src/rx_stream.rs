//! Blocking burst-oriented RX streamer
//!
//! `recv` fills one caller buffer per channel from the per-channel queues,
//! returning when every channel reached the requested count, the timeout
//! expired, or a stop was signaled. The tail of a packet that did not fit
//! goes into the channel's carry buffer and is consumed first on the next
//! call, so concatenated recv results equal the concatenated packet
//! payloads with no loss and no duplication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chan::{ChannelFifo, PacketRecord};
use crate::error::{Result, TransportError};
use crate::rx_demux::RxDemux;
use crate::vrt::Sc16;

/// Metadata describing one recv burst
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RxMetadata {
    /// True iff the first delivered packet of any channel carried a
    /// timestamp during this call
    pub has_time_spec: bool,
    /// Earliest such timestamp, in seconds (`ticks / tick_rate`)
    pub time_spec: f64,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

/// Untaken tail of the last popped packet for one channel
#[derive(Debug, Default)]
struct CarryBuffer {
    samples: Vec<Sc16>,
    consumed: usize,
}

impl CarryBuffer {
    fn remaining(&self) -> usize {
        self.samples.len() - self.consumed
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, out: &mut [Sc16]) -> usize {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.samples[self.consumed..self.consumed + n]);
        self.consumed += n;
        if self.is_empty() {
            self.samples.clear();
            self.consumed = 0;
        }
        n
    }

    fn stash(&mut self, rest: &[Sc16]) {
        debug_assert!(self.is_empty(), "carry holds at most one packet tail");
        self.samples.clear();
        self.samples.extend_from_slice(rest);
        self.consumed = 0;
    }
}

/// Synchronous multi-channel receiver over per-channel packet queues.
///
/// Single-consumer: one thread calls `recv` at a time. The queues are fed
/// by the demux worker; an owned [`RxDemux`] (when built through the
/// device facade) stops with the streamer.
#[derive(Debug)]
pub struct RxStreamer {
    fifos: Vec<Arc<ChannelFifo<PacketRecord>>>,
    carry: Vec<CarryBuffer>,
    tick_rate: f64,
    stop_flag: Arc<AtomicBool>,
    _demux: Option<RxDemux>,
}

impl RxStreamer {
    /// Bind a streamer to existing per-channel queues
    pub fn new(fifos: Vec<Arc<ChannelFifo<PacketRecord>>>, tick_rate: f64) -> Self {
        let carry = fifos.iter().map(|_| CarryBuffer::default()).collect();
        Self {
            fifos,
            carry,
            tick_rate,
            stop_flag: Arc::new(AtomicBool::new(false)),
            _demux: None,
        }
    }

    /// Bind a streamer to a demux it will own; the worker stops when the
    /// streamer drops
    pub fn with_demux(demux: RxDemux, tick_rate: f64) -> Self {
        let fifos = demux.fifos().to_vec();
        let carry = fifos.iter().map(|_| CarryBuffer::default()).collect();
        Self {
            fifos,
            carry,
            tick_rate,
            stop_flag: Arc::new(AtomicBool::new(false)),
            _demux: Some(demux),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.fifos.len()
    }

    pub fn tick_rate(&self) -> f64 {
        self.tick_rate
    }

    /// Shared flag a caller may flip to cancel a blocked `recv`
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Receive up to `nsamps_per_buff` samples into every channel buffer.
    ///
    /// Returns the per-channel sample count (the minimum across channels)
    /// and burst metadata. Expiring with zero samples is `Timeout`;
    /// expiring with partial data is a successful return with
    /// `end_of_burst` forced false.
    pub fn recv(
        &mut self,
        buffs: &mut [&mut [Sc16]],
        nsamps_per_buff: usize,
        timeout: Duration,
    ) -> Result<(usize, RxMetadata)> {
        let nch = self.fifos.len();
        if buffs.len() < nch {
            return Err(TransportError::config(format!(
                "recv needs {} buffers, got {}",
                nch,
                buffs.len()
            )));
        }
        if nsamps_per_buff == 0 || buffs.iter().any(|b| b.len() < nsamps_per_buff) {
            return Err(TransportError::config("undersized recv buffer"));
        }

        let deadline = Instant::now() + timeout;
        let mut wr = vec![0usize; nch];
        let mut md = RxMetadata::default();
        let mut first_tsf: Option<u64> = None;
        let mut canceled = false;

        loop {
            let mut all_full = true;

            for ch in 0..nch {
                if wr[ch] >= nsamps_per_buff {
                    continue;
                }
                let dst = &mut *buffs[ch];

                // carry first: leftover tail from the previous call
                if !self.carry[ch].is_empty() {
                    wr[ch] += self.carry[ch].take(&mut dst[wr[ch]..nsamps_per_buff]);
                    if wr[ch] >= nsamps_per_buff {
                        continue;
                    }
                }

                while wr[ch] < nsamps_per_buff {
                    let Some(pkt) = self.fifos[ch].pop() else {
                        all_full = false;
                        break;
                    };

                    md.start_of_burst |= pkt.sob;
                    md.end_of_burst |= pkt.eob;
                    if let Some(ticks) = pkt.tsf_ticks {
                        first_tsf = Some(match first_tsf {
                            Some(prev) => prev.min(ticks),
                            None => ticks,
                        });
                    }

                    let need = nsamps_per_buff - wr[ch];
                    if pkt.samples.len() <= need {
                        dst[wr[ch]..wr[ch] + pkt.samples.len()].copy_from_slice(&pkt.samples);
                        wr[ch] += pkt.samples.len();
                    } else {
                        dst[wr[ch]..nsamps_per_buff].copy_from_slice(&pkt.samples[..need]);
                        wr[ch] = nsamps_per_buff;
                        self.carry[ch].stash(&pkt.samples[need..]);
                    }
                }

                if wr[ch] < nsamps_per_buff {
                    all_full = false;
                }
            }

            if all_full {
                break;
            }
            if self.stop_flag.load(Ordering::Relaxed) {
                canceled = true;
                break;
            }
            if Instant::now() >= deadline {
                let got = wr.iter().copied().min().unwrap_or(0);
                if got == 0 {
                    return Err(TransportError::Timeout);
                }
                // partial burst: more of it is still in flight
                md.end_of_burst = false;
                self.finish_metadata(&mut md, first_tsf);
                return Ok((got, md));
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }

        let got = wr.iter().copied().min().unwrap_or(0);
        if canceled && got == 0 {
            self.finish_metadata(&mut md, first_tsf);
            return Ok((0, md));
        }
        self.finish_metadata(&mut md, first_tsf);
        Ok((got, md))
    }

    fn finish_metadata(&self, md: &mut RxMetadata, first_tsf: Option<u64>) {
        if let Some(ticks) = first_tsf {
            md.has_time_spec = true;
            md.time_spec = ticks as f64 / self.tick_rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_pair() -> (Arc<ChannelFifo<PacketRecord>>, RxStreamer) {
        let fifo = Arc::new(ChannelFifo::new(64));
        let streamer = RxStreamer::new(vec![Arc::clone(&fifo)], 1_000_000.0);
        (fifo, streamer)
    }

    fn record(samples: Vec<Sc16>, tsf: Option<u64>, sob: bool, eob: bool) -> PacketRecord {
        PacketRecord {
            stream_id: 0,
            tsf_ticks: tsf,
            chan: 0,
            sob,
            eob,
            samples,
        }
    }

    fn ramp(start: i16, len: usize) -> Vec<Sc16> {
        (0..len as i16).map(|n| Sc16::new(start + n, 0)).collect()
    }

    #[test]
    fn test_exact_fit() {
        let (fifo, mut streamer) = fifo_pair();
        fifo.push(record(ramp(0, 100), Some(500), true, true)).unwrap();

        let mut out = vec![Sc16::default(); 100];
        let (got, md) = streamer
            .recv(&mut [&mut out], 100, Duration::from_millis(100))
            .unwrap();
        assert_eq!(got, 100);
        assert!(md.start_of_burst);
        assert!(md.end_of_burst);
        assert!(md.has_time_spec);
        assert!((md.time_spec - 500.0 / 1_000_000.0).abs() < 1e-12);
        assert_eq!(out[99], Sc16::new(99, 0));
    }

    #[test]
    fn test_carry_over_split() {
        let (fifo, mut streamer) = fifo_pair();
        fifo.push(record(ramp(0, 1024), None, true, true)).unwrap();

        let mut out = vec![Sc16::default(); 700];
        let (got, _md) = streamer
            .recv(&mut [&mut out], 700, Duration::from_millis(100))
            .unwrap();
        assert_eq!(got, 700);
        assert_eq!(out[699], Sc16::new(699, 0));

        // next call drains the 324-sample carry, then times out partial
        let mut out2 = vec![Sc16::default(); 700];
        let (got2, md2) = streamer
            .recv(&mut [&mut out2], 700, Duration::from_millis(20))
            .unwrap();
        assert_eq!(got2, 324);
        assert_eq!(out2[0], Sc16::new(700, 0));
        assert_eq!(out2[323], Sc16::new(1023, 0));
        assert!(!md2.end_of_burst);
    }

    #[test]
    fn test_carry_then_next_packet() {
        let (fifo, mut streamer) = fifo_pair();
        fifo.push(record(ramp(0, 1024), None, false, false)).unwrap();

        let mut out = vec![Sc16::default(); 700];
        streamer
            .recv(&mut [&mut out], 700, Duration::from_millis(100))
            .unwrap();

        fifo.push(record(ramp(1024, 376), None, false, false)).unwrap();
        let mut out2 = vec![Sc16::default(); 700];
        let (got, _) = streamer
            .recv(&mut [&mut out2], 700, Duration::from_millis(100))
            .unwrap();
        // 324 from carry + 376 from the next packet
        assert_eq!(got, 700);
        for (i, s) in out2.iter().enumerate() {
            assert_eq!(s.i, 700 + i as i16);
        }
    }

    #[test]
    fn test_timeout_with_nothing() {
        let (_fifo, mut streamer) = fifo_pair();
        let mut out = vec![Sc16::default(); 16];
        let err = streamer
            .recv(&mut [&mut out], 16, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    fn test_min_across_channels() {
        let f0 = Arc::new(ChannelFifo::new(16));
        let f1 = Arc::new(ChannelFifo::new(16));
        let mut streamer =
            RxStreamer::new(vec![Arc::clone(&f0), Arc::clone(&f1)], 1.0);

        f0.push(record(ramp(0, 64), None, false, false)).unwrap();
        f1.push(record(ramp(0, 32), None, false, false)).unwrap();

        let mut a = vec![Sc16::default(); 64];
        let mut b = vec![Sc16::default(); 64];
        let (got, _) = streamer
            .recv(&mut [&mut a, &mut b], 64, Duration::from_millis(20))
            .unwrap();
        assert_eq!(got, 32);

        f0.push(record(ramp(64, 32), None, false, false)).unwrap();
        f1.push(record(ramp(32, 32), None, false, false)).unwrap();
        let (got2, _) = streamer
            .recv(&mut [&mut a, &mut b], 32, Duration::from_millis(100))
            .unwrap();
        assert_eq!(got2, 32);
    }

    #[test]
    fn test_cancellation_returns_partial() {
        let (fifo, mut streamer) = fifo_pair();
        fifo.push(record(ramp(0, 10), None, false, false)).unwrap();
        let stop = streamer.stop_flag();
        stop.store(true, Ordering::Relaxed);

        let mut out = vec![Sc16::default(); 64];
        let (got, _) = streamer
            .recv(&mut [&mut out], 64, Duration::from_secs(5))
            .unwrap();
        assert_eq!(got, 10);
    }
}
