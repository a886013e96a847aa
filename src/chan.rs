//! Per-channel packet queues between the demux and the RX streamer

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::vrt::Sc16;

/// Decoded packet delivered to one RX channel
#[derive(Debug, Clone, Default)]
pub struct PacketRecord {
    pub stream_id: u32,
    pub tsf_ticks: Option<u64>,
    pub chan: u32,
    pub sob: bool,
    pub eob: bool,
    pub samples: Vec<Sc16>,
}

impl PacketRecord {
    pub fn nsamps(&self) -> usize {
        self.samples.len()
    }
}

/// Bounded single-producer single-consumer queue.
///
/// The demux thread is the only pusher, the RX streamer the only popper.
/// A full queue rejects the push and hands the value back so the caller
/// can count the drop; the producer never blocks.
#[derive(Debug)]
pub struct ChannelFifo<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

impl<T> ChannelFifo<T> {
    /// Capacity is rounded up to the next power of two
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Push one item; on a full queue the item comes back in `Err` and the
    /// drop counter advances. Producer side only.
    pub fn push(&self, item: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        unsafe {
            (*self.slots[head & self.mask].get()).write(item);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop one item. Consumer side only.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let item = unsafe { (*self.slots[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for ChannelFifo<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

unsafe impl<T: Send> Send for ChannelFifo<T> {}
unsafe impl<T: Send> Sync for ChannelFifo<T> {}
