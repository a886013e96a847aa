//! Lock-free rings living inside shared memory regions
//!
//! A ring carries `u32` packet handles (pool element indices) between one
//! producer process and one consumer process. Head and tail counters are
//! monotonically increasing `AtomicU64`s embedded in the region header, so
//! a ring attached by name in another process observes the same state.
//! Slot values are indices rather than pointers; addresses do not survive
//! a second mapping, offsets do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::memory::{SegmentLocator, SharedMemoryRegion};

const RING_MAGIC: u64 = 0x4951_464C_5F52_4E47; // "IQFL_RNG"

/// Control block at the start of a ring region.
/// Producer and consumer counters sit on separate cache lines.
#[repr(C)]
struct RingHeader {
    magic: u64,
    capacity: u32,
    slot_mask: u32,
    head: AtomicU64,
    _pad_head: [u8; 48],
    tail: AtomicU64,
    _pad_tail: [u8; 56],
}

const HEADER_LEN: usize = std::mem::size_of::<RingHeader>();

/// Single-producer single-consumer ring of packet handles in shared memory
#[derive(Debug)]
pub struct ShmRing {
    name: String,
    region: Arc<SharedMemoryRegion>,
    capacity: u32,
    slot_mask: u32,
}

impl ShmRing {
    /// Region length needed for a ring of the given usable capacity
    pub fn region_len(capacity: u32) -> usize {
        let slots = slot_count(capacity);
        HEADER_LEN + slots as usize * std::mem::size_of::<u32>()
    }

    /// Create a ring by name. Fails if the backing file already exists;
    /// create-or-found policy lives in the primary manager.
    pub fn create(locator: &SegmentLocator, name: &str, capacity: u32) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(TransportError::ring_create(name));
        }
        let region = SharedMemoryRegion::create(locator, name, Self::region_len(capacity))?;
        Self::init_in(region, name, capacity)
    }

    /// Initialize ring structure inside an already-mapped region
    pub fn init_in(
        region: Arc<SharedMemoryRegion>,
        name: &str,
        capacity: u32,
    ) -> Result<Arc<Self>> {
        if region.len() < Self::region_len(capacity) {
            return Err(TransportError::ring_create(name));
        }
        let header = region.base_ptr() as *mut RingHeader;
        unsafe {
            (*header).capacity = capacity;
            (*header).slot_mask = slot_count(capacity) - 1;
            (*header).head = AtomicU64::new(0);
            (*header).tail = AtomicU64::new(0);
            // magic last: an attacher that wins the race sees either no
            // magic (retries/fails) or a fully initialized header
            std::ptr::write_volatile(std::ptr::addr_of_mut!((*header).magic), RING_MAGIC);
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            region,
            capacity,
            slot_mask: slot_count(capacity) - 1,
        }))
    }

    /// Attach to a pre-existing ring by name
    pub fn attach(locator: &SegmentLocator, name: &str) -> Result<Arc<Self>> {
        let region = SharedMemoryRegion::attach(locator, name)?;
        Self::attach_region(region, name)
    }

    /// Attach to a ring inside an already-mapped region
    pub fn attach_region(region: Arc<SharedMemoryRegion>, name: &str) -> Result<Arc<Self>> {
        if region.len() < HEADER_LEN {
            return Err(TransportError::not_found(name));
        }
        let header = region.base_ptr() as *const RingHeader;
        let (magic, capacity, slot_mask) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*header).magic)),
                (*header).capacity,
                (*header).slot_mask,
            )
        };
        if magic != RING_MAGIC {
            return Err(TransportError::not_found(name));
        }
        if region.len() < HEADER_LEN + (slot_mask as usize + 1) * std::mem::size_of::<u32>() {
            return Err(TransportError::not_found(name));
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            region,
            capacity,
            slot_mask,
        }))
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.base_ptr() as *const RingHeader) }
    }

    fn slot_ptr(&self, pos: u64) -> *mut u32 {
        let index = (pos & self.slot_mask as u64) as usize;
        unsafe { (self.region.base_ptr().add(HEADER_LEN) as *mut u32).add(index) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usable depth in packets
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        let h = self.header();
        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Enqueue one handle. Producer side only.
    pub fn enqueue(&self, handle: u32) -> Result<()> {
        let h = self.header();
        let head = h.head.load(Ordering::Relaxed);
        let tail = h.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity as u64 {
            return Err(TransportError::ring_full(&self.name));
        }
        unsafe { self.slot_ptr(head).write(handle) };
        h.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Enqueue up to `handles.len()` handles; returns how many fit
    pub fn enqueue_burst(&self, handles: &[u32]) -> usize {
        let h = self.header();
        let head = h.head.load(Ordering::Relaxed);
        let tail = h.tail.load(Ordering::Acquire);
        let room = (self.capacity as u64).saturating_sub(head.wrapping_sub(tail)) as usize;
        let n = room.min(handles.len());
        for (i, &handle) in handles[..n].iter().enumerate() {
            unsafe { self.slot_ptr(head.wrapping_add(i as u64)).write(handle) };
        }
        h.head.store(head.wrapping_add(n as u64), Ordering::Release);
        n
    }

    /// Dequeue one handle. Consumer side only.
    pub fn dequeue(&self) -> Result<u32> {
        let h = self.header();
        let tail = h.tail.load(Ordering::Relaxed);
        let head = h.head.load(Ordering::Acquire);
        if tail == head {
            return Err(TransportError::ring_empty(&self.name));
        }
        let handle = unsafe { self.slot_ptr(tail).read() };
        h.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(handle)
    }

    /// Dequeue up to `out.len()` handles; returns how many were filled
    pub fn dequeue_burst(&self, out: &mut [u32]) -> usize {
        let h = self.header();
        let tail = h.tail.load(Ordering::Relaxed);
        let head = h.head.load(Ordering::Acquire);
        let avail = head.wrapping_sub(tail) as usize;
        let n = avail.min(out.len());
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = unsafe { self.slot_ptr(tail.wrapping_add(i as u64)).read() };
        }
        h.tail.store(tail.wrapping_add(n as u64), Ordering::Release);
        n
    }
}

unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

fn slot_count(capacity: u32) -> u32 {
    capacity.next_power_of_two().max(2)
}
