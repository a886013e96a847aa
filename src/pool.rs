//! Packet buffer pools in shared memory
//!
//! A pool is a fixed array of uniform packet buffers plus an embedded
//! free-index ring, all inside one named region. Allocation pops an index
//! from the free ring; release pushes it back. Ownership of a buffer
//! transfers with its handle: the producer relinquishes it on a successful
//! ring enqueue, the consumer releases it after decode, and a failed
//! enqueue is released by the producer immediately. Every buffer is
//! released exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::memory::{SegmentLocator, SharedMemoryRegion};

const POOL_MAGIC: u64 = 0x4951_464C_5F50_4F4C; // "IQFL_POL"

/// Default headroom reserved in front of every element's data room
pub const DEFAULT_HEADROOM: u32 = 64;

/// Per-element prefix tracking the live byte count of the data room
const SLOT_PREFIX: usize = 8;

#[repr(C)]
struct PoolHeader {
    magic: u64,
    capacity: u32,
    elt_bytes: u32,
    headroom: u32,
    cache: u32,
    free_slot_mask: u32,
    _pad0: u32,
    free_head: AtomicU64,
    _pad_head: [u8; 56],
    free_tail: AtomicU64,
    _pad_tail: [u8; 56],
}

const HEADER_LEN: usize = std::mem::size_of::<PoolHeader>();

/// Process-local pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub allocated: AtomicU64,
    pub released: AtomicU64,
    pub alloc_failures: AtomicU64,
}

/// A packet buffer pool mapped into this process
#[derive(Debug)]
pub struct PacketPool {
    name: String,
    region: Arc<SharedMemoryRegion>,
    capacity: u32,
    elt_bytes: u32,
    headroom: u32,
    free_slot_mask: u32,
    stride: usize,
    stats: PoolStats,
}

impl PacketPool {
    fn stride(elt_bytes: u32, headroom: u32) -> usize {
        let raw = SLOT_PREFIX + headroom as usize + elt_bytes as usize;
        (raw + 63) & !63
    }

    /// Region length needed for a pool with the given geometry
    pub fn region_len(capacity: u32, elt_bytes: u32, headroom: u32) -> usize {
        let free_slots = capacity.next_power_of_two().max(2) as usize;
        HEADER_LEN
            + free_slots * std::mem::size_of::<u32>()
            + capacity as usize * Self::stride(elt_bytes, headroom)
    }

    /// Create a pool by name with every element on the free ring.
    /// Fails if the backing file already exists.
    pub fn create(
        locator: &SegmentLocator,
        name: &str,
        capacity: u32,
        elt_bytes: u32,
        cache: u32,
    ) -> Result<Arc<Self>> {
        if capacity == 0 || elt_bytes == 0 {
            return Err(TransportError::pool_create(name, "zero capacity or element size"));
        }
        let headroom = DEFAULT_HEADROOM;
        let region =
            SharedMemoryRegion::create(locator, name, Self::region_len(capacity, elt_bytes, headroom))?;

        let free_slot_mask = capacity.next_power_of_two().max(2) - 1;
        let header = region.base_ptr() as *mut PoolHeader;
        unsafe {
            (*header).capacity = capacity;
            (*header).elt_bytes = elt_bytes;
            (*header).headroom = headroom;
            (*header).cache = cache;
            (*header).free_slot_mask = free_slot_mask;
            (*header).free_head = AtomicU64::new(capacity as u64);
            (*header).free_tail = AtomicU64::new(0);
        }
        let pool = Self {
            name: name.to_string(),
            region,
            capacity,
            elt_bytes,
            headroom,
            free_slot_mask,
            stride: Self::stride(elt_bytes, headroom),
            stats: PoolStats::default(),
        };
        // seed the free ring with every element index
        for i in 0..capacity {
            unsafe { pool.free_slot_ptr(i as u64).write(i) };
        }
        unsafe {
            std::ptr::write_volatile(std::ptr::addr_of_mut!((*header).magic), POOL_MAGIC);
        }
        Ok(Arc::new(pool))
    }

    /// Attach to a pre-existing pool by name
    pub fn attach(locator: &SegmentLocator, name: &str) -> Result<Arc<Self>> {
        let region = SharedMemoryRegion::attach(locator, name)?;
        if region.len() < HEADER_LEN {
            return Err(TransportError::not_found(name));
        }
        let header = region.base_ptr() as *const PoolHeader;
        let (magic, capacity, elt_bytes, headroom, free_slot_mask) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*header).magic)),
                (*header).capacity,
                (*header).elt_bytes,
                (*header).headroom,
                (*header).free_slot_mask,
            )
        };
        if magic != POOL_MAGIC {
            return Err(TransportError::not_found(name));
        }
        if region.len() < Self::region_len(capacity, elt_bytes, headroom) {
            return Err(TransportError::not_found(name));
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            region,
            capacity,
            elt_bytes,
            headroom,
            free_slot_mask,
            stride: Self::stride(elt_bytes, headroom),
            stats: PoolStats::default(),
        }))
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.region.base_ptr() as *const PoolHeader) }
    }

    fn free_slot_ptr(&self, pos: u64) -> *mut u32 {
        let index = (pos & self.free_slot_mask as u64) as usize;
        unsafe { (self.region.base_ptr().add(HEADER_LEN) as *mut u32).add(index) }
    }

    fn elements_base(&self) -> *mut u8 {
        let free_slots = (self.free_slot_mask as usize + 1) * std::mem::size_of::<u32>();
        unsafe { self.region.base_ptr().add(HEADER_LEN + free_slots) }
    }

    fn elt_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.capacity);
        unsafe { self.elements_base().add(index as usize * self.stride) }
    }

    fn data_len_ptr(&self, index: u32) -> *mut u32 {
        self.elt_ptr(index) as *mut u32
    }

    /// Pointer to the start of an element's data room (past the headroom)
    fn data_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.elt_ptr(index).add(SLOT_PREFIX + self.headroom as usize) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Data room per element; a full packet (header + payload) must fit
    pub fn elt_bytes(&self) -> u32 {
        self.elt_bytes
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    /// Free buffers currently on the ring
    pub fn available(&self) -> u32 {
        let h = self.header();
        let head = h.free_head.load(Ordering::Acquire);
        let tail = h.free_tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as u32
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Allocate one packet buffer. The returned buffer releases itself on
    /// drop unless its handle is taken for a ring enqueue.
    pub fn alloc(self: &Arc<Self>) -> Result<PacketBuf> {
        let h = self.header();
        let tail = h.free_tail.load(Ordering::Relaxed);
        let head = h.free_head.load(Ordering::Acquire);
        if tail == head {
            self.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::pool_exhausted(&self.name));
        }
        let index = unsafe { self.free_slot_ptr(tail).read() };
        h.free_tail.store(tail.wrapping_add(1), Ordering::Release);

        unsafe { self.data_len_ptr(index).write(0) };
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(PacketBuf {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Return a handle to the free ring. Called by whoever owns the buffer
    /// at that moment: the consumer after decode, or the producer after a
    /// failed enqueue.
    pub fn release_handle(&self, index: u32) {
        debug_assert!(index < self.capacity, "handle out of range");
        let h = self.header();
        let head = h.free_head.load(Ordering::Relaxed);
        unsafe { self.free_slot_ptr(head).write(index) };
        h.free_head.store(head.wrapping_add(1), Ordering::Release);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Rehydrate a buffer from a handle dequeued off a ring. The caller
    /// becomes responsible for the single release.
    pub fn buf_from_handle(self: &Arc<Self>, index: u32) -> Result<PacketBuf> {
        if index >= self.capacity {
            return Err(TransportError::not_found(format!(
                "{}[{}]",
                self.name, index
            )));
        }
        Ok(PacketBuf {
            pool: Arc::clone(self),
            index,
        })
    }
}

unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

/// An owned view of one pool element. Dropping releases the element back
/// to its pool; [`PacketBuf::into_handle`] transfers ownership instead.
#[derive(Debug)]
pub struct PacketBuf {
    pool: Arc<PacketPool>,
    index: u32,
}

impl PacketBuf {
    pub fn handle(&self) -> u32 {
        self.index
    }

    /// Live bytes in the data room
    pub fn data_len(&self) -> usize {
        unsafe { self.pool.data_len_ptr(self.index).read() as usize }
    }

    /// Unused bytes remaining in the data room
    pub fn tailroom(&self) -> usize {
        self.pool.elt_bytes as usize - self.data_len()
    }

    /// Reset the buffer to zero live bytes
    pub fn reset(&mut self) {
        unsafe { self.pool.data_len_ptr(self.index).write(0) };
    }

    /// Extend the live region by `bytes` and return the newly appended
    /// window for writing. Fails with `NoTailroom` when the data room is
    /// too small; nothing is truncated.
    pub fn append(&mut self, bytes: usize) -> Result<&mut [u8]> {
        let len = self.data_len();
        let room = self.pool.elt_bytes as usize - len;
        if bytes > room {
            return Err(TransportError::no_tailroom(bytes, room));
        }
        unsafe {
            self.pool
                .data_len_ptr(self.index)
                .write((len + bytes) as u32);
            Ok(std::slice::from_raw_parts_mut(
                self.pool.data_ptr(self.index).add(len),
                bytes,
            ))
        }
    }

    /// Live bytes, read-only
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pool.data_ptr(self.index), self.data_len()) }
    }

    /// Live bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.data_ptr(self.index), self.data_len())
        }
    }

    /// Relinquish ownership for a ring enqueue; the consumer (or the
    /// producer, on enqueue failure) takes over the release.
    pub fn into_handle(self) -> u32 {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        self.pool.release_handle(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn locator(dir: &TempDir) -> SegmentLocator {
        SegmentLocator::new(dir.path(), "pool_test")
    }

    #[test]
    fn test_alloc_release_cycle() {
        let dir = TempDir::new().unwrap();
        let pool = PacketPool::create(&locator(&dir), "p0", 4, 2048, 0).unwrap();
        assert_eq!(pool.available(), 4);

        let buf = pool.alloc().unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(buf.data_len(), 0);
        assert_eq!(buf.tailroom(), 2048);
        drop(buf);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let dir = TempDir::new().unwrap();
        let pool = PacketPool::create(&locator(&dir), "small", 2, 256, 0).unwrap();
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(matches!(
            pool.alloc(),
            Err(TransportError::PoolExhausted { .. })
        ));
        assert_eq!(pool.stats().alloc_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_append_and_tailroom() {
        let dir = TempDir::new().unwrap();
        let pool = PacketPool::create(&locator(&dir), "append", 2, 128, 0).unwrap();
        let mut buf = pool.alloc().unwrap();

        buf.append(32).unwrap().fill(0xAA);
        assert_eq!(buf.data_len(), 32);
        assert_eq!(buf.tailroom(), 96);

        buf.append(96).unwrap().fill(0xBB);
        assert_eq!(buf.tailroom(), 0);

        let err = buf.append(1).unwrap_err();
        assert!(matches!(err, TransportError::NoTailroom { .. }));
        // nothing truncated, length unchanged
        assert_eq!(buf.data_len(), 128);
        assert_eq!(&buf.as_slice()[..32], &[0xAA; 32]);
    }

    #[test]
    fn test_handle_transfer_no_double_release() {
        let dir = TempDir::new().unwrap();
        let pool = PacketPool::create(&locator(&dir), "handoff", 2, 64, 0).unwrap();

        let buf = pool.alloc().unwrap();
        let handle = buf.into_handle();
        // ownership moved with the handle; nothing returned yet
        assert_eq!(pool.available(), 1);

        let rehydrated = pool.buf_from_handle(handle).unwrap();
        drop(rehydrated);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_attach_shares_free_ring() {
        let dir = TempDir::new().unwrap();
        let loc = locator(&dir);
        let creator = PacketPool::create(&loc, "shared", 4, 512, 0).unwrap();
        let attached = PacketPool::attach(&loc, "shared").unwrap();

        assert_eq!(attached.capacity(), 4);
        assert_eq!(attached.elt_bytes(), 512);

        let mut buf = creator.alloc().unwrap();
        buf.append(4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let handle = buf.into_handle();

        // the other mapping sees the same bytes through the same handle
        let view = attached.buf_from_handle(handle).unwrap();
        assert_eq!(view.as_slice(), &[1, 2, 3, 4]);
        drop(view);
        assert_eq!(creator.available(), 4);
    }

    #[test]
    fn test_attach_garbage_rejected() {
        let dir = TempDir::new().unwrap();
        let loc = locator(&dir);
        let _region = SharedMemoryRegion::create(&loc, "junk", 8192).unwrap();
        assert!(matches!(
            PacketPool::attach(&loc, "junk"),
            Err(TransportError::NotFound { .. })
        ));
    }
}
