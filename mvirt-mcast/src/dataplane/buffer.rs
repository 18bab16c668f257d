//! Packet buffer pools for the forwarding pipeline
//!
//! Each pool is one anonymous mapping (2MB hugepages if available) carved into
//! fixed-size slots. Free slot indices live in a lock-free queue, so workers
//! allocate and release concurrently without any locking of their own.
//!
//! A [`PoolBuffer`] is the single owner of one slot. It is moved between
//! pipeline stages and returns its slot to the pool when dropped, so a buffer
//! is released exactly once by construction.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;

use super::PortId;

/// Headroom reserved in front of received frames
pub const DEFAULT_HEADROOM: usize = 128;

/// Data room behind the headroom (largest frame a receive buffer holds)
pub const DEFAULT_DATA_ROOM: usize = 2048;

/// Number of buffers in the receive pool
pub const NB_PKT_BUFFERS: usize = 8192;

/// Number of buffers in the header (replica) pool
pub const NB_HDR_BUFFERS: usize = 8192;

/// 2MB hugepage size; hugepage mappings are rounded up to it
const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Slots are aligned to cache lines
const CACHE_LINE: usize = 64;

/// Tries of a bulk allocation before it reports exhaustion
const BULK_ATTEMPTS: usize = 2;

/// Buffer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer pool exhausted")]
    Exhausted,

    #[error("insufficient headroom: need {needed} bytes, have {available}")]
    InsufficientHeadroom { needed: usize, available: usize },

    #[error("length {len} exceeds buffer capacity {capacity}")]
    TooLong { len: usize, capacity: usize },
}

/// Construction parameters of a [`BufferPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool name (for logs)
    pub name: String,
    /// Number of buffers
    pub buffer_count: usize,
    /// Bytes per buffer, headroom included
    pub buffer_size: usize,
    /// Initial data offset of a freshly allocated buffer
    pub headroom: usize,
}

impl PoolConfig {
    /// Pool for received frames: default headroom followed by `data_room` bytes
    pub fn packet(name: impl Into<String>, buffer_count: usize, data_room: usize) -> Self {
        Self {
            name: name.into(),
            buffer_count,
            buffer_size: DEFAULT_HEADROOM + data_room,
            headroom: DEFAULT_HEADROOM,
        }
    }

    /// Pool for replicas: the whole buffer is headroom, so a frame of up to
    /// `max_frame` bytes can be prepended into an empty buffer.
    pub fn header(name: impl Into<String>, buffer_count: usize, max_frame: usize) -> Self {
        Self {
            name: name.into(),
            buffer_count,
            buffer_size: max_frame,
            headroom: max_frame,
        }
    }

    /// Bytes available behind the headroom
    pub fn data_room(&self) -> usize {
        self.buffer_size.saturating_sub(self.headroom)
    }

    fn check(&self) -> io::Result<()> {
        if self.buffer_count == 0 || self.buffer_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool {}: buffer count and size must be non-zero", self.name),
            ));
        }
        if self.headroom > self.buffer_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool {}: headroom exceeds buffer size", self.name),
            ));
        }
        if u32::try_from(self.buffer_count).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool {}: too many buffers", self.name),
            ));
        }
        Ok(())
    }
}

/// Per-packet metadata carried alongside the frame bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Port the frame was received on
    pub port: PortId,
    /// Inner VLAN tag control information
    pub vlan_tci: u16,
    /// Outer VLAN tag control information (QinQ)
    pub vlan_tci_outer: u16,
    /// Checksum / offload flag bitset
    pub ol_flags: u64,
    /// Packed transmit offload lengths
    pub tx_offload: u64,
    /// Receive hash
    pub hash: u32,
    /// Generic flag bitset
    pub flags: u32,
}

/// Memory-mapped pool of fixed-size packet buffers
pub struct BufferPool {
    name: String,
    /// Base pointer to the mmap'd region
    base: NonNull<u8>,
    /// Size of the mapping
    map_size: usize,
    /// Distance between two slots
    stride: usize,
    buffer_size: usize,
    headroom: usize,
    capacity: usize,
    /// Free list (lock-free queue of slot indices)
    free: ArrayQueue<u32>,
}

// SAFETY: the mapping lives as long as the pool, slots are handed out to at
// most one PoolBuffer at a time, and ArrayQueue is thread-safe.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool
    ///
    /// Tries 2MB hugepages first and falls back to regular pages.
    pub fn new(config: PoolConfig) -> io::Result<Self> {
        config.check()?;

        let stride = config.buffer_size.next_multiple_of(CACHE_LINE);
        let size = stride
            .checked_mul(config.buffer_count)
            .ok_or_else(|| io::Error::other("pool size overflow"))?;

        let (base, map_size, using_hugepages) = match Self::mmap_hugepages(size) {
            Ok((ptr, len)) => (ptr, len, true),
            Err(_) => {
                let ptr = Self::mmap_regular(size)?;
                (ptr, size, false)
            }
        };

        let free = ArrayQueue::new(config.buffer_count);
        for i in 0..config.buffer_count {
            // ArrayQueue::push only fails if full, which can't happen here
            let _ = free.push(i as u32);
        }

        tracing::info!(
            pool = %config.name,
            buffer_count = config.buffer_count,
            buffer_size = config.buffer_size,
            headroom = config.headroom,
            hugepages = using_hugepages,
            "Buffer pool created"
        );

        Ok(Self {
            name: config.name,
            base,
            map_size,
            stride,
            buffer_size: config.buffer_size,
            headroom: config.headroom,
            capacity: config.buffer_count,
            free,
        })
    }

    fn mmap_hugepages(size: usize) -> io::Result<(NonNull<u8>, usize)> {
        let len = size.next_multiple_of(HUGEPAGE_SIZE);
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                len.try_into()
                    .map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.cast(), len))
    }

    fn mmap_regular(size: usize) -> io::Result<NonNull<u8>> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok(ptr.cast())
    }

    /// Allocate one buffer
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuffer> {
        self.free.pop().map(|index| PoolBuffer {
            pool: Arc::clone(self),
            index,
            start: self.headroom,
            len: 0,
            meta: PacketMeta::default(),
        })
    }

    /// Allocate exactly `count` buffers into `out`, or none at all
    ///
    /// On exhaustion every buffer taken during the attempt goes back to the
    /// pool and `out` is left as it was.
    ///
    /// Buffers are taken one at a time, so two callers racing for the last
    /// buffers can each hold part of what the other needs. An attempt is
    /// skipped when too few buffers are free to begin with, and a failed
    /// attempt is retried once after returning its buffers.
    pub fn alloc_bulk(
        self: &Arc<Self>,
        count: usize,
        out: &mut Vec<PoolBuffer>,
    ) -> Result<(), BufferError> {
        for _ in 0..BULK_ATTEMPTS {
            if self.available() < count {
                return Err(BufferError::Exhausted);
            }
            if self.try_alloc_bulk(count, out) {
                return Ok(());
            }
        }
        Err(BufferError::Exhausted)
    }

    fn try_alloc_bulk(self: &Arc<Self>, count: usize, out: &mut Vec<PoolBuffer>) -> bool {
        let mark = out.len();
        for _ in 0..count {
            match self.alloc() {
                Some(buf) => out.push(buf),
                None => {
                    out.truncate(mark);
                    return false;
                }
            }
        }
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of free buffers
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently owned by someone
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Headroom of a freshly allocated buffer
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Largest frame a freshly allocated buffer can hold without prepending
    pub fn data_room(&self) -> usize {
        self.buffer_size - self.headroom
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < capacity (enforced by ArrayQueue capacity)
        unsafe { self.base.as_ptr().add(index as usize * self.stride) }
    }

    #[inline]
    fn return_buffer(&self, index: u32) {
        // Only fails if full, which can't happen for a slot we handed out
        let _ = self.free.push(index);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: base/map_size describe the mapping created in new()
        unsafe {
            let _ = munmap(self.base.cast(), self.map_size);
        }
    }
}

/// A buffer owned from a pool
///
/// Returns to its pool when dropped.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    /// Offset of the first data byte within the slot
    start: usize,
    /// Length of valid data
    len: usize,
    meta: PacketMeta,
}

impl PoolBuffer {
    /// Immutable slice of the frame
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: start + len <= buffer_size and the slot is exclusively ours
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts(ptr, self.len)
        }
    }

    /// Mutable slice of the frame
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: start + len <= buffer_size and the slot is exclusively ours
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.len)
        }
    }

    /// Mutable slice from the data start to the end of the slot
    ///
    /// Receive paths read into this and then call [`set_len`](Self::set_len).
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: start <= buffer_size
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.pool.buffer_size - self.start)
        }
    }

    /// Frame length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free bytes in front of the data
    #[inline]
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Free bytes behind the data
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.pool.buffer_size - self.start - self.len
    }

    /// Set the frame length after filling [`write_area`](Self::write_area)
    pub fn set_len(&mut self, len: usize) -> Result<(), BufferError> {
        let capacity = self.pool.buffer_size - self.start;
        if len > capacity {
            return Err(BufferError::TooLong { len, capacity });
        }
        self.len = len;
        Ok(())
    }

    /// Copy `bytes` behind the current data
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let old = self.len;
        self.set_len(old + bytes.len())?;
        self.data_mut()[old..].copy_from_slice(bytes);
        Ok(())
    }

    /// Grow the frame by `n` bytes at the front, using headroom
    ///
    /// Returns the newly exposed bytes. Fails without touching the buffer if
    /// the headroom is smaller than `n`.
    #[inline]
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.start {
            return Err(BufferError::InsufficientHeadroom {
                needed: n,
                available: self.start,
            });
        }
        self.start -= n;
        self.len += n;
        Ok(&mut self.data_mut()[..n])
    }

    /// Make this buffer an independent copy of `src`
    ///
    /// Prepends `src.len()` bytes, copies the frame into them and copies the
    /// metadata.
    pub fn copy_from(&mut self, src: &PoolBuffer) -> Result<(), BufferError> {
        let dst = self.prepend(src.len())?;
        dst.copy_from_slice(src.data());
        self.meta = src.meta;
        Ok(())
    }

    #[inline]
    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    #[inline]
    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }

    /// Pointer to the first data byte (prefetch target)
    #[inline]
    pub fn data_ptr(&self) -> *const u8 {
        // SAFETY: start <= buffer_size
        unsafe { self.pool.buffer_ptr(self.index).add(self.start) }
    }

    /// Hint the CPU to pull the frame's first cache line
    #[inline]
    pub fn prefetch(&self) {
        prefetch(self.data_ptr());
    }

    /// Pool this buffer returns to
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Back to the state of a fresh allocation
    pub fn reset(&mut self) {
        self.start = self.pool.headroom;
        self.len = 0;
        self.meta = PacketMeta::default();
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_buffer(self.index);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("headroom", &self.start)
            .field("len", &self.len)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Prefetch a cache line into all cache levels
#[inline(always)]
pub fn prefetch(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint and never faults, whatever the address
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(addr.cast());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_pool(count: usize) -> Arc<BufferPool> {
        Arc::new(
            BufferPool::new(PoolConfig::packet("test-pkt", count, DEFAULT_DATA_ROOM))
                .expect("Failed to create pool"),
        )
    }

    fn header_pool(count: usize) -> Arc<BufferPool> {
        Arc::new(
            BufferPool::new(PoolConfig::header("test-hdr", count, DEFAULT_DATA_ROOM))
                .expect("Failed to create pool"),
        )
    }

    #[test]
    fn test_pool_creation() {
        let pool = packet_pool(16);
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.capacity(), 16);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.headroom(), DEFAULT_HEADROOM);
        assert_eq!(pool.data_room(), DEFAULT_DATA_ROOM);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(BufferPool::new(PoolConfig::packet("empty", 0, 64)).is_err());

        let config = PoolConfig {
            name: "bad".to_string(),
            buffer_count: 4,
            buffer_size: 64,
            headroom: 128,
        };
        assert!(BufferPool::new(config).is_err());
    }

    #[test]
    fn test_buffer_alloc_and_drop() {
        let pool = packet_pool(8);
        {
            let buf = pool.alloc().expect("Failed to alloc");
            assert_eq!(pool.available(), 7);
            assert_eq!(buf.headroom(), DEFAULT_HEADROOM);
            assert!(buf.is_empty());
        }
        // Buffer returned on drop
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = packet_pool(4);
        let mut buffers = Vec::new();
        for _ in 0..4 {
            buffers.push(pool.alloc().expect("Should be able to alloc"));
        }

        assert!(pool.alloc().is_none());
        assert_eq!(pool.available(), 0);

        buffers.pop();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_alloc_bulk_all_or_nothing() {
        let pool = packet_pool(4);
        let mut out = Vec::new();

        pool.alloc_bulk(3, &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(pool.available(), 1);

        // Only one left: asking for two must not hand out a partial result
        let err = pool.alloc_bulk(2, &mut out).unwrap_err();
        assert_eq!(err, BufferError::Exhausted);
        assert_eq!(out.len(), 3);
        assert_eq!(pool.available(), 1);

        out.clear();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_alloc_bulk_contended() {
        // Room for two bulk allocations of 3 at a time, four threads competing
        let pool = packet_pool(6);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut successes = 0;
                    let mut out = Vec::new();
                    for _ in 0..2000 {
                        match pool.alloc_bulk(3, &mut out) {
                            Ok(()) => {
                                assert_eq!(out.len(), 3);
                                successes += 1;
                            }
                            Err(e) => {
                                assert_eq!(e, BufferError::Exhausted);
                                assert!(out.is_empty());
                            }
                        }
                        out.clear();
                    }
                    successes
                })
            })
            .collect();

        let successes: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(successes > 0);
        assert_eq!(pool.available(), 6);
    }

    #[test]
    fn test_alloc_bulk_zero() {
        let pool = packet_pool(1);
        let mut out = Vec::new();
        pool.alloc_bulk(0, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_write_area_and_set_len() {
        let pool = packet_pool(1);
        let mut buf = pool.alloc().unwrap();

        buf.write_area()[..5].copy_from_slice(b"hello");
        buf.set_len(5).unwrap();
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.tailroom(), DEFAULT_DATA_ROOM - 5);

        let err = buf.set_len(DEFAULT_DATA_ROOM + 1).unwrap_err();
        assert!(matches!(err, BufferError::TooLong { .. }));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_prepend_uses_headroom() {
        let pool = packet_pool(1);
        let mut buf = pool.alloc().unwrap();
        buf.append(&[0x45, 0x00, 0x00, 0x28]).unwrap();

        let hdr = buf.prepend(2).unwrap();
        hdr.copy_from_slice(&[0xaa, 0xbb]);

        assert_eq!(buf.data(), &[0xaa, 0xbb, 0x45, 0x00, 0x00, 0x28]);
        assert_eq!(buf.headroom(), DEFAULT_HEADROOM - 2);
    }

    #[test]
    fn test_prepend_insufficient_headroom() {
        let pool = packet_pool(1);
        let mut buf = pool.alloc().unwrap();
        buf.append(b"abc").unwrap();

        let err = buf.prepend(DEFAULT_HEADROOM + 1).unwrap_err();
        assert_eq!(
            err,
            BufferError::InsufficientHeadroom {
                needed: DEFAULT_HEADROOM + 1,
                available: DEFAULT_HEADROOM,
            }
        );
        // Untouched
        assert_eq!(buf.data(), b"abc");
        assert_eq!(buf.headroom(), DEFAULT_HEADROOM);
    }

    #[test]
    fn test_copy_from_is_independent() {
        let pkts = packet_pool(1);
        let hdrs = header_pool(1);

        let mut src = pkts.alloc().unwrap();
        src.append(&(0..100u8).collect::<Vec<_>>()).unwrap();
        *src.meta_mut() = PacketMeta {
            port: 1,
            vlan_tci: 100,
            vlan_tci_outer: 200,
            ol_flags: 0x1234,
            tx_offload: 0x5678,
            hash: 0xdead_beef,
            flags: 7,
        };

        let mut copy = hdrs.alloc().unwrap();
        copy.copy_from(&src).unwrap();

        assert_eq!(copy.data(), src.data());
        assert_eq!(copy.meta(), src.meta());
        assert_eq!(copy.headroom(), DEFAULT_DATA_ROOM - 100);

        // Writes to the copy don't reach the source
        copy.data_mut()[0] = 0xff;
        assert_eq!(src.data()[0], 0);
    }

    #[test]
    fn test_copy_from_full_size_frame() {
        let pkts = packet_pool(1);
        let hdrs = header_pool(1);

        let mut src = pkts.alloc().unwrap();
        src.append(&vec![0x5a; DEFAULT_DATA_ROOM]).unwrap();

        let mut copy = hdrs.alloc().unwrap();
        copy.copy_from(&src).unwrap();
        assert_eq!(copy.len(), DEFAULT_DATA_ROOM);
        assert_eq!(copy.headroom(), 0);
    }

    #[test]
    fn test_reset() {
        let pool = packet_pool(1);
        let mut buf = pool.alloc().unwrap();
        buf.append(b"data").unwrap();
        buf.prepend(4).unwrap();
        buf.meta_mut().hash = 9;

        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.headroom(), DEFAULT_HEADROOM);
        assert_eq!(*buf.meta(), PacketMeta::default());
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = packet_pool(2);
        let mut buf = pool.alloc().unwrap();
        buf.append(b"hello").unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });

        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
        drop(received);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let pool = packet_pool(64);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..1000 {
                        if let Some(buf) = pool.alloc() {
                            held.push(buf);
                        }
                        if held.len() > 8 {
                            held.clear();
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.available(), 64);
    }
}
