//! Durability backend and pool memory mapping.
//!
//! Every write to the pool goes through a [`PersistOps`] capability object
//! stamped at open time. Byte-granular (DAX-style) mappings get the
//! fence-based [`CacheLineFlush`] backend; regular file mappings fall back to
//! [`MsyncFlush`], which schedules ranged msync through the mapping. The two
//! are interchangeable: `persist` is always `flush` followed by `drain`.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;
use tracing::debug;

/// Durability primitives consumed by every layer that mutates the pool.
///
/// `persist` makes a range durable before returning. `flush` only schedules
/// writeback; a later `drain` waits for every outstanding flush.
pub trait PersistOps: Send + Sync {
    /// Flush and drain a range
    fn persist(&self, addr: *const u8, len: usize);

    /// Schedule writeback of a range
    fn flush(&self, addr: *const u8, len: usize);

    /// Wait for previously scheduled flushes
    fn drain(&self);

    /// Durable memcpy into the pool
    fn memcpy_persist(&self, dest: *mut u8, src: *const u8, len: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dest, len) };
        self.persist(dest, len);
    }

    /// Durable memset into the pool
    fn memset_persist(&self, dest: *mut u8, c: u8, len: usize) {
        unsafe { std::ptr::write_bytes(dest, c, len) };
        self.persist(dest, len);
    }
}

/// A mapped pool file.
///
/// The base pointer is captured once at construction so that concurrent
/// writers can address the region without holding `&mut` to the mapping.
/// All mutation happens through raw pointers; the mapping itself only ever
/// hands out addresses and performs ranged flushes.
pub struct Mapping {
    mmap: MmapMut,
    base: *mut u8,
    len: usize,
    page_granular: bool,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Wrap a writable memory map of a pool file.
    pub fn new(mut mmap: MmapMut) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len();
        let page_granular = !detect_byte_granular();
        Self {
            mmap,
            base,
            len,
            page_granular,
        }
    }

    /// Base address of the mapping
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Length of the mapping in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for an opened pool)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether durability is only page-granular (msync fallback)
    #[inline]
    pub fn page_granular(&self) -> bool {
        self.page_granular
    }

    /// Whether a pointer falls inside the mapped region
    #[inline]
    pub fn contains_ptr(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        let b = self.base as usize;
        p >= b && p < b + self.len
    }

    /// Pool-relative offset of an in-pool pointer
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        debug_assert!(self.contains_ptr(ptr));
        (ptr as usize - self.base as usize) as u64
    }

    /// Pointer to a pool offset
    #[inline]
    pub fn at(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.len);
        unsafe { self.base.add(offset as usize) }
    }

    /// Pointer to an aligned 64-bit word at a pool offset
    #[inline]
    pub fn u64_at(&self, offset: u64) -> *mut u64 {
        debug_assert!(offset % 8 == 0, "unaligned word offset {offset}");
        debug_assert!(offset as usize + 8 <= self.len);
        self.at(offset) as *mut u64
    }

    /// Volatile read of a 64-bit word at a pool offset
    #[inline]
    pub fn read_u64(&self, offset: u64) -> u64 {
        unsafe { std::ptr::read_volatile(self.u64_at(offset)) }
    }

    /// Ranged msync through the underlying map
    pub fn flush_file_range(&self, offset: usize, len: usize) -> std::io::Result<()> {
        self.mmap.flush_range(offset, len)
    }
}

/// Fence-based backend for byte-granular persistent mappings.
///
/// On byte-addressable storage the cache line writeback is a CPU instruction;
/// what the heap needs from this backend is the store ordering, which the
/// fences provide.
pub struct CacheLineFlush;

impl PersistOps for CacheLineFlush {
    fn persist(&self, addr: *const u8, len: usize) {
        self.flush(addr, len);
        self.drain();
    }

    fn flush(&self, _addr: *const u8, _len: usize) {
        fence(Ordering::Release);
    }

    fn drain(&self) {
        fence(Ordering::SeqCst);
    }
}

/// msync-based backend for page-granular file mappings.
pub struct MsyncFlush {
    map: Arc<Mapping>,
}

impl MsyncFlush {
    /// Create an msync backend over the given mapping
    pub fn new(map: Arc<Mapping>) -> Self {
        Self { map }
    }
}

impl PersistOps for MsyncFlush {
    fn persist(&self, addr: *const u8, len: usize) {
        self.flush(addr, len);
        self.drain();
    }

    fn flush(&self, addr: *const u8, len: usize) {
        let offset = self.map.offset_of(addr) as usize;
        // Failure to sync violates the durability contract and is fatal for
        // the whole process, not just the flushing thread: an unwind would
        // leave other threads running against an untrustworthy image.
        if let Err(e) = self.map.flush_file_range(offset, len) {
            tracing::error!("msync of {len} bytes at offset {offset} failed: {e}");
            std::process::abort();
        }
    }

    fn drain(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Pick the backend matching the mapping's granularity.
pub fn select_backend(map: &Arc<Mapping>) -> Arc<dyn PersistOps> {
    if map.page_granular() {
        debug!("durability backend: msync (page granular)");
        Arc::new(MsyncFlush::new(Arc::clone(map)))
    } else {
        debug!("durability backend: cache line flush (byte granular)");
        Arc::new(CacheLineFlush)
    }
}

/// Byte-granularity detection.
///
/// Portable builds cannot probe the mapping for DAX, so the decision follows
/// the conventional override variable; unset means page-granular msync.
fn detect_byte_granular() -> bool {
    matches!(
        std::env::var("PMEM_IS_PMEM_FORCE").as_deref(),
        Ok("1") | Ok("y") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_mapping(len: usize) -> Arc<Mapping> {
        Arc::new(Mapping::new(MmapMut::map_anon(len).unwrap()))
    }

    #[test]
    fn test_offset_pointer_roundtrip() {
        let map = anon_mapping(4096);
        let p = map.at(128);
        assert!(map.contains_ptr(p));
        assert_eq!(map.offset_of(p), 128);
    }

    #[test]
    fn test_word_access() {
        let map = anon_mapping(4096);
        unsafe { std::ptr::write_volatile(map.u64_at(64), 0xdead_beef) };
        assert_eq!(map.read_u64(64), 0xdead_beef);
    }

    #[test]
    fn test_memset_and_memcpy_persist() {
        let map = anon_mapping(4096);
        let ops = CacheLineFlush;
        ops.memset_persist(map.at(0), 0xab, 16);
        assert_eq!(unsafe { *map.at(3) }, 0xab);

        let src = [1u8, 2, 3, 4];
        ops.memcpy_persist(map.at(32), src.as_ptr(), src.len());
        assert_eq!(unsafe { *map.at(33) }, 2);
    }

    #[test]
    fn test_outside_pointer_detected() {
        let map = anon_mapping(4096);
        let local = 0u64;
        assert!(!map.contains_ptr(&local as *const u64 as *const u8));
    }
}
