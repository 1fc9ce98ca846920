//! Lane manager, info slots, and the open-time recovery driver.
//!
//! A lane is the per-operation scratch slot: it owns a durable redo area and
//! one info slot. Every `alloc`/`free`/`realloc` holds a lane for its
//! duration. Acquisition try-locks a round-robin starting index and advances
//! on contention; release clears the lane's info slot without flushing: the
//! next operation on the lane overwrites and flushes it anyway, and recovery
//! treats a stale-but-complete slot as undoable precisely because the redo
//! log already retired the operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::layout::{
    ChunkHeader, Geometry, InfoSlot, ALLOC_HEADER_SIZE, CHUNK_TYPE_BASE, CHUNK_TYPE_RUN,
    CHUNK_WORD_USED, INFO_SLOT_SIZE, RUN_DATA_OFF,
};
use crate::pmem::{Mapping, PersistOps};
use crate::redo::{self, LANE_REDO_CAPACITY};

/// Fixed pool of lanes over the pool's lane area.
pub struct LaneManager {
    map: Arc<Mapping>,
    ops: Arc<dyn PersistOps>,
    geo: Geometry,
    lanes: Vec<CachePadded<Mutex<()>>>,
    next: AtomicUsize,
}

/// Exclusive hold of one lane for the duration of an operation.
pub struct LaneGuard<'a> {
    mgr: &'a LaneManager,
    /// Lane index
    pub id: u64,
    _guard: MutexGuard<'a, ()>,
}

impl LaneManager {
    /// Build the lane ring over the mapped lane area.
    pub fn new(map: Arc<Mapping>, ops: Arc<dyn PersistOps>, geo: Geometry) -> Self {
        let lanes = (0..geo.lane_count)
            .map(|_| CachePadded::new(Mutex::new(())))
            .collect();
        Self {
            map,
            ops,
            geo,
            lanes,
            next: AtomicUsize::new(0),
        }
    }

    /// Acquire a lane: try-lock round-robin, block on the start index only
    /// if every lane is contended.
    pub fn hold(&self) -> LaneGuard<'_> {
        let n = self.lanes.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let idx = (start + i) % n;
            if let Some(guard) = self.lanes[idx].try_lock() {
                return LaneGuard {
                    mgr: self,
                    id: idx as u64,
                    _guard: guard,
                };
            }
        }
        LaneGuard {
            mgr: self,
            id: start as u64,
            _guard: self.lanes[start].lock(),
        }
    }

    /// Offset of a lane's durable redo log
    pub fn redo_off(&self, lane: u64) -> u64 {
        self.geo.lane_redo_off(lane)
    }

    /// Pointer to the first word of a lane's info slot (its tag word)
    pub fn info_slot_word(&self, lane: u64) -> *mut u64 {
        self.map.u64_at(self.geo.info_slot_off(lane))
    }

    /// Durably record an in-flight operation in the lane's info slot.
    pub fn set_info_slot(&self, lane: u64, slot: InfoSlot) {
        let off = self.geo.info_slot_off(lane);
        let raw = slot.encode();
        self.ops
            .memcpy_persist(self.map.at(off), raw.as_ptr(), raw.len());
    }

    fn clear_info_slot_runtime(&self, lane: u64) {
        let off = self.geo.info_slot_off(lane);
        unsafe { std::ptr::write_bytes(self.map.at(off), 0, INFO_SLOT_SIZE as usize) };
    }
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.mgr.clear_info_slot_runtime(self.id);
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Recover every lane: replay or discard its redo log, then undo whatever
/// its info slot still records.
pub fn recover_all(map: &Mapping, ops: &dyn PersistOps, geo: &Geometry) {
    info!(lanes = geo.lane_count, "recovering lanes");
    for lane in 0..geo.lane_count {
        redo::recover(map, ops, geo.lane_redo_off(lane), LANE_REDO_CAPACITY);
        recover_info_slot(map, ops, geo, lane);
    }
}

fn read_info_slot(map: &Mapping, off: u64) -> [u8; INFO_SLOT_SIZE as usize] {
    let mut raw = [0u8; INFO_SLOT_SIZE as usize];
    let src = unsafe { std::slice::from_raw_parts(map.at(off), raw.len()) };
    raw.copy_from_slice(src);
    raw
}

fn recover_info_slot(map: &Mapping, ops: &dyn PersistOps, geo: &Geometry, lane: u64) {
    let off = geo.info_slot_off(lane);
    let raw = read_info_slot(map, off);
    if raw.iter().all(|&b| b == 0) {
        return;
    }
    let zero_slot = || ops.memset_persist(map.at(off), 0, INFO_SLOT_SIZE as usize);

    let slot = match InfoSlot::decode(&raw) {
        Some(slot) => slot,
        None => {
            warn!(lane, "info slot carries a garbage tag, discarding");
            zero_slot();
            return;
        }
    };

    let slot_word_valid = |p: u64| p != 0 && p % 8 == 0 && p + 8 <= geo.pool_size;

    match slot {
        // Interrupted while the slot itself was being cleared; finish that.
        InfoSlot::Unknown => zero_slot(),
        InfoSlot::Alloc { dst_off } => {
            // A zero destination means the slot write itself never finished.
            if slot_word_valid(dst_off) {
                let value = map.read_u64(dst_off);
                if value != 0 {
                    info!(lane, dst_off, "undoing interrupted allocation");
                    if set_block_used(map, ops, geo, value, false).is_ok() {
                        unsafe { std::ptr::write_volatile(map.u64_at(dst_off), 0) };
                        ops.persist(map.at(dst_off), 8);
                    }
                }
            }
            zero_slot();
        }
        InfoSlot::Realloc { dst_off, old_val } => {
            if slot_word_valid(dst_off) && old_val != 0 {
                let value = map.read_u64(dst_off);
                if value != 0 && value != old_val {
                    info!(lane, dst_off, "undoing interrupted reallocation");
                    if set_block_used(map, ops, geo, value, false).is_ok() {
                        unsafe { std::ptr::write_volatile(map.u64_at(dst_off), old_val) };
                        ops.persist(map.at(dst_off), 8);
                    }
                }
            }
            zero_slot();
        }
        InfoSlot::Free { free_off } => {
            if slot_word_valid(free_off) {
                let value = map.read_u64(free_off);
                if value != 0 {
                    info!(lane, free_off, "redoing USED after interrupted free");
                    let _ = set_block_used(map, ops, geo, value, true);
                }
            }
            zero_slot();
        }
    }
}

/// Flip the durable used state of the allocation whose data starts at
/// `data_off`: the USED flag for chunk spans, the bitmap bits for run units.
fn set_block_used(
    map: &Mapping,
    ops: &dyn PersistOps,
    geo: &Geometry,
    data_off: u64,
    used: bool,
) -> crate::core::error::Result<()> {
    let (zone, chunk, within) = geo.locate(data_off)?;
    let hdr_off = geo.chunk_header_off(zone, chunk);
    let hdr = ChunkHeader::unpack(map.read_u64(hdr_off));
    if !hdr.is_written() {
        warn!(data_off, "recovery target chunk was never written, skipping");
        return Err(crate::core::error::Error::invalid_argument("unwritten chunk"));
    }

    match hdr.chunk_type {
        CHUNK_TYPE_BASE => {
            let word = map.read_u64(hdr_off);
            let new = if used {
                word | CHUNK_WORD_USED
            } else {
                word & !CHUNK_WORD_USED
            };
            unsafe { std::ptr::write_volatile(map.u64_at(hdr_off), new) };
            ops.persist(map.at(hdr_off), 8);
            Ok(())
        }
        CHUNK_TYPE_RUN => {
            let data = geo.chunk_data_off(zone, chunk);
            let unit_word = map.read_u64(crate::heap::run::unit_word_off(data));
            let (unit, _, legacy) = crate::heap::run::unpack_unit_word(unit_word);
            let hdr_bytes = if legacy { ALLOC_HEADER_SIZE } else { 0 };
            if unit == 0 || within < RUN_DATA_OFF + hdr_bytes {
                return Err(crate::core::error::Error::invalid_argument("bad run offset"));
            }
            let rel = within - RUN_DATA_OFF - hdr_bytes;
            if rel % unit != 0 {
                return Err(crate::core::error::Error::invalid_argument("misaligned unit"));
            }
            let block_off = (rel / unit) as u32;
            let size_idx = if legacy {
                let size = map.read_u64(data_off - ALLOC_HEADER_SIZE);
                (size / unit).max(1) as u32
            } else {
                1
            };
            let (first, spill) = crate::heap::run::span_masks(block_off, size_idx);
            for (word, mask) in std::iter::once(first).chain(spill) {
                let off = crate::heap::run::bitmap_word_off(data, word);
                let cur = map.read_u64(off);
                let new = if used { cur | mask } else { cur & !mask };
                unsafe { std::ptr::write_volatile(map.u64_at(off), new) };
                ops.flush(map.at(off), 8);
            }
            ops.drain();
            Ok(())
        }
        _ => Err(crate::core::error::Error::invalid_argument(
            "recovery target is not an allocation chunk",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DEFAULT_LANE_COUNT, MIN_POOL_SIZE};
    use crate::pmem::CacheLineFlush;
    use memmap2::MmapMut;

    fn setup() -> (Arc<Mapping>, Arc<dyn PersistOps>, Geometry) {
        let map = Arc::new(Mapping::new(
            MmapMut::map_anon(MIN_POOL_SIZE as usize).unwrap(),
        ));
        let ops: Arc<dyn PersistOps> = Arc::new(CacheLineFlush);
        let geo = Geometry::new(MIN_POOL_SIZE, DEFAULT_LANE_COUNT).unwrap();
        (map, ops, geo)
    }

    #[test]
    fn test_hold_assigns_distinct_lanes() {
        let (map, ops, geo) = setup();
        let mgr = LaneManager::new(map, ops, geo);
        let a = mgr.hold();
        let b = mgr.hold();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_release_clears_info_slot() {
        let (map, ops, geo) = setup();
        let mgr = LaneManager::new(Arc::clone(&map), ops, geo);
        let lane = mgr.hold();
        let id = lane.id;
        mgr.set_info_slot(id, InfoSlot::Alloc { dst_off: 4096 });
        let raw = read_info_slot(&map, geo.info_slot_off(id));
        assert_eq!(InfoSlot::decode(&raw), Some(InfoSlot::Alloc { dst_off: 4096 }));
        drop(lane);
        let raw = read_info_slot(&map, geo.info_slot_off(id));
        assert_eq!(InfoSlot::decode(&raw), Some(InfoSlot::Unknown));
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_recover_discards_garbage_tag() {
        let (map, ops, geo) = setup();
        let off = geo.info_slot_off(0);
        unsafe { std::ptr::write_volatile(map.u64_at(off), 0xffff_ffff) };
        recover_info_slot(&map, ops.as_ref(), &geo, 0);
        assert!(read_info_slot(&map, off).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_recover_ignores_zero_destination() {
        let (map, ops, geo) = setup();
        let mgr = LaneManager::new(Arc::clone(&map), Arc::clone(&ops), geo);
        mgr.set_info_slot(0, InfoSlot::Alloc { dst_off: 0 });
        recover_info_slot(&map, ops.as_ref(), &geo, 0);
        assert!(read_info_slot(&map, geo.info_slot_off(0)).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_recover_alloc_undoes_chunk_allocation() {
        let (map, ops, geo) = setup();
        let mgr = LaneManager::new(Arc::clone(&map), Arc::clone(&ops), geo);

        // Build a used chunk 0 with a pointer slot inside chunk 1.
        let hdr = ChunkHeader {
            magic: crate::layout::CHUNK_HEADER_MAGIC,
            chunk_type: CHUNK_TYPE_BASE,
            flags: crate::layout::CHUNK_FLAG_USED,
            size_idx: 1,
        };
        unsafe {
            std::ptr::write_volatile(map.u64_at(geo.chunk_header_off(0, 0)), hdr.pack());
        }
        let data_off = geo.chunk_data_off(0, 0) + ALLOC_HEADER_SIZE;
        let slot_off = geo.chunk_data_off(0, 1);
        unsafe { std::ptr::write_volatile(map.u64_at(slot_off), data_off) };

        mgr.set_info_slot(0, InfoSlot::Alloc { dst_off: slot_off });
        recover_info_slot(&map, ops.as_ref(), &geo, 0);

        assert_eq!(map.read_u64(slot_off), 0);
        let hdr = ChunkHeader::unpack(map.read_u64(geo.chunk_header_off(0, 0)));
        assert!(!hdr.is_used());
    }

    #[test]
    fn test_recover_free_restores_used() {
        let (map, ops, geo) = setup();
        let mgr = LaneManager::new(Arc::clone(&map), Arc::clone(&ops), geo);

        let hdr = ChunkHeader {
            magic: crate::layout::CHUNK_HEADER_MAGIC,
            chunk_type: CHUNK_TYPE_BASE,
            flags: 0,
            size_idx: 1,
        };
        unsafe {
            std::ptr::write_volatile(map.u64_at(geo.chunk_header_off(0, 0)), hdr.pack());
        }
        let data_off = geo.chunk_data_off(0, 0) + ALLOC_HEADER_SIZE;
        let slot_off = geo.chunk_data_off(0, 1);
        unsafe { std::ptr::write_volatile(map.u64_at(slot_off), data_off) };

        mgr.set_info_slot(0, InfoSlot::Free { free_off: slot_off });
        recover_info_slot(&map, ops.as_ref(), &geo, 0);

        // The interrupted free is undone: the span is used again.
        let hdr = ChunkHeader::unpack(map.read_u64(geo.chunk_header_off(0, 0)));
        assert!(hdr.is_used());
        assert_eq!(map.read_u64(slot_off), data_off);
    }
}
