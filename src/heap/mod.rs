//! Heap façade: the persistent chunk-and-run allocator.
//!
//! The heap owns the single huge bucket, the shared per-class auxiliary
//! buckets, and per-lane bucket caches over them. An allocation picks a
//! class, reserves a block from a bucket, prepares its durable metadata in
//! memory, and commits everything through the lane's operation context so a
//! crash at any point leaves the operation either fully applied or fully
//! absent. Free is the mirror image plus neighbor coalescing and possible
//! run demotion.
//!
//! Volatile state is rebuilt lazily: zones are scanned into the buckets one
//! at a time, exactly when the huge bucket runs dry.

pub mod alloc_class;
pub mod bucket;
pub mod container;
pub mod memblock;
pub mod run;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace, warn};

use crate::core::config::HeapConfig;
use crate::core::error::{Error, HeapError, Result};
use crate::lane::{LaneGuard, LaneManager};
use crate::layout::{
    ChunkHeader, Geometry, InfoSlot, ALLOC_HEADER_SIZE, CHUNK_FLAG_ZEROED, CHUNK_HEADER_MAGIC,
    CHUNK_SIZE, CHUNK_TYPE_BASE, CHUNK_TYPE_RUN, CHUNK_WORD_USED, CHUNK_WORD_ZEROED, RUN_DATA_OFF,
};
use crate::memops::OperationContext;
use crate::pmem::{Mapping, PersistOps};
use crate::redo::{RedoOp, LANE_REDO_CAPACITY};

use alloc_class::{AllocClass, ClassTable, HeaderKind};
use bucket::Bucket;
use memblock::MemoryBlock;

/// Size of the shared chunk-run lock array
const CHUNK_LOCK_COUNT: usize = 1024;
/// Blocks moved per cache when draining into the auxiliary bucket
const DRAIN_BLOCKS_MAX: usize = 64;

/// Volatile heap counters, rebuilt on open.
#[derive(Default)]
pub struct HeapStats {
    allocated: AtomicU64,
    freed: AtomicU64,
}

#[derive(Clone)]
struct RunInfo {
    class: Arc<AllocClass>,
    owner: Arc<Bucket>,
}

/// A block reserved from a bucket plus the staged entries that will make it
/// durable; shared by alloc, and by realloc's relocation path.
struct PreparedBlock {
    block: MemoryBlock,
    user_off: u64,
    real_size: u64,
    header_bytes: u64,
    entries: Vec<(u64, u64, RedoOp)>,
    run_lock: Option<usize>,
}

/// The per-pool heap.
pub struct Heap {
    map: Arc<Mapping>,
    ops: Arc<dyn PersistOps>,
    geo: Geometry,
    lanes: LaneManager,
    huge: Arc<Bucket>,
    classes: RwLock<ClassTable>,
    aux: DashMap<u8, Arc<Bucket>>,
    caches: Vec<DashMap<u8, Arc<Bucket>>>,
    run_table: DashMap<(u16, u16), RunInfo>,
    chunk_locks: Vec<Mutex<()>>,
    zones_next: Mutex<u32>,
    stats: HeapStats,
}

impl Heap {
    /// Build the volatile heap over an already recovered pool image.
    pub fn new(
        map: Arc<Mapping>,
        ops: Arc<dyn PersistOps>,
        geo: Geometry,
        config: &HeapConfig,
    ) -> Self {
        let classes = if config.fail_no_matching_class {
            ClassTable::empty(config.class_granularity, config.class_limit, true)
        } else {
            ClassTable::with_defaults(config.class_granularity, config.class_limit)
        };
        let cache_count = if config.cache_count == 0 {
            num_cpus::get().max(1)
        } else {
            config.cache_count
        };
        Self {
            lanes: LaneManager::new(Arc::clone(&map), Arc::clone(&ops), geo),
            map,
            ops,
            geo,
            huge: Bucket::new_huge(),
            classes: RwLock::new(classes),
            aux: DashMap::new(),
            caches: (0..cache_count).map(|_| DashMap::new()).collect(),
            run_table: DashMap::new(),
            chunk_locks: (0..CHUNK_LOCK_COUNT).map(|_| Mutex::new(())).collect(),
            zones_next: Mutex::new(0),
            stats: HeapStats::default(),
        }
    }

    /// Pool geometry
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// The class table, exposed for the control surface.
    pub fn class_table(&self) -> &RwLock<ClassTable> {
        &self.classes
    }

    /// Bytes currently allocated among populated zones
    pub fn allocated_bytes(&self) -> u64 {
        self.stats.allocated.load(Ordering::Relaxed)
    }

    /// Bytes freed since open
    pub fn freed_bytes(&self) -> u64 {
        self.stats.freed.load(Ordering::Relaxed)
    }

    /// Zones whose volatile state has been rebuilt
    pub fn active_zones(&self) -> u64 {
        *self.zones_next.lock() as u64
    }

    /// Raw pointer for a pool offset; valid for this mapping only.
    #[inline]
    pub fn direct(&self, offset: u64) -> *mut u8 {
        self.map.at(offset)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes and publish the block's offset into `*slot`.
    ///
    /// The slot may live inside the pool (the usual case: some persistent
    /// pointer field) or in process memory; an in-pool slot is guarded by
    /// the lane's info slot so a crash mid-operation is undone on open.
    pub fn alloc(&self, slot: &mut u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid_argument("zero-size allocation"));
        }
        let class = self.classes.read().resolve(size)?;
        let lane = self.lanes.hold();
        let prepared = match class {
            None => self.prepare_huge_block(size)?,
            Some(class) => self.prepare_run_block(&class, size)?,
        };
        self.commit_alloc(&lane, prepared, slot)
    }

    /// Free the block `*slot` points at and durably zero the slot.
    pub fn free(&self, slot: &mut u64) -> Result<()> {
        let offset = *slot;
        if offset == 0 {
            return Err(Error::invalid_argument("freeing a null offset"));
        }
        let (zone, chunk, within) = self.geo.locate(offset)?;
        self.populate_up_to(zone)?;
        let hdr = self.chunk_header(zone, chunk);
        if !hdr.is_written() {
            return Err(Error::invalid_argument("offset outside any allocation"));
        }
        match hdr.chunk_type {
            CHUNK_TYPE_BASE => self.free_huge(slot, zone, chunk, within, hdr),
            CHUNK_TYPE_RUN => self.free_run(slot, zone, chunk, within),
            _ => Err(Error::invalid_argument("offset inside an unknown chunk")),
        }
    }

    /// Resize the allocation `*slot` points at.
    ///
    /// Shrinking within the current span is a no-op. Growth extends in place
    /// when the right neighbor of a huge allocation is free and large
    /// enough; otherwise the block is relocated with a single atomic pointer
    /// swap covering the copy and the free of the old block.
    pub fn realloc(&self, slot: &mut u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid_argument("zero-size reallocation"));
        }
        if *slot == 0 {
            return self.alloc(slot, size);
        }
        let old_off = *slot;
        let old_usable = self.usable_size(old_off)?;
        if size <= old_usable {
            return Ok(());
        }
        let (zone, chunk, _) = self.geo.locate(old_off)?;
        self.populate_up_to(zone)?;
        let hdr = self.chunk_header(zone, chunk);
        if hdr.chunk_type == CHUNK_TYPE_BASE {
            let lane = self.lanes.hold();
            if self.try_grow_huge(&lane, slot, zone, chunk, hdr, size)? {
                return Ok(());
            }
            drop(lane);
        }
        self.realloc_move(slot, size, old_usable)
    }

    /// Number of payload bytes of the allocation at `offset`.
    pub fn usable_size(&self, offset: u64) -> Result<u64> {
        let (zone, chunk, within) = self.geo.locate(offset)?;
        let hdr = self.chunk_header(zone, chunk);
        if !hdr.is_written() {
            return Err(Error::invalid_argument("offset outside any allocation"));
        }
        match hdr.chunk_type {
            CHUNK_TYPE_BASE => {
                if within != ALLOC_HEADER_SIZE {
                    return Err(Error::invalid_argument("not an allocation start"));
                }
                let real = self.map.read_u64(self.geo.chunk_data_off(zone, chunk));
                Ok(real - ALLOC_HEADER_SIZE)
            }
            CHUNK_TYPE_RUN => {
                let (legacy, unit, _) = self.run_unit(zone, chunk)?;
                let header_bytes = if legacy { ALLOC_HEADER_SIZE } else { 0 };
                if within < RUN_DATA_OFF + header_bytes {
                    return Err(Error::invalid_argument("offset inside run metadata"));
                }
                if legacy {
                    Ok(self.map.read_u64(offset - ALLOC_HEADER_SIZE) - ALLOC_HEADER_SIZE)
                } else {
                    Ok(unit)
                }
            }
            _ => Err(Error::invalid_argument("offset inside an unknown chunk")),
        }
    }

    /// Rebuild volatile state for every remaining zone; used before
    /// reporting statistics so the counts are exact.
    pub fn populate_all(&self) -> Result<()> {
        while self.populate_next_zone()? {}
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunk-level machinery
    // -----------------------------------------------------------------------

    fn chunk_header(&self, zone: u16, chunk: u32) -> ChunkHeader {
        ChunkHeader::unpack(self.map.read_u64(self.geo.chunk_header_off(zone, chunk)))
    }

    fn store_chunk_header(&self, zone: u16, chunk: u32, hdr: ChunkHeader) {
        let off = self.geo.chunk_header_off(zone, chunk);
        unsafe { std::ptr::write_volatile(self.map.u64_at(off), hdr.pack()) };
        self.ops.persist(self.map.at(off), 8);
    }

    /// Write a fresh header: everything first, the magic last, each step
    /// flushed, so a torn write can never produce a valid-looking header.
    fn write_chunk_header(&self, zone: u16, chunk: u32, size_idx: u32, flags: u8) {
        let mut hdr = ChunkHeader {
            magic: 0,
            chunk_type: CHUNK_TYPE_BASE,
            flags,
            size_idx,
        };
        self.store_chunk_header(zone, chunk, hdr);
        hdr.magic = CHUNK_HEADER_MAGIC;
        self.store_chunk_header(zone, chunk, hdr);
    }

    fn write_alloc_header(&self, header_off: u64, real_size: u64, chunk: u32, zone: u16) {
        unsafe {
            std::ptr::write_volatile(self.map.u64_at(header_off), real_size);
            std::ptr::write_volatile(
                self.map.u64_at(header_off + 8),
                chunk as u64 | (zone as u64) << 32,
            );
        }
        self.ops.persist(self.map.at(header_off), ALLOC_HEADER_SIZE as usize);
    }

    fn run_lock_index(&self, zone: u16, chunk: u16) -> usize {
        (zone as usize * crate::layout::MAX_CHUNK as usize + chunk as usize) % CHUNK_LOCK_COUNT
    }

    fn lock_run(&self, index: usize) -> MutexGuard<'_, ()> {
        self.chunk_locks[index].lock()
    }

    fn run_unit(&self, zone: u16, chunk: u32) -> Result<(bool, u64, u32)> {
        let word = self
            .map
            .read_u64(run::unit_word_off(self.geo.chunk_data_off(zone, chunk)));
        let (unit, nallocs, legacy) = run::unpack_unit_word(word);
        if unit == 0 || unit > CHUNK_SIZE || nallocs == 0 {
            return Err(Error::corrupt(format!(
                "run {zone}/{chunk} carries unit size {unit} with {nallocs} units"
            )));
        }
        Ok((legacy, unit, nallocs))
    }

    fn read_bitmap(&self, zone: u16, chunk: u32) -> [u64; crate::layout::RUN_BITMAP_WORDS] {
        let data = self.geo.chunk_data_off(zone, chunk);
        let mut words = [0u64; crate::layout::RUN_BITMAP_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.map.read_u64(run::bitmap_word_off(data, i));
        }
        words
    }

    /// Reserve `size_idx` contiguous chunks from the huge bucket, populating
    /// zones until one satisfies the request. Splits write the tail header
    /// first, then shrink the head, so recovery can never observe a span
    /// larger than reality.
    fn reserve_chunks(&self, size_idx: u32) -> Result<MemoryBlock> {
        loop {
            {
                let mut state = self.huge.lock();
                if let Some(mut block) = state.container.remove_bestfit(size_idx) {
                    if block.size_idx > size_idx {
                        let head = self.chunk_header(block.zone_id, block.chunk_id as u32);
                        let tail_chunk = block.chunk_id as u32 + size_idx;
                        self.write_chunk_header(
                            block.zone_id,
                            tail_chunk,
                            block.size_idx - size_idx,
                            head.flags & CHUNK_FLAG_ZEROED,
                        );
                        self.store_chunk_header(
                            block.zone_id,
                            block.chunk_id as u32,
                            ChunkHeader {
                                magic: CHUNK_HEADER_MAGIC,
                                chunk_type: CHUNK_TYPE_BASE,
                                flags: head.flags,
                                size_idx,
                            },
                        );
                        state.container.insert(MemoryBlock::chunks(
                            block.zone_id,
                            tail_chunk as u16,
                            block.size_idx - size_idx,
                        ));
                        block.size_idx = size_idx;
                    }
                    return Ok(block);
                }
            }
            if !self.populate_next_zone()? {
                return Err(Error::Heap(HeapError::OutOfMemory));
            }
        }
    }

    fn populate_up_to(&self, zone: u16) -> Result<()> {
        loop {
            if *self.zones_next.lock() > zone as u32 {
                return Ok(());
            }
            if !self.populate_next_zone()? {
                return Ok(());
            }
        }
    }

    /// Scan the next unpopulated zone into the volatile containers.
    fn populate_next_zone(&self) -> Result<bool> {
        let mut next = self.zones_next.lock();
        if *next >= self.geo.max_zone {
            return Ok(false);
        }
        let zone = *next as u16;
        let zone_chunks = self.geo.zone_size_idx(zone);
        debug!(zone, zone_chunks, "populating zone");

        let mut used_bytes = 0u64;
        let mut i = 0u32;
        while i < zone_chunks {
            let mut hdr = self.chunk_header(zone, i);
            if !hdr.is_written() {
                // Never-touched tail of the zone: one free span to the end.
                self.write_chunk_header(zone, i, zone_chunks - i, CHUNK_FLAG_ZEROED);
                hdr = self.chunk_header(zone, i);
            }
            if hdr.size_idx == 0 || i + hdr.size_idx > zone_chunks {
                warn!(zone, chunk = i, "inconsistent chunk header, zone scan stopped");
                break;
            }
            match hdr.chunk_type {
                CHUNK_TYPE_BASE => {
                    if hdr.is_used() {
                        used_bytes += hdr.size_idx as u64 * CHUNK_SIZE;
                    } else {
                        self.huge.lock().container.insert(MemoryBlock::chunks(
                            zone,
                            i as u16,
                            hdr.size_idx,
                        ));
                    }
                    i += hdr.size_idx;
                }
                CHUNK_TYPE_RUN => {
                    used_bytes += self.register_run(zone, i)?;
                    i += 1;
                }
                _ => {
                    warn!(zone, chunk = i, "unknown chunk type, zone scan stopped");
                    break;
                }
            }
        }
        self.stats.allocated.fetch_add(used_bytes, Ordering::Relaxed);
        *next += 1;
        crate::system::metrics::heap().active_zones.set(*next as i64);
        Ok(true)
    }

    /// Register an on-media run: adopt its class if none matches and insert
    /// its maximal free spans into the class's auxiliary bucket.
    fn register_run(&self, zone: u16, chunk: u32) -> Result<u64> {
        let (legacy, unit, nallocs) = match self.run_unit(zone, chunk) {
            Ok(v) => v,
            Err(e) => {
                warn!(zone, chunk, "skipping malformed run: {e}");
                return Ok(0);
            }
        };
        let kind = if legacy {
            HeaderKind::Legacy
        } else {
            HeaderKind::Compact
        };
        let class = self.classes.write().adopt(kind, unit, nallocs)?;
        let words = self.read_bitmap(zone, chunk);
        let aux = self.aux_bucket(&class);
        {
            let mut state = aux.lock();
            for (off, len) in class.bitmap.free_spans(&words) {
                state
                    .container
                    .insert(MemoryBlock::units(zone, chunk as u16, off as u16, len));
            }
        }
        self.run_table.insert(
            (zone, chunk as u16),
            RunInfo {
                class: Arc::clone(&class),
                owner: Arc::clone(&aux),
            },
        );
        Ok(class.bitmap.used_units(&words) as u64 * unit)
    }

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------

    fn aux_bucket(&self, class: &Arc<AllocClass>) -> Arc<Bucket> {
        self.aux
            .entry(class.id)
            .or_insert_with(|| Bucket::new_run(Arc::clone(class)))
            .clone()
    }

    /// Cache group of the calling thread; assignment is sticky so one
    /// thread keeps hitting the same buckets.
    fn cache_group(&self) -> usize {
        use std::cell::Cell;
        static NEXT_THREAD: AtomicU64 = AtomicU64::new(0);
        thread_local! {
            static CACHE_SLOT: Cell<Option<u64>> = const { Cell::new(None) };
        }
        let slot = CACHE_SLOT.with(|cell| match cell.get() {
            Some(slot) => slot,
            None => {
                let slot = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(slot));
                slot
            }
        });
        slot as usize % self.caches.len()
    }

    fn cache_bucket(&self, class: &Arc<AllocClass>) -> Arc<Bucket> {
        let group = &self.caches[self.cache_group()];
        group
            .entry(class.id)
            .or_insert_with(|| Bucket::new_run(Arc::clone(class)))
            .clone()
    }

    fn class_buckets(&self, class_id: u8) -> Vec<Arc<Bucket>> {
        let mut out = Vec::new();
        if let Some(b) = self.aux.get(&class_id) {
            out.push(b.clone());
        }
        for group in &self.caches {
            if let Some(b) = group.get(&class_id) {
                out.push(b.clone());
            }
        }
        out
    }

    /// Move free blocks from the per-lane caches into the auxiliary bucket.
    fn drain_to_auxiliary(&self, class: &Arc<AllocClass>, aux: &Arc<Bucket>) {
        let mut moved = Vec::new();
        for group in &self.caches {
            if let Some(bucket) = group.get(&class.id) {
                let bucket = bucket.clone();
                if Arc::ptr_eq(&bucket, aux) {
                    continue;
                }
                let mut state = bucket.lock();
                state.retire_active();
                while moved.len() < DRAIN_BLOCKS_MAX {
                    match state.container.remove_bestfit(1) {
                        Some(m) => moved.push(m),
                        None => break,
                    }
                }
            }
            if moved.len() >= DRAIN_BLOCKS_MAX {
                break;
            }
        }
        if !moved.is_empty() {
            trace!(class = class.id, blocks = moved.len(), "drained caches into auxiliary");
            let mut state = aux.lock();
            for m in moved {
                state.container.insert(m);
            }
        }
    }

    /// Reserve run units for a class: per-lane cache, then the shared
    /// auxiliary bucket, then a freshly promoted run, then whatever a cache
    /// drain surfaces. `Err(OutOfMemory)` only after all four fail.
    fn reserve_run_units(&self, class: &Arc<AllocClass>, size_idx: u32) -> Result<MemoryBlock> {
        let cache = self.cache_bucket(class);
        if let Some(m) = cache.lock().reserve_units(size_idx) {
            return Ok(m);
        }
        let aux = self.aux_bucket(class);
        if let Some(m) = aux.lock().reserve_units(size_idx) {
            return Ok(m);
        }
        if self.promote_run(class, &cache)? {
            if let Some(m) = cache.lock().reserve_units(size_idx) {
                return Ok(m);
            }
        }
        self.drain_to_auxiliary(class, &aux);
        let result = aux
            .lock()
            .reserve_units(size_idx)
            .ok_or(Error::Heap(HeapError::OutOfMemory));
        result
    }

    /// Promote a free chunk into a run for `class`, owned by `target`.
    ///
    /// The run metadata (unit word, bitmap with forced tail bits) becomes
    /// durable before the chunk header flips to RUN, so a crash in between
    /// leaves an ordinary free chunk.
    fn promote_run(&self, class: &Arc<AllocClass>, target: &Arc<Bucket>) -> Result<bool> {
        let block = match self.reserve_chunks(1) {
            Ok(block) => block,
            Err(Error::Heap(HeapError::OutOfMemory)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let zone = block.zone_id;
        let chunk = block.chunk_id as u32;
        let data = self.geo.chunk_data_off(zone, chunk);
        let head = self.chunk_header(zone, chunk);

        if !head.is_zeroed() {
            self.ops.memset_persist(self.map.at(data), 0, RUN_DATA_OFF as usize);
        }
        unsafe {
            std::ptr::write_volatile(
                self.map.u64_at(run::unit_word_off(data)),
                run::pack_unit_word(
                    class.unit_size,
                    class.bitmap.nallocs,
                    class.header == HeaderKind::Legacy,
                ),
            );
            if class.bitmap.lastval != 0 {
                std::ptr::write_volatile(
                    self.map
                        .u64_at(run::bitmap_word_off(data, class.bitmap.nval as usize - 1)),
                    class.bitmap.lastval,
                );
            }
        }
        self.ops.persist(self.map.at(data), RUN_DATA_OFF as usize);

        // Single crash-atomic store flips the chunk into a run.
        self.store_chunk_header(
            zone,
            chunk,
            ChunkHeader {
                magic: CHUNK_HEADER_MAGIC,
                chunk_type: CHUNK_TYPE_RUN,
                flags: 0,
                size_idx: 1,
            },
        );
        debug!(zone, chunk, class = class.id, "promoted chunk to run");

        self.run_table.insert(
            (zone, chunk as u16),
            RunInfo {
                class: Arc::clone(class),
                owner: Arc::clone(target),
            },
        );
        target.lock().container.insert(MemoryBlock::units(
            zone,
            chunk as u16,
            0,
            class.bitmap.nallocs,
        ));
        Ok(true)
    }

    /// Demote a fully-clear run back to a free chunk.
    ///
    /// Every container of the class is drained of the run's spans one bucket
    /// at a time; unless the drained units account for the whole run (some
    /// span is volatile-reserved by a concurrent allocator, or the run is a
    /// bucket's active source) the demotion is abandoned and the spans go to
    /// the auxiliary bucket.
    fn demote_run_if_empty(&self, lane: &LaneGuard<'_>, zone: u16, chunk: u16, info: &RunInfo) {
        let class = &info.class;
        let lock_idx = self.run_lock_index(zone, chunk);

        let mut drained: Vec<MemoryBlock> = Vec::new();
        let mut aborted = false;
        for bucket in self.class_buckets(class.id) {
            let mut state = bucket.lock();
            if state.is_active_run(zone, chunk) {
                aborted = true;
                break;
            }
            drained.extend(state.container.drain_chunk(zone, chunk));
        }
        let total: u64 = drained.iter().map(|m| m.size_idx as u64).sum();

        if !aborted && total == class.bitmap.nallocs as u64 {
            let run_lock = self.lock_run(lock_idx);
            if class.bitmap.is_fully_free(&self.read_bitmap(zone, chunk as u32)) {
                let mut ctx = OperationContext::new(
                    &self.map,
                    self.ops.as_ref(),
                    self.lanes.redo_off(lane.id),
                    LANE_REDO_CAPACITY,
                );
                ctx.add_entry(
                    self.map.u64_at(self.geo.chunk_header_off(zone, chunk as u32)),
                    ChunkHeader {
                        magic: CHUNK_HEADER_MAGIC,
                        chunk_type: CHUNK_TYPE_BASE,
                        flags: 0,
                        size_idx: 1,
                    }
                    .pack(),
                    RedoOp::Set,
                );
                ctx.process();
                self.run_table.remove(&(zone, chunk));
                drop(run_lock);
                debug!(zone, chunk, "demoted empty run");
                self.huge
                    .lock()
                    .container
                    .insert(MemoryBlock::chunks(zone, chunk, 1));
                return;
            }
            drop(run_lock);
        }

        // Not demotable right now; the spans continue life in the shared
        // auxiliary bucket.
        if !drained.is_empty() {
            let aux = self.aux_bucket(class);
            let mut state = aux.lock();
            for m in drained {
                state.container.insert(m);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Prepare/commit
    // -----------------------------------------------------------------------

    fn prepare_huge_block(&self, size: u64) -> Result<PreparedBlock> {
        let size_idx = (size + ALLOC_HEADER_SIZE).div_ceil(CHUNK_SIZE) as u32;
        let block = self.reserve_chunks(size_idx)?;
        let data = self.geo.chunk_data_off(block.zone_id, block.chunk_id as u32);
        let real_size = size_idx as u64 * CHUNK_SIZE;
        self.write_alloc_header(data, real_size, block.chunk_id as u32, block.zone_id);

        let hdr_off = self.geo.chunk_header_off(block.zone_id, block.chunk_id as u32);
        let hdr = self.chunk_header(block.zone_id, block.chunk_id as u32);
        let mut entries = vec![(hdr_off, CHUNK_WORD_USED, RedoOp::Or)];
        if hdr.is_zeroed() {
            entries.push((hdr_off, !CHUNK_WORD_ZEROED, RedoOp::And));
        }
        Ok(PreparedBlock {
            block,
            user_off: data + ALLOC_HEADER_SIZE,
            real_size,
            header_bytes: ALLOC_HEADER_SIZE,
            entries,
            run_lock: None,
        })
    }

    fn prepare_run_block(&self, class: &Arc<AllocClass>, size: u64) -> Result<PreparedBlock> {
        let size_idx = class.calc_units(size)?;
        let block = self.reserve_run_units(class, size_idx)?;
        let data = self.geo.chunk_data_off(block.zone_id, block.chunk_id as u32);
        let legacy = class.header == HeaderKind::Legacy;
        let user_off = run::unit_data_off(data, class.unit_size, block.block_off as u32, legacy);
        let real_size = class.real_size(size_idx);
        if legacy {
            self.write_alloc_header(
                user_off - ALLOC_HEADER_SIZE,
                real_size,
                block.chunk_id as u32,
                block.zone_id,
            );
        }
        let (first, spill) = run::span_masks(block.block_off as u32, size_idx);
        let entries = std::iter::once(first)
            .chain(spill)
            .map(|(word, mask)| (run::bitmap_word_off(data, word), mask, RedoOp::Or))
            .collect();
        Ok(PreparedBlock {
            block,
            user_off,
            real_size,
            header_bytes: class.header_size(),
            entries,
            run_lock: Some(self.run_lock_index(block.zone_id, block.chunk_id)),
        })
    }

    /// Return a reserved-but-uncommitted block to its container.
    fn unreserve(&self, prepared: &PreparedBlock) {
        let block = prepared.block;
        if prepared.run_lock.is_some() {
            if let Some(info) = self.run_table.get(&(block.zone_id, block.chunk_id)) {
                let owner = Arc::clone(&info.owner);
                drop(info);
                owner.lock().container.insert(block);
                return;
            }
        }
        self.huge.lock().container.insert(block);
    }

    /// Commit a prepared block: guard the destination slot, stage the
    /// metadata entries plus the pointer publication, process.
    fn commit_alloc(&self, lane: &LaneGuard<'_>, prepared: PreparedBlock, slot: &mut u64) -> Result<()> {
        let slot_ptr = slot as *mut u64;
        let persistent_slot = self.map.contains_ptr(slot_ptr as *const u8);

        let _run_lock = prepared.run_lock.map(|idx| self.lock_run(idx));
        if persistent_slot {
            self.lanes.set_info_slot(
                lane.id,
                InfoSlot::Alloc {
                    dst_off: self.map.offset_of(slot_ptr as *const u8),
                },
            );
        }

        let mut ctx = OperationContext::new(
            &self.map,
            self.ops.as_ref(),
            self.lanes.redo_off(lane.id),
            LANE_REDO_CAPACITY,
        );
        if let Err(e) = ctx.reserve(prepared.entries.len() + 2) {
            self.unreserve(&prepared);
            return Err(e);
        }
        for &(off, value, op) in &prepared.entries {
            ctx.add_entry(self.map.u64_at(off), value, op);
        }
        ctx.add_entry(slot_ptr, prepared.user_off, RedoOp::Set);
        if persistent_slot {
            ctx.add_entry(self.lanes.info_slot_word(lane.id), 0, RedoOp::Set);
        }
        ctx.process();

        self.stats
            .allocated
            .fetch_add(prepared.real_size, Ordering::Relaxed);
        let metrics = crate::system::metrics::heap();
        metrics.allocs_total.inc();
        metrics
            .allocated_bytes
            .set(self.stats.allocated.load(Ordering::Relaxed) as i64);
        trace!(offset = prepared.user_off, size = prepared.real_size, "allocated block");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Free paths
    // -----------------------------------------------------------------------

    fn free_huge(
        &self,
        slot: &mut u64,
        zone: u16,
        chunk: u32,
        within: u64,
        hdr: ChunkHeader,
    ) -> Result<()> {
        if within != ALLOC_HEADER_SIZE {
            return Err(Error::invalid_argument("not an allocation start"));
        }
        if !hdr.is_used() {
            tracing::error!(zone, chunk, "double free of chunk span");
            if cfg!(debug_assertions) {
                std::process::abort();
            }
            return Err(Error::Heap(HeapError::DoubleFree));
        }
        let real_size = hdr.size_idx as u64 * CHUNK_SIZE;
        let lane = self.lanes.hold();
        let slot_ptr = slot as *mut u64;
        let persistent_slot = self.map.contains_ptr(slot_ptr as *const u8);

        {
            let mut state = self.huge.lock();

            // Coalesce with free neighbors. The left neighbor is found by
            // tiling headers from the zone start: interior headers carry
            // stale data, the tiling only ever lands on real ones.
            let mut start = chunk;
            let mut total = hdr.size_idx;
            let mut j = 0u32;
            while j < chunk {
                let h = self.chunk_header(zone, j);
                let span = h.size_idx.max(1);
                if j + span == chunk
                    && h.chunk_type == CHUNK_TYPE_BASE
                    && !h.is_used()
                    && state
                        .container
                        .remove_exact(&MemoryBlock::chunks(zone, j as u16, span))
                {
                    start = j;
                    total += span;
                }
                j += span;
            }
            let right = chunk + hdr.size_idx;
            if right < self.geo.zone_size_idx(zone) {
                let rh = self.chunk_header(zone, right);
                if rh.is_written()
                    && rh.chunk_type == CHUNK_TYPE_BASE
                    && !rh.is_used()
                    && state
                        .container
                        .remove_exact(&MemoryBlock::chunks(zone, right as u16, rh.size_idx))
                {
                    total += rh.size_idx;
                }
            }

            if persistent_slot {
                self.lanes.set_info_slot(
                    lane.id,
                    InfoSlot::Free {
                        free_off: self.map.offset_of(slot_ptr as *const u8),
                    },
                );
            }
            let mut ctx = OperationContext::new(
                &self.map,
                self.ops.as_ref(),
                self.lanes.redo_off(lane.id),
                LANE_REDO_CAPACITY,
            );
            ctx.reserve(3)?;
            ctx.add_entry(slot_ptr, 0, RedoOp::Set);
            ctx.add_entry(
                self.map.u64_at(self.geo.chunk_header_off(zone, start)),
                ChunkHeader {
                    magic: CHUNK_HEADER_MAGIC,
                    chunk_type: CHUNK_TYPE_BASE,
                    flags: 0,
                    size_idx: total,
                }
                .pack(),
                RedoOp::Set,
            );
            if persistent_slot {
                ctx.add_entry(self.lanes.info_slot_word(lane.id), 0, RedoOp::Set);
            }
            ctx.process();

            state
                .container
                .insert(MemoryBlock::chunks(zone, start as u16, total));
        }

        self.record_free(real_size);
        Ok(())
    }

    fn free_run(&self, slot: &mut u64, zone: u16, chunk: u32, within: u64) -> Result<()> {
        let info = self
            .run_table
            .get(&(zone, chunk as u16))
            .map(|r| r.clone())
            .ok_or_else(|| Error::corrupt(format!("run {zone}/{chunk} is not registered")))?;
        let class = &info.class;
        let legacy = class.header == HeaderKind::Legacy;
        let header_bytes = if legacy { ALLOC_HEADER_SIZE } else { 0 };

        if within < RUN_DATA_OFF + header_bytes {
            return Err(Error::invalid_argument("offset inside run metadata"));
        }
        let rel = within - RUN_DATA_OFF - header_bytes;
        if rel % class.unit_size != 0 {
            return Err(Error::invalid_argument("misaligned run offset"));
        }
        let block_off = (rel / class.unit_size) as u32;
        let offset = *slot;
        let size_idx = if legacy {
            let real = self.map.read_u64(offset - ALLOC_HEADER_SIZE);
            (real / class.unit_size).max(1) as u32
        } else {
            1
        };
        if block_off + size_idx > class.bitmap.nallocs {
            return Err(Error::invalid_argument("span beyond the run"));
        }
        let real_size = class.real_size(size_idx);

        let lane = self.lanes.hold();
        let slot_ptr = slot as *mut u64;
        let persistent_slot = self.map.contains_ptr(slot_ptr as *const u8);
        let data = self.geo.chunk_data_off(zone, chunk);

        {
            let mut state = info.owner.lock();
            let _run_lock = self.lock_run(self.run_lock_index(zone, chunk as u16));

            // Reject a double free before anything durable happens.
            let (first, spill) = run::span_masks(block_off, size_idx);
            for (word, mask) in std::iter::once(first).chain(spill) {
                let current = self.map.read_u64(run::bitmap_word_off(data, word));
                if current & mask != mask {
                    tracing::error!(zone, chunk, block_off, "double free of run units");
                    if cfg!(debug_assertions) {
                        std::process::abort();
                    }
                    return Err(Error::Heap(HeapError::DoubleFree));
                }
            }

            if persistent_slot {
                self.lanes.set_info_slot(
                    lane.id,
                    InfoSlot::Free {
                        free_off: self.map.offset_of(slot_ptr as *const u8),
                    },
                );
            }
            let mut ctx = OperationContext::new(
                &self.map,
                self.ops.as_ref(),
                self.lanes.redo_off(lane.id),
                LANE_REDO_CAPACITY,
            );
            ctx.reserve(4)?;
            ctx.add_entry(slot_ptr, 0, RedoOp::Set);
            for (word, mask) in std::iter::once(first).chain(spill) {
                ctx.add_entry(self.map.u64_at(run::bitmap_word_off(data, word)), !mask, RedoOp::And);
            }
            if persistent_slot {
                ctx.add_entry(self.lanes.info_slot_word(lane.id), 0, RedoOp::Set);
            }
            ctx.process();

            state.container.insert(MemoryBlock::units(
                zone,
                chunk as u16,
                block_off as u16,
                size_idx,
            ));
        }

        // Demotion check runs with no bucket lock held.
        if class
            .bitmap
            .is_fully_free(&self.read_bitmap(zone, chunk))
        {
            self.demote_run_if_empty(&lane, zone, chunk as u16, &info);
        }

        self.record_free(real_size);
        Ok(())
    }

    fn record_free(&self, real_size: u64) {
        self.stats.freed.fetch_add(real_size, Ordering::Relaxed);
        self.stats.allocated.fetch_sub(real_size, Ordering::Relaxed);
        let metrics = crate::system::metrics::heap();
        metrics.frees_total.inc();
        metrics
            .allocated_bytes
            .set(self.stats.allocated.load(Ordering::Relaxed) as i64);
        metrics.freed_bytes.set(self.stats.freed.load(Ordering::Relaxed) as i64);
    }

    // -----------------------------------------------------------------------
    // Realloc paths
    // -----------------------------------------------------------------------

    /// In-place growth of a huge allocation into its free right neighbor.
    fn try_grow_huge(
        &self,
        lane: &LaneGuard<'_>,
        slot: &mut u64,
        zone: u16,
        chunk: u32,
        hdr: ChunkHeader,
        size: u64,
    ) -> Result<bool> {
        let old_idx = hdr.size_idx;
        let new_idx = (size + ALLOC_HEADER_SIZE).div_ceil(CHUNK_SIZE) as u32;
        let need = new_idx - old_idx;
        let right = chunk + old_idx;
        if right >= self.geo.zone_size_idx(zone) {
            return Ok(false);
        }

        let mut state = self.huge.lock();
        let rh = self.chunk_header(zone, right);
        if !rh.is_written()
            || rh.chunk_type != CHUNK_TYPE_BASE
            || rh.is_used()
            || rh.size_idx < need
            || !state
                .container
                .remove_exact(&MemoryBlock::chunks(zone, right as u16, rh.size_idx))
        {
            return Ok(false);
        }
        if rh.size_idx > need {
            let tail = right + need;
            self.write_chunk_header(zone, tail, rh.size_idx - need, rh.flags & CHUNK_FLAG_ZEROED);
            state
                .container
                .insert(MemoryBlock::chunks(zone, tail as u16, rh.size_idx - need));
        }

        let slot_ptr = slot as *mut u64;
        let persistent_slot = self.map.contains_ptr(slot_ptr as *const u8);
        if persistent_slot {
            self.lanes.set_info_slot(
                lane.id,
                InfoSlot::Realloc {
                    dst_off: self.map.offset_of(slot_ptr as *const u8),
                    old_val: *slot,
                },
            );
        }

        let new_real = new_idx as u64 * CHUNK_SIZE;
        let mut ctx = OperationContext::new(
            &self.map,
            self.ops.as_ref(),
            self.lanes.redo_off(lane.id),
            LANE_REDO_CAPACITY,
        );
        ctx.reserve(3)?;
        ctx.add_entry(
            self.map.u64_at(self.geo.chunk_header_off(zone, chunk)),
            ChunkHeader {
                magic: CHUNK_HEADER_MAGIC,
                chunk_type: CHUNK_TYPE_BASE,
                flags: hdr.flags & !CHUNK_FLAG_ZEROED,
                size_idx: new_idx,
            }
            .pack(),
            RedoOp::Set,
        );
        ctx.add_entry(
            self.map.u64_at(self.geo.chunk_data_off(zone, chunk)),
            new_real,
            RedoOp::Set,
        );
        if persistent_slot {
            ctx.add_entry(self.lanes.info_slot_word(lane.id), 0, RedoOp::Set);
        }
        ctx.process();
        drop(state);

        self.stats
            .allocated
            .fetch_add(need as u64 * CHUNK_SIZE, Ordering::Relaxed);
        crate::system::metrics::heap().reallocs_total.inc();
        debug!(zone, chunk, old_idx, new_idx, "grew allocation in place");
        Ok(true)
    }

    /// Relocate an allocation: reserve a new block, copy the payload, then
    /// swap the pointer, mark the new block used and the old one free in one
    /// processed context.
    fn realloc_move(&self, slot: &mut u64, size: u64, old_usable: u64) -> Result<()> {
        let old_off = *slot;
        let (old_zone, old_chunk, old_within) = self.geo.locate(old_off)?;
        let old_hdr = self.chunk_header(old_zone, old_chunk);

        let class = self.classes.read().resolve(size)?;
        let lane = self.lanes.hold();
        let prepared = match class {
            None => self.prepare_huge_block(size)?,
            Some(class) => self.prepare_run_block(&class, size)?,
        };

        // Payload copy happens before the commit; the target region is only
        // volatile-reserved, so a crash here changes nothing durable.
        let copy_len = old_usable.min(prepared.real_size - prepared.header_bytes);
        self.ops.memcpy_persist(
            self.map.at(prepared.user_off),
            self.map.at(old_off),
            copy_len as usize,
        );

        let slot_ptr = slot as *mut u64;
        let persistent_slot = self.map.contains_ptr(slot_ptr as *const u8);

        // Old-block release entries.
        let mut release: Vec<(u64, u64, RedoOp)> = Vec::new();
        let mut old_run: Option<(RunInfo, MemoryBlock)> = None;
        let old_real;
        match old_hdr.chunk_type {
            CHUNK_TYPE_BASE => {
                old_real = old_hdr.size_idx as u64 * CHUNK_SIZE;
                release.push((
                    self.geo.chunk_header_off(old_zone, old_chunk),
                    !CHUNK_WORD_USED,
                    RedoOp::And,
                ));
            }
            CHUNK_TYPE_RUN => {
                let info = self
                    .run_table
                    .get(&(old_zone, old_chunk as u16))
                    .map(|r| r.clone())
                    .ok_or_else(|| Error::corrupt("unregistered run"))?;
                let legacy = info.class.header == HeaderKind::Legacy;
                let header_bytes = if legacy { ALLOC_HEADER_SIZE } else { 0 };
                let rel = old_within - RUN_DATA_OFF - header_bytes;
                let block_off = (rel / info.class.unit_size) as u32;
                let size_idx = if legacy {
                    (self.map.read_u64(old_off - ALLOC_HEADER_SIZE) / info.class.unit_size).max(1)
                        as u32
                } else {
                    1
                };
                old_real = info.class.real_size(size_idx);
                let data = self.geo.chunk_data_off(old_zone, old_chunk);
                let (first, spill) = run::span_masks(block_off, size_idx);
                for (word, mask) in std::iter::once(first).chain(spill) {
                    release.push((run::bitmap_word_off(data, word), !mask, RedoOp::And));
                }
                old_run = Some((
                    info,
                    MemoryBlock::units(old_zone, old_chunk as u16, block_off as u16, size_idx),
                ));
            }
            _ => return Err(Error::invalid_argument("offset inside an unknown chunk")),
        }

        // Lock the affected runs in index order.
        let old_lock_idx = old_run
            .as_ref()
            .map(|_| self.run_lock_index(old_zone, old_chunk as u16));
        let guards = self.lock_run_pair(prepared.run_lock, old_lock_idx);

        if persistent_slot {
            self.lanes.set_info_slot(
                lane.id,
                InfoSlot::Realloc {
                    dst_off: self.map.offset_of(slot_ptr as *const u8),
                    old_val: old_off,
                },
            );
        }
        let mut ctx = OperationContext::new(
            &self.map,
            self.ops.as_ref(),
            self.lanes.redo_off(lane.id),
            LANE_REDO_CAPACITY,
        );
        if let Err(e) = ctx.reserve(prepared.entries.len() + release.len() + 2) {
            drop(guards);
            self.unreserve(&prepared);
            return Err(e);
        }
        for &(off, value, op) in prepared.entries.iter().chain(release.iter()) {
            ctx.add_entry(self.map.u64_at(off), value, op);
        }
        ctx.add_entry(slot_ptr, prepared.user_off, RedoOp::Set);
        if persistent_slot {
            ctx.add_entry(self.lanes.info_slot_word(lane.id), 0, RedoOp::Set);
        }
        ctx.process();
        drop(guards);

        // Volatile bookkeeping for the released block.
        match old_run {
            None => {
                self.huge.lock().container.insert(MemoryBlock::chunks(
                    old_zone,
                    old_chunk as u16,
                    old_hdr.size_idx,
                ));
            }
            Some((info, block)) => {
                info.owner.lock().container.insert(block);
                if info
                    .class
                    .bitmap
                    .is_fully_free(&self.read_bitmap(old_zone, old_chunk))
                {
                    self.demote_run_if_empty(&lane, old_zone, old_chunk as u16, &info);
                }
            }
        }

        self.stats
            .allocated
            .fetch_add(prepared.real_size, Ordering::Relaxed);
        self.stats.freed.fetch_add(old_real, Ordering::Relaxed);
        self.stats.allocated.fetch_sub(old_real, Ordering::Relaxed);
        crate::system::metrics::heap().reallocs_total.inc();
        debug!(old_off, new_off = prepared.user_off, "relocated allocation");
        Ok(())
    }

    fn lock_run_pair(
        &self,
        a: Option<usize>,
        b: Option<usize>,
    ) -> (Option<MutexGuard<'_, ()>>, Option<MutexGuard<'_, ()>>) {
        match (a, b) {
            (Some(x), Some(y)) if x == y => (Some(self.lock_run(x)), None),
            (Some(x), Some(y)) if x < y => {
                let first = self.lock_run(x);
                let second = self.lock_run(y);
                (Some(first), Some(second))
            }
            (Some(x), Some(y)) => {
                let first = self.lock_run(y);
                let second = self.lock_run(x);
                (Some(second), Some(first))
            }
            (Some(x), None) => (Some(self.lock_run(x)), None),
            (None, Some(y)) => (None, Some(self.lock_run(y))),
            (None, None) => (None, None),
        }
    }
}
