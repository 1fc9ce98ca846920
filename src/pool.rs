//! Pool lifecycle: create, open, close, and the consistency check.
//!
//! The pool owns the file mapping and the durability backend. Open drives
//! recovery: pick a valid header (primary or any zone backup), reject
//! incompatible pools, and if the pool was left OPEN by a crash, replay or
//! discard every lane's redo log and undo whatever the info slots still
//! record. Dropping a `Pool` without calling [`Pool::close`] deliberately
//! leaves the durable state OPEN, which is exactly what a crash looks like
//! to the next opener.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapMut;
use tracing::{info, warn};

use crate::core::config::{Config, HeapConfig};
use crate::core::error::{Error, PoolError, Result};
use crate::ctl::{self, CtlValue};
use crate::heap::Heap;
use crate::lane;
use crate::layout::{
    ChunkHeader, Geometry, PoolHeader, CHUNK_TYPE_BASE, CHUNK_TYPE_RUN, DEFAULT_LANE_COUNT,
    INFO_SLOT_ALLOC, INFO_SLOT_FREE, INFO_SLOT_REALLOC, INFO_SLOT_SIZE, INFO_SLOT_UNKNOWN,
    MIN_POOL_SIZE, POOL_FLAG_PAGE_GRANULAR, POOL_HEADER_SIZE, POOL_MAJOR, POOL_STATE_CLOSED,
    POOL_STATE_OPEN,
};
use crate::pmem::{select_backend, Mapping, PersistOps};
use crate::redo::{self, LANE_REDO_CAPACITY};

/// Options for creating or opening a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Pool size in bytes (create only)
    pub size: u64,
    /// Lane / info-slot count (create only; durably recorded)
    pub lane_count: u64,
    /// Reject page-granular mappings
    pub require_byte_granularity: bool,
    /// Heap tuning
    pub heap: HeapConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 64 * 1024 * 1024,
            lane_count: DEFAULT_LANE_COUNT,
            require_byte_granularity: false,
            heap: HeapConfig::default(),
        }
    }
}

impl From<&Config> for PoolOptions {
    fn from(config: &Config) -> Self {
        Self {
            size: config.pool.size,
            lane_count: config.pool.lane_count,
            require_byte_granularity: config.pool.require_byte_granularity,
            heap: config.heap.clone(),
        }
    }
}

/// An open pool: mapping, durability backend, and the heap over them.
pub struct Pool {
    map: Arc<Mapping>,
    ops: Arc<dyn PersistOps>,
    geo: Geometry,
    heap: Heap,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("geo", &self.geo).finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a fresh pool file and open it.
    pub fn create(path: impl AsRef<Path>, options: &PoolOptions) -> Result<Pool> {
        if options.size < MIN_POOL_SIZE {
            return Err(Error::Pool(PoolError::TooSmall {
                size: options.size,
                min: MIN_POOL_SIZE,
            }));
        }
        if options.lane_count == 0 || !options.lane_count.is_power_of_two() {
            return Err(Error::config("lane_count must be a nonzero power of two"));
        }
        let geo = Geometry::new(options.size, options.lane_count)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(options.size)?;
        let map = Arc::new(Mapping::new(unsafe { MmapMut::map_mut(&file)? }));
        let ops = select_backend(&map);
        Self::check_granularity(&map, options)?;

        // Fresh layout: zeroed slots and lanes, then the primary header and
        // its backups, all in CLOSED state.
        ops.memset_persist(
            map.at(POOL_HEADER_SIZE),
            0,
            (geo.heap_start - POOL_HEADER_SIZE) as usize,
        );
        let mut header = PoolHeader::new(options.size, options.lane_count, map.page_granular());
        header.seal();
        ops.memcpy_persist(map.at(0), header.as_bytes().as_ptr(), POOL_HEADER_SIZE as usize);
        write_backup_headers(&map, ops.as_ref(), &geo);

        set_pool_state(&map, ops.as_ref(), &geo, POOL_STATE_OPEN);
        info!(
            path = %path.as_ref().display(),
            size = options.size,
            lanes = options.lane_count,
            "created pool"
        );
        Ok(Pool {
            heap: Heap::new(Arc::clone(&map), Arc::clone(&ops), geo, &options.heap),
            map,
            ops,
            geo,
        })
    }

    /// Open an existing pool, recovering it if it was not closed cleanly.
    pub fn open(path: impl AsRef<Path>, options: &PoolOptions) -> Result<Pool> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let size = file.metadata()?.len();
        let map = Arc::new(Mapping::new(unsafe { MmapMut::map_mut(&file)? }));
        let ops = select_backend(&map);

        let header = read_valid_header(&map, ops.as_ref(), size)?;
        let geo = Geometry::new(size, header.lane_count)?;
        can_open_pool(&header, size)?;
        Self::check_granularity(&map, options)?;
        if options.require_byte_granularity && header.flags & POOL_FLAG_PAGE_GRANULAR != 0 {
            return Err(Error::Heap(crate::core::error::HeapError::GranularityMismatch));
        }

        match header.state {
            POOL_STATE_CLOSED => {
                #[cfg(debug_assertions)]
                for lane in 0..geo.lane_count {
                    debug_assert_eq!(
                        map.read_u64(geo.info_slot_off(lane)) as u32,
                        INFO_SLOT_UNKNOWN,
                        "closed pool carries an in-flight info slot"
                    );
                }
                set_pool_state(&map, ops.as_ref(), &geo, POOL_STATE_OPEN);
            }
            POOL_STATE_OPEN => {
                info!(path = %path.as_ref().display(), "pool was not closed cleanly, recovering");
                lane::recover_all(&map, ops.as_ref(), &geo);
                write_backup_headers(&map, ops.as_ref(), &geo);
            }
            state => {
                return Err(Error::corrupt(format!("unknown pool state {state}")));
            }
        }

        info!(path = %path.as_ref().display(), size, "opened pool");
        Ok(Pool {
            heap: Heap::new(Arc::clone(&map), Arc::clone(&ops), geo, &options.heap),
            map,
            ops,
            geo,
        })
    }

    fn check_granularity(map: &Arc<Mapping>, options: &PoolOptions) -> Result<()> {
        if options.require_byte_granularity && map.page_granular() {
            return Err(Error::Heap(crate::core::error::HeapError::GranularityMismatch));
        }
        Ok(())
    }

    /// The heap over this pool.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Pool geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Read a control node.
    pub fn ctl_get(&self, name: &str) -> Result<CtlValue> {
        ctl::ctl_get(&self.heap, name)
    }

    /// Write a control node.
    pub fn ctl_set(&self, name: &str, value: &CtlValue) -> Result<()> {
        ctl::ctl_set(&self.heap, name, value)
    }

    /// Close the pool cleanly: durable CLOSED state in the primary header
    /// and every backup.
    pub fn close(self) -> Result<()> {
        set_pool_state(&self.map, self.ops.as_ref(), &self.geo, POOL_STATE_CLOSED);
        info!("closed pool");
        Ok(())
    }

    /// Offline consistency check of a pool file.
    ///
    /// Validates headers, info slots, zone chunk-header tiling and every
    /// lane's redo log offsets. Returns the first inconsistency found.
    pub fn check(path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let size = file.metadata()?.len();
        let map = Mapping::new(unsafe { MmapMut::map_mut(&file)? });

        let primary = read_header_at(&map, 0);
        let (header, primary_valid) = if primary.verify() {
            (primary, true)
        } else {
            let recovered = scan_backup_headers(&map, size)
                .ok_or_else(|| Error::corrupt("no valid pool header, primary or backup"))?;
            (recovered, false)
        };
        if !primary_valid {
            warn!("primary header invalid, a backup still validates");
        }
        let geo = Geometry::new(size, header.lane_count)?;
        can_open_pool(&header, size)?;

        for lane in 0..geo.lane_count {
            check_info_slot(&map, &geo, lane)?;
            redo::check(&map, geo.lane_redo_off(lane), LANE_REDO_CAPACITY)?;
        }
        for zone in 0..geo.max_zone as u16 {
            check_zone(&map, &geo, zone)?;
        }
        Ok(())
    }
}

fn read_header_at(map: &Mapping, offset: u64) -> PoolHeader {
    unsafe { std::ptr::read(map.at(offset) as *const PoolHeader) }
}

/// Find a valid backup header without knowing the lane count: probe every
/// plausible geometry and verify the candidate backup's checksum.
fn scan_backup_headers(map: &Mapping, size: u64) -> Option<PoolHeader> {
    let mut lane_count = 1u64;
    while lane_count <= 1 << 20 {
        if let Ok(geo) = Geometry::new(size, lane_count) {
            for zone in 0..geo.max_zone as u16 {
                let candidate = read_header_at(map, geo.zone_off(zone));
                if candidate.verify() && candidate.lane_count == lane_count {
                    return Some(candidate);
                }
            }
        }
        lane_count <<= 1;
    }
    None
}

/// Recover or reject the primary header.
fn read_valid_header(map: &Mapping, ops: &dyn PersistOps, size: u64) -> Result<PoolHeader> {
    let primary = read_header_at(map, 0);
    if primary.verify() {
        return Ok(primary);
    }
    let recovered = scan_backup_headers(map, size)
        .ok_or_else(|| Error::corrupt("no valid pool header, primary or backup"))?;
    warn!("primary pool header invalid, restored from a zone backup");
    ops.memcpy_persist(
        map.at(0),
        recovered.as_bytes().as_ptr(),
        POOL_HEADER_SIZE as usize,
    );
    Ok(recovered)
}

/// Reject pools this build cannot operate on.
fn can_open_pool(header: &PoolHeader, size: u64) -> Result<()> {
    let reject = |what: &str| -> Result<()> {
        Err(Error::Pool(PoolError::Incompatible(what.to_string())))
    };
    if header.size != size {
        return reject("recorded pool size does not match the file");
    }
    if header.major != POOL_MAJOR {
        return reject("pool was created by an incompatible format version");
    }
    if header.chunk_size != crate::layout::CHUNK_SIZE {
        return reject("pool was created with a different chunk size");
    }
    if header.chunks_per_zone != crate::layout::MAX_CHUNK {
        return reject("pool was created with a different chunks-per-zone");
    }
    if header.lane_count == 0 || !header.lane_count.is_power_of_two() {
        return reject("pool records an invalid lane count");
    }
    Ok(())
}

/// Change the pool state: primary first, then waterfall into every backup.
fn set_pool_state(map: &Mapping, ops: &dyn PersistOps, geo: &Geometry, state: u32) {
    let mut header = read_header_at(map, 0);
    header.state = state;
    header.seal();
    ops.memcpy_persist(map.at(0), header.as_bytes().as_ptr(), POOL_HEADER_SIZE as usize);
    write_backup_headers(map, ops, geo);
}

fn write_backup_headers(map: &Mapping, ops: &dyn PersistOps, geo: &Geometry) {
    for zone in 0..geo.max_zone as u16 {
        ops.memcpy_persist(
            map.at(geo.zone_off(zone)),
            map.at(0),
            POOL_HEADER_SIZE as usize,
        );
    }
}

fn check_info_slot(map: &Mapping, geo: &Geometry, lane: u64) -> Result<()> {
    let off = geo.info_slot_off(lane);
    let raw: &[u8] = unsafe { std::slice::from_raw_parts(map.at(off), INFO_SLOT_SIZE as usize) };
    let tag = u32::from_le_bytes(raw[..4].try_into().unwrap());
    let word = |at: usize| u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
    let in_pool = |p: u64| p <= geo.pool_size;
    let corrupt = |msg: String| -> Result<()> { Err(Error::corrupt(msg)) };

    match tag {
        INFO_SLOT_UNKNOWN => Ok(()),
        INFO_SLOT_ALLOC => {
            if raw[16..].iter().any(|&b| b != 0) {
                return corrupt(format!("info slot {lane}: reserved region not zeroed"));
            }
            if !in_pool(word(8)) {
                return corrupt(format!("info slot {lane}: destination outside the pool"));
            }
            Ok(())
        }
        INFO_SLOT_REALLOC => {
            if raw[24..].iter().any(|&b| b != 0) {
                return corrupt(format!("info slot {lane}: reserved region not zeroed"));
            }
            if !in_pool(word(8)) || !in_pool(word(16)) {
                return corrupt(format!("info slot {lane}: address outside the pool"));
            }
            Ok(())
        }
        INFO_SLOT_FREE => {
            if raw[16..].iter().any(|&b| b != 0) {
                return corrupt(format!("info slot {lane}: reserved region not zeroed"));
            }
            if !in_pool(word(8)) {
                return corrupt(format!("info slot {lane}: address outside the pool"));
            }
            Ok(())
        }
        other => corrupt(format!("info slot {lane}: unknown tag {other}")),
    }
}

/// Verify a zone's chunk headers tile it exactly.
fn check_zone(map: &Mapping, geo: &Geometry, zone: u16) -> Result<()> {
    let zone_chunks = geo.zone_size_idx(zone);
    let mut i = 0u32;
    while i < zone_chunks {
        let hdr = ChunkHeader::unpack(map.read_u64(geo.chunk_header_off(zone, i)));
        if !hdr.is_written() {
            if i == 0 {
                // Zone never used.
                return Ok(());
            }
            return Err(Error::corrupt(format!(
                "zone {zone} chunk {i}: invalid header magic"
            )));
        }
        let span = match hdr.chunk_type {
            CHUNK_TYPE_BASE => hdr.size_idx,
            CHUNK_TYPE_RUN => 1,
            other => {
                return Err(Error::corrupt(format!(
                    "zone {zone} chunk {i}: invalid type {other}"
                )))
            }
        };
        if span == 0 {
            return Err(Error::corrupt(format!("zone {zone} chunk {i}: nil size")));
        }
        if i + span > zone_chunks {
            return Err(Error::corrupt(format!(
                "zone {zone} chunk {i}: size bigger than the zone"
            )));
        }
        i += span;
    }
    if i != zone_chunks {
        return Err(Error::corrupt(format!("zone {zone}: misaligned chunk headers")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> PoolOptions {
        PoolOptions {
            size: 16 * 1024 * 1024,
            lane_count: 64,
            ..PoolOptions::default()
        }
    }

    #[test]
    fn test_create_open_close_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");

        let pool = Pool::create(&path, &options()).unwrap();
        let mut slot = 0u64;
        pool.heap().alloc(&mut slot, 1_000_000).unwrap();
        pool.heap().free(&mut slot).unwrap();
        pool.close().unwrap();

        let pool = Pool::open(&path, &options()).unwrap();
        pool.heap().populate_all().unwrap();
        assert_eq!(pool.heap().allocated_bytes(), 0);
        pool.close().unwrap();
    }

    #[test]
    fn test_create_rejects_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");
        Pool::create(&path, &options()).unwrap().close().unwrap();
        assert!(Pool::create(&path, &options()).is_err());
    }

    #[test]
    fn test_open_rejects_garbage_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.pool");
        std::fs::write(&path, vec![0xabu8; MIN_POOL_SIZE as usize]).unwrap();
        let err = Pool::open(&path, &options()).unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Corrupt(_))));
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");
        Pool::create(&path, &options()).unwrap().close().unwrap();

        // Smash the primary header.
        let mut raw = std::fs::read(&path).unwrap();
        raw[..64].fill(0xff);
        std::fs::write(&path, &raw).unwrap();

        let pool = Pool::open(&path, &options()).unwrap();
        let mut slot = 0u64;
        pool.heap().alloc(&mut slot, 1024).unwrap();
        pool.close().unwrap();

        // The primary was rewritten from the backup.
        Pool::check(&path).unwrap();
    }

    #[test]
    fn test_open_rejects_truncated_pool() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");
        Pool::create(&path, &options()).unwrap().close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 4096]).unwrap();
        let err = Pool::open(&path, &options()).unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Incompatible(_))));
    }

    #[test]
    fn test_check_healthy_pool() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");
        let pool = Pool::create(&path, &options()).unwrap();
        let mut slot = 0u64;
        pool.heap().alloc(&mut slot, 300_000).unwrap();
        pool.close().unwrap();
        Pool::check(&path).unwrap();
    }

    #[test]
    fn test_drop_without_close_triggers_recovery_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pool");
        let pool = Pool::create(&path, &options()).unwrap();
        let mut slot = 0u64;
        pool.heap().alloc(&mut slot, 1_000_000).unwrap();
        drop(pool); // crash: state stays OPEN

        let pool = Pool::open(&path, &options()).unwrap();
        pool.heap().populate_all().unwrap();
        // The allocation committed before the crash; it survives recovery.
        assert_eq!(pool.heap().allocated_bytes(), 4 * crate::layout::CHUNK_SIZE);
        pool.close().unwrap();
    }
}
