//! On-media pool format.
//!
//! Everything in this module is fixed for all time within a major version:
//! the pool header and its per-zone backups, the info-slot array, the lane
//! redo areas, and the zone/chunk geometry. All integers are little-endian
//! and all structures are `#[repr(C)]`.
//!
//! ```text
//! 0                PoolHeader (1024 B)
//! 1024             InfoSlot[lane_count]     (32 B each)
//! 1024 + 32·N      Lane redo area[lane_count] (1024 B each)
//! heap_start       Zone*  { PoolHeader backup | ChunkHeader[MAX_CHUNK] | chunks }
//! ```

use crate::core::error::{Error, Result};

/// Pool signature; pools with a different one are rejected
pub const POOL_SIGNATURE: [u8; 16] = *b"PMEMHEAP\0RUST\0v1";
/// On-media format major version; must match exactly to open
pub const POOL_MAJOR: u64 = 1;
/// On-media format minor version
pub const POOL_MINOR: u64 = 0;

/// Size of the pool header and of every per-zone backup
pub const POOL_HEADER_SIZE: u64 = 1024;
/// Size of one info slot
pub const INFO_SLOT_SIZE: u64 = 32;
/// Size of one lane's durable redo area
pub const LANE_SIZE: u64 = 1024;
/// Default number of lanes (and info slots) for new pools
pub const DEFAULT_LANE_COUNT: u64 = 1024;

/// Chunk size in bytes; compile-time constant, validated on open
pub const CHUNK_SIZE: u64 = 256 * 1024;
/// Chunks per full zone; compile-time constant, validated on open
pub const MAX_CHUNK: u64 = 65_528;
/// Size of one chunk header
pub const CHUNK_HEADER_SIZE: u64 = 16;
/// Magic value distinguishing written-at-least-once chunk headers
pub const CHUNK_HEADER_MAGIC: u16 = 0x4d48;

/// Zone metadata: backup header plus the chunk header array
pub const ZONE_META_SIZE: u64 = POOL_HEADER_SIZE + MAX_CHUNK * CHUNK_HEADER_SIZE;
/// Full zone size including all chunks
pub const ZONE_MAX_SIZE: u64 = ZONE_META_SIZE + MAX_CHUNK * CHUNK_SIZE;

/// Words in a run bitmap
pub const RUN_BITMAP_WORDS: usize = 16;
/// Bits in a run bitmap
pub const RUN_BITMAP_BITS: u32 = (RUN_BITMAP_WORDS as u32) * 64;
/// Offset of the allocation area inside a run chunk (header + bitmap,
/// padded to a cache line boundary)
pub const RUN_DATA_OFF: u64 = 192;
/// Allocation header size (huge allocations and Legacy run classes)
pub const ALLOC_HEADER_SIZE: u64 = 16;

/// Minimum pool size
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Pool state: open (recovery required if found on open)
pub const POOL_STATE_OPEN: u32 = 1;
/// Pool state: cleanly closed
pub const POOL_STATE_CLOSED: u32 = 2;

/// Header flag: the pool's mapping only offers page-granular durability
pub const POOL_FLAG_PAGE_GRANULAR: u32 = 1;

/// Truncated blake3 used for every on-media checksum field.
pub fn checksum64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Pool header
// ---------------------------------------------------------------------------

const POOL_HEADER_RESERVED: usize =
    (POOL_HEADER_SIZE as usize) - 16 - 4 - 4 - 8 * 6 - 8 /* checksum */;

/// Pool header; a primary copy at offset 0 and one backup per zone.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PoolHeader {
    /// Pool signature
    pub signature: [u8; 16],
    /// Feature flags
    pub flags: u32,
    /// Pool state (`POOL_STATE_*`)
    pub state: u32,
    /// Format major version
    pub major: u64,
    /// Format minor version
    pub minor: u64,
    /// Pool size in bytes
    pub size: u64,
    /// Chunk size the pool was created with
    pub chunk_size: u64,
    /// Chunks per zone the pool was created with
    pub chunks_per_zone: u64,
    /// Lane / info-slot count, chosen at create time
    pub lane_count: u64,
    /// Reserved, zero
    pub reserved: [u8; POOL_HEADER_RESERVED],
    /// Checksum over the header with this field zeroed
    pub checksum: u64,
}

impl PoolHeader {
    /// Build a fresh header for a new pool; checksum not yet sealed.
    pub fn new(size: u64, lane_count: u64, page_granular: bool) -> Self {
        let mut flags = 0;
        if page_granular {
            flags |= POOL_FLAG_PAGE_GRANULAR;
        }
        Self {
            signature: POOL_SIGNATURE,
            flags,
            state: POOL_STATE_CLOSED,
            major: POOL_MAJOR,
            minor: POOL_MINOR,
            size,
            chunk_size: CHUNK_SIZE,
            chunks_per_zone: MAX_CHUNK,
            lane_count,
            reserved: [0; POOL_HEADER_RESERVED],
            checksum: 0,
        }
    }

    /// View the header as bytes
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, POOL_HEADER_SIZE as usize)
        }
    }

    /// Checksum over the header with the checksum field zeroed
    pub fn compute_checksum(&self) -> u64 {
        let mut copy = *self;
        copy.checksum = 0;
        checksum64(copy.as_bytes())
    }

    /// Recompute and store the checksum
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Checksum and signature validation
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum() && self.signature == POOL_SIGNATURE
    }
}

// ---------------------------------------------------------------------------
// Info slots
// ---------------------------------------------------------------------------

/// Info slot tag: empty / already recovered
pub const INFO_SLOT_UNKNOWN: u32 = 0;
/// Info slot tag: in-flight allocation
pub const INFO_SLOT_ALLOC: u32 = 1;
/// Info slot tag: in-flight reallocation
pub const INFO_SLOT_REALLOC: u32 = 2;
/// Info slot tag: in-flight free
pub const INFO_SLOT_FREE: u32 = 3;
/// Number of valid info slot tags
pub const INFO_SLOT_TAG_MAX: u32 = 4;

/// Decoded info slot contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSlot {
    /// No operation in flight
    Unknown,
    /// Allocation writing its result into the pointer at `dst_off`
    Alloc {
        /// Pool-relative offset of the destination pointer slot
        dst_off: u64,
    },
    /// Reallocation of the pointer at `dst_off` whose prior value was `old_val`
    Realloc {
        /// Pool-relative offset of the destination pointer slot
        dst_off: u64,
        /// Offset the pointer held before the operation
        old_val: u64,
    },
    /// Free of the pointer at `free_off`
    Free {
        /// Pool-relative offset of the pointer slot being freed
        free_off: u64,
    },
}

impl InfoSlot {
    /// Tag word of this slot
    pub fn tag(&self) -> u32 {
        match self {
            InfoSlot::Unknown => INFO_SLOT_UNKNOWN,
            InfoSlot::Alloc { .. } => INFO_SLOT_ALLOC,
            InfoSlot::Realloc { .. } => INFO_SLOT_REALLOC,
            InfoSlot::Free { .. } => INFO_SLOT_FREE,
        }
    }

    /// Encode into the 32-byte on-media representation
    pub fn encode(&self) -> [u8; INFO_SLOT_SIZE as usize] {
        let mut out = [0u8; INFO_SLOT_SIZE as usize];
        out[..4].copy_from_slice(&self.tag().to_le_bytes());
        match *self {
            InfoSlot::Unknown => {}
            InfoSlot::Alloc { dst_off } => out[8..16].copy_from_slice(&dst_off.to_le_bytes()),
            InfoSlot::Realloc { dst_off, old_val } => {
                out[8..16].copy_from_slice(&dst_off.to_le_bytes());
                out[16..24].copy_from_slice(&old_val.to_le_bytes());
            }
            InfoSlot::Free { free_off } => out[8..16].copy_from_slice(&free_off.to_le_bytes()),
        }
        out
    }

    /// Decode the 32-byte on-media representation; `None` for garbage tags
    pub fn decode(raw: &[u8; INFO_SLOT_SIZE as usize]) -> Option<InfoSlot> {
        let tag = u32::from_le_bytes(raw[..4].try_into().unwrap());
        let a = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        let b = u64::from_le_bytes(raw[16..24].try_into().unwrap());
        match tag {
            INFO_SLOT_UNKNOWN => Some(InfoSlot::Unknown),
            INFO_SLOT_ALLOC => Some(InfoSlot::Alloc { dst_off: a }),
            INFO_SLOT_REALLOC => Some(InfoSlot::Realloc {
                dst_off: a,
                old_val: b,
            }),
            INFO_SLOT_FREE => Some(InfoSlot::Free { free_off: a }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk headers
// ---------------------------------------------------------------------------

/// Chunk type: garbage / never written
pub const CHUNK_TYPE_UNKNOWN: u8 = 0;
/// Chunk type: plain chunk span (free or a huge allocation)
pub const CHUNK_TYPE_BASE: u8 = 1;
/// Chunk type: promoted run with a unit bitmap
pub const CHUNK_TYPE_RUN: u8 = 2;

/// Chunk flag: span is allocated
pub const CHUNK_FLAG_USED: u8 = 1;
/// Chunk flag: chunk data is known-zero (never dirtied since creation)
pub const CHUNK_FLAG_ZEROED: u8 = 2;

/// Bit position of the flags byte inside the packed header word
const CHUNK_FLAGS_SHIFT: u32 = 24;
/// OR mask setting USED in the packed chunk header word
pub const CHUNK_WORD_USED: u64 = (CHUNK_FLAG_USED as u64) << CHUNK_FLAGS_SHIFT;
/// OR mask setting ZEROED in the packed chunk header word
pub const CHUNK_WORD_ZEROED: u64 = (CHUNK_FLAG_ZEROED as u64) << CHUNK_FLAGS_SHIFT;

/// Decoded first word of a chunk header.
///
/// All mutable fields live in the first 8-byte word so that every header
/// mutation is a single crash-atomic store (or an AND/OR redo entry on it).
/// The second word is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Magic marker; anything else means "never written"
    pub magic: u16,
    /// Chunk type (`CHUNK_TYPE_*`)
    pub chunk_type: u8,
    /// Chunk flags (`CHUNK_FLAG_*`)
    pub flags: u8,
    /// Number of contiguous chunks this header owns
    pub size_idx: u32,
}

impl ChunkHeader {
    /// Pack into the on-media header word
    pub fn pack(&self) -> u64 {
        (self.magic as u64)
            | (self.chunk_type as u64) << 16
            | (self.flags as u64) << CHUNK_FLAGS_SHIFT
            | (self.size_idx as u64) << 32
    }

    /// Unpack from the on-media header word
    pub fn unpack(word: u64) -> Self {
        Self {
            magic: word as u16,
            chunk_type: (word >> 16) as u8,
            flags: (word >> CHUNK_FLAGS_SHIFT) as u8,
            size_idx: (word >> 32) as u32,
        }
    }

    /// Whether the header was ever written
    pub fn is_written(&self) -> bool {
        self.magic == CHUNK_HEADER_MAGIC
    }

    /// Whether the span is allocated
    pub fn is_used(&self) -> bool {
        self.flags & CHUNK_FLAG_USED != 0
    }

    /// Whether the chunk data is known-zero
    pub fn is_zeroed(&self) -> bool {
        self.flags & CHUNK_FLAG_ZEROED != 0
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Pool geometry derived from the pool size and lane count.
///
/// Shared by the heap, the lane manager, the recovery driver and the
/// consistency check so that there is exactly one set of offset equations.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Pool size in bytes
    pub pool_size: u64,
    /// Lane / info-slot count
    pub lane_count: u64,
    /// Offset of the first zone
    pub heap_start: u64,
    /// Number of zones
    pub max_zone: u32,
}

impl Geometry {
    /// Derive the geometry for a pool.
    pub fn new(pool_size: u64, lane_count: u64) -> Result<Self> {
        if pool_size < MIN_POOL_SIZE {
            return Err(Error::Pool(crate::core::error::PoolError::TooSmall {
                size: pool_size,
                min: MIN_POOL_SIZE,
            }));
        }
        let heap_start = POOL_HEADER_SIZE + lane_count * (INFO_SLOT_SIZE + LANE_SIZE);

        let mut max_zone = 0u32;
        let mut remaining = pool_size.saturating_sub(heap_start);
        while remaining >= ZONE_META_SIZE + CHUNK_SIZE {
            max_zone += 1;
            remaining -= remaining.min(ZONE_MAX_SIZE);
        }
        if max_zone == 0 {
            return Err(Error::Pool(crate::core::error::PoolError::TooSmall {
                size: pool_size,
                min: MIN_POOL_SIZE,
            }));
        }
        Ok(Self {
            pool_size,
            lane_count,
            heap_start,
            max_zone,
        })
    }

    /// Offset of a lane's info slot
    #[inline]
    pub fn info_slot_off(&self, lane: u64) -> u64 {
        debug_assert!(lane < self.lane_count);
        POOL_HEADER_SIZE + lane * INFO_SLOT_SIZE
    }

    /// Offset of a lane's durable redo area
    #[inline]
    pub fn lane_redo_off(&self, lane: u64) -> u64 {
        debug_assert!(lane < self.lane_count);
        POOL_HEADER_SIZE + self.lane_count * INFO_SLOT_SIZE + lane * LANE_SIZE
    }

    /// Offset of a zone (its backup header)
    #[inline]
    pub fn zone_off(&self, zone: u16) -> u64 {
        debug_assert!((zone as u32) < self.max_zone);
        self.heap_start + zone as u64 * ZONE_MAX_SIZE
    }

    /// Chunk count of a zone; the last zone may be short
    pub fn zone_size_idx(&self, zone: u16) -> u32 {
        if (zone as u32) < self.max_zone - 1 {
            return MAX_CHUNK as u32;
        }
        let raw = self.pool_size - self.zone_off(zone);
        ((raw - ZONE_META_SIZE) / CHUNK_SIZE) as u32
    }

    /// Offset of a chunk header's first word
    #[inline]
    pub fn chunk_header_off(&self, zone: u16, chunk: u32) -> u64 {
        self.zone_off(zone) + POOL_HEADER_SIZE + chunk as u64 * CHUNK_HEADER_SIZE
    }

    /// Offset of a chunk's data
    #[inline]
    pub fn chunk_data_off(&self, zone: u16, chunk: u32) -> u64 {
        self.zone_off(zone) + ZONE_META_SIZE + chunk as u64 * CHUNK_SIZE
    }

    /// Resolve a data offset to its owning `(zone, chunk, offset-in-chunk)`.
    ///
    /// Fails for offsets pointing at pool or zone metadata.
    pub fn locate(&self, data_off: u64) -> Result<(u16, u32, u64)> {
        if data_off < self.heap_start || data_off >= self.pool_size {
            return Err(Error::invalid_argument(format!(
                "offset {data_off} outside the heap region"
            )));
        }
        let rel = data_off - self.heap_start;
        let zone = (rel / ZONE_MAX_SIZE) as u16;
        let zone_rel = rel % ZONE_MAX_SIZE;
        if zone_rel < ZONE_META_SIZE {
            return Err(Error::invalid_argument(format!(
                "offset {data_off} points at zone metadata"
            )));
        }
        let chunk = ((zone_rel - ZONE_META_SIZE) / CHUNK_SIZE) as u32;
        if chunk >= self.zone_size_idx(zone) {
            return Err(Error::invalid_argument(format!(
                "offset {data_off} beyond the zone's chunks"
            )));
        }
        let within = (zone_rel - ZONE_META_SIZE) % CHUNK_SIZE;
        Ok((zone, chunk, within))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_exact() {
        assert_eq!(std::mem::size_of::<PoolHeader>(), POOL_HEADER_SIZE as usize);
    }

    #[test]
    fn test_header_checksum_roundtrip() {
        let mut hdr = PoolHeader::new(64 << 20, DEFAULT_LANE_COUNT, false);
        assert!(!hdr.verify());
        hdr.seal();
        assert!(hdr.verify());
        hdr.state = POOL_STATE_OPEN;
        assert!(!hdr.verify());
        hdr.seal();
        assert!(hdr.verify());
    }

    #[test]
    fn test_chunk_header_pack_unpack() {
        let hdr = ChunkHeader {
            magic: CHUNK_HEADER_MAGIC,
            chunk_type: CHUNK_TYPE_BASE,
            flags: CHUNK_FLAG_USED | CHUNK_FLAG_ZEROED,
            size_idx: 250,
        };
        let word = hdr.pack();
        assert_eq!(ChunkHeader::unpack(word), hdr);
        assert_ne!(word & CHUNK_WORD_USED, 0);
        assert_eq!(
            ChunkHeader::unpack(word & !CHUNK_WORD_USED).flags,
            CHUNK_FLAG_ZEROED
        );
    }

    #[test]
    fn test_info_slot_roundtrip() {
        for slot in [
            InfoSlot::Unknown,
            InfoSlot::Alloc { dst_off: 4096 },
            InfoSlot::Realloc {
                dst_off: 4096,
                old_val: 8192,
            },
            InfoSlot::Free { free_off: 12288 },
        ] {
            assert_eq!(InfoSlot::decode(&slot.encode()), Some(slot));
        }
        let mut garbage = [0u8; 32];
        garbage[0] = 0xff;
        assert_eq!(InfoSlot::decode(&garbage), None);
    }

    #[test]
    fn test_geometry_single_zone_pool() {
        let geo = Geometry::new(64 << 20, DEFAULT_LANE_COUNT).unwrap();
        assert_eq!(geo.max_zone, 1);
        let chunks = geo.zone_size_idx(0);
        assert!(chunks > 0);
        // Everything the geometry promises must stay inside the pool.
        let last_data = geo.chunk_data_off(0, chunks - 1) + CHUNK_SIZE;
        assert!(last_data <= geo.pool_size);
    }

    #[test]
    fn test_geometry_rejects_tiny_pool() {
        assert!(Geometry::new(1 << 20, DEFAULT_LANE_COUNT).is_err());
    }

    #[test]
    fn test_locate_matches_chunk_data_off() {
        let geo = Geometry::new(64 << 20, DEFAULT_LANE_COUNT).unwrap();
        let off = geo.chunk_data_off(0, 3) + 100;
        let (zone, chunk, within) = geo.locate(off).unwrap();
        assert_eq!((zone, chunk, within), (0, 3, 100));
        assert!(geo.locate(geo.zone_off(0) + 10).is_err());
        assert!(geo.locate(10).is_err());
    }

    #[test]
    fn test_lane_areas_do_not_overlap_heap() {
        let geo = Geometry::new(64 << 20, 64).unwrap();
        assert_eq!(geo.lane_redo_off(0), POOL_HEADER_SIZE + 64 * INFO_SLOT_SIZE);
        assert!(geo.lane_redo_off(63) + LANE_SIZE <= geo.heap_start);
    }
}
