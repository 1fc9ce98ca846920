//! Durable redo log.
//!
//! Each lane owns a fixed 1 KiB redo area: a 32-byte header followed by
//! 62 entries. A committed log is the source of truth for a metadata
//! mutation: once `store` returns, a crash at any later point replays the
//! log on the next open. Applying a log is idempotent, so replaying an
//! already-applied log is harmless.
//!
//! Entry word packing: `offset << 4 | finish << 3 | op`. Offsets are
//! pool-relative so they stay valid across re-mappings. A log may chain into
//! further segments through the header's `next` offset; the checksum only
//! ever covers the first segment, which is why overflow segments are made
//! durable before the first segment is.

use crate::core::error::{Error, HeapError, Result};
use crate::layout::LANE_SIZE;
use crate::pmem::{Mapping, PersistOps};

/// Redo log header size: checksum, nentries, next, capacity
pub const REDO_HEADER_SIZE: u64 = 32;
/// Size of one packed entry
pub const REDO_ENTRY_SIZE: u64 = 16;
/// Entry capacity of a lane's base segment
pub const LANE_REDO_CAPACITY: usize = ((LANE_SIZE - REDO_HEADER_SIZE) / REDO_ENTRY_SIZE) as usize;

const OP_MASK: u64 = 0b111;
const FINISH_BIT: u64 = 0b1000;

/// Redo entry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOp {
    /// Unconditional store
    Set = 1,
    /// Bitwise AND with the stored mask
    And = 2,
    /// Bitwise OR with the stored mask
    Or = 3,
}

impl RedoOp {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(RedoOp::Set),
            2 => Some(RedoOp::And),
            3 => Some(RedoOp::Or),
            _ => None,
        }
    }
}

/// One staged redo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoEntry {
    /// Pool-relative offset of the target 64-bit word
    pub offset: u64,
    /// Value or mask
    pub value: u64,
    /// Operation
    pub op: RedoOp,
    /// Commit marker; exactly one per committed log, on the last entry
    pub finish: bool,
}

impl RedoEntry {
    /// Create an entry; the finish flag is assigned by `store`.
    pub fn new(offset: u64, value: u64, op: RedoOp) -> Self {
        Self {
            offset,
            value,
            op,
            finish: false,
        }
    }

    /// Pack into the on-media entry word
    pub fn encode_word(&self) -> u64 {
        self.offset << 4 | if self.finish { FINISH_BIT } else { 0 } | self.op as u64
    }

    /// Unpack from the on-media representation
    pub fn decode(word: u64, value: u64) -> Option<Self> {
        Some(Self {
            offset: word >> 4,
            value,
            op: RedoOp::from_bits(word & OP_MASK)?,
            finish: word & FINISH_BIT != 0,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RedoHeader {
    checksum: u64,
    nentries: u64,
    next: u64,
    capacity: u64,
}

fn read_header(map: &Mapping, log_off: u64) -> RedoHeader {
    RedoHeader {
        checksum: map.read_u64(log_off),
        nentries: map.read_u64(log_off + 8),
        next: map.read_u64(log_off + 16),
        capacity: map.read_u64(log_off + 24),
    }
}

/// Pool offset of entry `idx`, following the segment chain.
///
/// `None` when the chain is malformed (dangling or out-of-pool `next`).
fn entry_off(map: &Mapping, log_off: u64, base_capacity: usize, idx: usize) -> Option<u64> {
    if idx < base_capacity {
        return Some(log_off + REDO_HEADER_SIZE + idx as u64 * REDO_ENTRY_SIZE);
    }
    let mut rem = idx - base_capacity;
    let mut seg = read_header(map, log_off).next;
    // Chain length is bounded to reject crafted cycles.
    for _ in 0..64 {
        if seg == 0 || seg % 8 != 0 || seg + REDO_HEADER_SIZE > map.len() as u64 {
            return None;
        }
        let hdr = read_header(map, seg);
        let cap = hdr.capacity as usize;
        if seg + REDO_HEADER_SIZE + hdr.capacity * REDO_ENTRY_SIZE > map.len() as u64 {
            return None;
        }
        if rem < cap {
            return Some(seg + REDO_HEADER_SIZE + rem as u64 * REDO_ENTRY_SIZE);
        }
        rem -= cap;
        seg = hdr.next;
    }
    None
}

/// Total entry capacity of the log, across every chained segment.
pub fn capacity(map: &Mapping, log_off: u64, base_capacity: usize) -> usize {
    let mut total = base_capacity;
    let mut seg = read_header(map, log_off).next;
    for _ in 0..64 {
        if seg == 0 || seg % 8 != 0 || seg + REDO_HEADER_SIZE > map.len() as u64 {
            break;
        }
        let hdr = read_header(map, seg);
        if seg + REDO_HEADER_SIZE + hdr.capacity * REDO_ENTRY_SIZE > map.len() as u64 {
            break;
        }
        total += hdr.capacity as usize;
        seg = hdr.next;
    }
    total
}

/// Ensure the log can hold `nentries`.
pub fn reserve(map: &Mapping, log_off: u64, base_capacity: usize, nentries: usize) -> Result<()> {
    if nentries <= capacity(map, log_off, base_capacity) {
        Ok(())
    } else {
        Err(Error::Heap(HeapError::OutOfMemory))
    }
}

/// Checksum over the occupied part of the first segment, with the checksum
/// field itself zeroed.
fn first_segment_checksum(map: &Mapping, log_off: u64, base_capacity: usize, nentries: u64) -> u64 {
    let occupied = (nentries as usize).min(base_capacity) as u64;
    let len = (REDO_HEADER_SIZE + occupied * REDO_ENTRY_SIZE) as usize;
    let mut buf = vec![0u8; len];
    let src = unsafe { std::slice::from_raw_parts(map.at(log_off), len) };
    buf.copy_from_slice(src);
    buf[..8].fill(0);
    crate::layout::checksum64(&buf)
}

/// Durably store staged entries into the log.
///
/// Overflow entries land in the chained segments and are drained first; the
/// first segment, which carries the checksum, is written last. After this
/// returns the log is committed: any later crash replays it on open.
pub fn store(
    map: &Mapping,
    ops: &dyn PersistOps,
    log_off: u64,
    base_capacity: usize,
    entries: &mut [RedoEntry],
) {
    assert!(!entries.is_empty());
    assert!(entries.len() <= capacity(map, log_off, base_capacity));

    for e in entries.iter_mut() {
        e.finish = false;
    }
    entries.last_mut().unwrap().finish = true;

    let n = entries.len();
    if n > base_capacity {
        for (idx, e) in entries.iter().enumerate().skip(base_capacity) {
            let off = entry_off(map, log_off, base_capacity, idx).expect("reserved chain");
            unsafe {
                std::ptr::write_volatile(map.u64_at(off), e.encode_word());
                std::ptr::write_volatile(map.u64_at(off + 8), e.value);
            }
            ops.flush(map.at(off), REDO_ENTRY_SIZE as usize);
        }
        ops.drain();
    }

    // First segment: header plus its share of the entries in one durable copy.
    let hdr = read_header(map, log_off);
    let occupied = n.min(base_capacity);
    let len = (REDO_HEADER_SIZE + occupied as u64 * REDO_ENTRY_SIZE) as usize;
    let mut buf = vec![0u8; len];
    buf[8..16].copy_from_slice(&(n as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&hdr.next.to_le_bytes());
    buf[24..32].copy_from_slice(&hdr.capacity.to_le_bytes());
    for (i, e) in entries.iter().take(occupied).enumerate() {
        let at = (REDO_HEADER_SIZE + i as u64 * REDO_ENTRY_SIZE) as usize;
        buf[at..at + 8].copy_from_slice(&e.encode_word().to_le_bytes());
        buf[at + 8..at + 16].copy_from_slice(&e.value.to_le_bytes());
    }
    let checksum = crate::layout::checksum64(&buf);
    buf[..8].copy_from_slice(&checksum.to_le_bytes());
    ops.memcpy_persist(map.at(log_off), buf.as_ptr(), len);
}

fn read_entry(map: &Mapping, log_off: u64, base_capacity: usize, idx: usize) -> Option<RedoEntry> {
    let off = entry_off(map, log_off, base_capacity, idx)?;
    RedoEntry::decode(map.read_u64(off), map.read_u64(off + 8))
}

fn apply_entry(map: &Mapping, ops: &dyn PersistOps, e: &RedoEntry) {
    let target = map.u64_at(e.offset);
    unsafe {
        match e.op {
            RedoOp::Set => std::ptr::write_volatile(target, e.value),
            RedoOp::And => std::ptr::write_volatile(target, std::ptr::read_volatile(target) & e.value),
            RedoOp::Or => std::ptr::write_volatile(target, std::ptr::read_volatile(target) | e.value),
        }
    }
    ops.flush(target as *const u8, 8);
}

/// Zero the commit marker so the log is no longer replayable.
fn invalidate(map: &Mapping, ops: &dyn PersistOps, log_off: u64) {
    unsafe {
        std::ptr::write_volatile(map.u64_at(log_off), 0);
        std::ptr::write_volatile(map.u64_at(log_off + 8), 0);
    }
    ops.persist(map.at(log_off), 16);
}

/// Apply every entry in store order, flushing each target, then invalidate.
///
/// Idempotent: each entry's target is already its final value on a re-run,
/// and invalidating an invalidated log is a no-op.
pub fn process(map: &Mapping, ops: &dyn PersistOps, log_off: u64, base_capacity: usize) {
    let nentries = map.read_u64(log_off + 8) as usize;
    for idx in 0..nentries {
        let e = match read_entry(map, log_off, base_capacity, idx) {
            Some(e) => e,
            None => break,
        };
        apply_entry(map, ops, &e);
    }
    ops.drain();
    invalidate(map, ops, log_off);
}

/// Replay the log if it was committed; otherwise discard it.
pub fn recover(map: &Mapping, ops: &dyn PersistOps, log_off: u64, base_capacity: usize) {
    let hdr = read_header(map, log_off);
    if hdr.nentries == 0 {
        return;
    }
    let committed = hdr.nentries as usize <= capacity(map, log_off, base_capacity)
        && first_segment_checksum(map, log_off, base_capacity, hdr.nentries) == hdr.checksum
        && read_entry(map, log_off, base_capacity, hdr.nentries as usize - 1)
            .map(|e| e.finish)
            .unwrap_or(false);
    if committed {
        tracing::debug!(log_off, nentries = hdr.nentries, "replaying redo log");
        process(map, ops, log_off, base_capacity);
    } else {
        tracing::debug!(log_off, "discarding uncommitted redo log");
        invalidate(map, ops, log_off);
    }
}

/// Verify that every entry's offset points at a word inside the pool.
pub fn check(map: &Mapping, log_off: u64, base_capacity: usize) -> Result<()> {
    let hdr = read_header(map, log_off);
    if hdr.nentries == 0 {
        return Ok(());
    }
    if hdr.nentries as usize > capacity(map, log_off, base_capacity) {
        return Err(Error::corrupt(format!(
            "redo log at {log_off}: {} entries exceed capacity",
            hdr.nentries
        )));
    }
    for idx in 0..hdr.nentries as usize {
        let e = read_entry(map, log_off, base_capacity, idx)
            .ok_or_else(|| Error::corrupt(format!("redo log at {log_off}: broken chain")))?;
        if e.offset == 0 || e.offset % 8 != 0 || e.offset + 8 > map.len() as u64 {
            return Err(Error::corrupt(format!(
                "redo log at {log_off}: entry {idx} targets offset {} outside the pool",
                e.offset
            )));
        }
    }
    Ok(())
}
