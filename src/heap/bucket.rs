//! Buckets: the volatile facade over block containers.
//!
//! A bucket serializes access to one container through its lock. Run
//! buckets additionally keep an *active run*: a block pulled out of the
//! container and served next-fit until it is exhausted, which keeps the hot
//! allocation path away from container searches.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::heap::alloc_class::AllocClass;
use crate::heap::container::{AddressList, BlockContainer, CritbitContainer};
use crate::heap::memblock::MemoryBlock;
use crate::layout::{ALLOC_HEADER_SIZE, CHUNK_SIZE};

/// Bucket flavor.
#[derive(Debug, Clone)]
pub enum BucketKind {
    /// The single bucket of whole-chunk spans
    Huge,
    /// A bucket of run spans for one size class
    Run(Arc<AllocClass>),
}

/// Next-fit cursor over a reserved span of one run.
#[derive(Debug, Clone, Copy)]
pub struct ActiveRun {
    /// Zone of the active run
    pub zone_id: u16,
    /// Chunk of the active run
    pub chunk_id: u16,
    /// Next unit to hand out
    pub next_fit: u32,
    /// One past the last unit of the reserved span
    pub end: u32,
}

/// Container plus active-run state behind the bucket lock.
pub struct BucketState {
    /// The bucket's block container
    pub container: Box<dyn BlockContainer>,
    /// Active run, if any
    pub active: Option<ActiveRun>,
}

/// One bucket: a lock over a container and optional active-run state.
pub struct Bucket {
    /// Bucket flavor
    pub kind: BucketKind,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// The huge bucket, backed by a crit-bit tree.
    pub fn new_huge() -> Arc<Self> {
        Arc::new(Self {
            kind: BucketKind::Huge,
            state: Mutex::new(BucketState {
                container: Box::new(CritbitContainer::new()),
                active: None,
            }),
        })
    }

    /// A run bucket for a class, backed by an address-ordered list.
    pub fn new_run(class: Arc<AllocClass>) -> Arc<Self> {
        Arc::new(Self {
            kind: BucketKind::Run(class),
            state: Mutex::new(BucketState {
                container: Box::new(AddressList::new()),
                active: None,
            }),
        })
    }

    /// Unit size served by this bucket
    pub fn unit_size(&self) -> u64 {
        match &self.kind {
            BucketKind::Huge => CHUNK_SIZE,
            BucketKind::Run(class) => class.unit_size,
        }
    }

    /// Units needed to hold `size` bytes in this bucket
    pub fn calc_units(&self, size: u64) -> crate::core::error::Result<u32> {
        match &self.kind {
            BucketKind::Huge => Ok((size + ALLOC_HEADER_SIZE).div_ceil(CHUNK_SIZE) as u32),
            BucketKind::Run(class) => class.calc_units(size),
        }
    }

    /// Class backing a run bucket
    pub fn class(&self) -> Option<&Arc<AllocClass>> {
        match &self.kind {
            BucketKind::Huge => None,
            BucketKind::Run(class) => Some(class),
        }
    }

    /// Lock the bucket state
    pub fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
    }
}

impl BucketState {
    /// Reserve `size_idx` units, preferring the active run's next-fit
    /// cursor, falling back to a best-fit container pull that then becomes
    /// the active run.
    pub fn reserve_units(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        if let Some(active) = &mut self.active {
            if active.next_fit + size_idx <= active.end {
                let m = MemoryBlock::units(
                    active.zone_id,
                    active.chunk_id,
                    active.next_fit as u16,
                    size_idx,
                );
                active.next_fit += size_idx;
                if active.next_fit == active.end {
                    self.active = None;
                }
                return Some(m);
            }
            // Exhausted for this request; return the remainder to the
            // container and retire the cursor.
            let rest = MemoryBlock::units(
                active.zone_id,
                active.chunk_id,
                active.next_fit as u16,
                active.end - active.next_fit,
            );
            self.container.insert(rest);
            self.active = None;
        }

        let block = self.container.remove_bestfit(size_idx)?;
        if block.size_idx > size_idx {
            self.active = Some(ActiveRun {
                zone_id: block.zone_id,
                chunk_id: block.chunk_id,
                next_fit: block.block_off as u32 + size_idx,
                end: block.block_off as u32 + block.size_idx,
            });
        }
        Some(MemoryBlock::units(
            block.zone_id,
            block.chunk_id,
            block.block_off,
            size_idx,
        ))
    }

    /// Whether the given chunk is this bucket's active run.
    pub fn is_active_run(&self, zone_id: u16, chunk_id: u16) -> bool {
        matches!(self.active, Some(a) if a.zone_id == zone_id && a.chunk_id == chunk_id)
    }

    /// Retire the active run, returning its unserved remainder to the
    /// container.
    pub fn retire_active(&mut self) {
        if let Some(active) = self.active.take() {
            if active.next_fit < active.end {
                self.container.insert(MemoryBlock::units(
                    active.zone_id,
                    active.chunk_id,
                    active.next_fit as u16,
                    active.end - active.next_fit,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::alloc_class::HeaderKind;

    fn run_bucket() -> Arc<Bucket> {
        let class = Arc::new(AllocClass::new(1, HeaderKind::Compact, 1024, 100).unwrap());
        Bucket::new_run(class)
    }

    #[test]
    fn test_next_fit_serves_sequential_offsets() {
        let bucket = run_bucket();
        let mut state = bucket.lock();
        state.container.insert(MemoryBlock::units(0, 4, 0, 10));
        let a = state.reserve_units(2).unwrap();
        let b = state.reserve_units(3).unwrap();
        assert_eq!((a.block_off, a.size_idx), (0, 2));
        assert_eq!((b.block_off, b.size_idx), (2, 3));
        assert!(state.is_active_run(0, 4));
    }

    #[test]
    fn test_active_exhaustion_returns_remainder() {
        let bucket = run_bucket();
        let mut state = bucket.lock();
        state.container.insert(MemoryBlock::units(0, 4, 0, 5));
        state.container.insert(MemoryBlock::units(0, 9, 0, 8));
        let a = state.reserve_units(3).unwrap();
        assert_eq!(a.chunk_id, 4);
        // 2 units left in the active run; a request for 4 must retire it
        // and pull the larger block.
        let b = state.reserve_units(4).unwrap();
        assert_eq!(b.chunk_id, 9);
        // The remainder is findable again.
        let c = state.reserve_units(2).unwrap();
        assert_eq!((c.chunk_id, c.block_off), (4, 3));
    }

    #[test]
    fn test_exact_fit_leaves_no_active() {
        let bucket = run_bucket();
        let mut state = bucket.lock();
        state.container.insert(MemoryBlock::units(0, 4, 6, 2));
        let m = state.reserve_units(2).unwrap();
        assert_eq!((m.block_off, m.size_idx), (6, 2));
        assert!(state.active.is_none());
        assert!(state.reserve_units(1).is_none());
    }

    #[test]
    fn test_retire_active_reinserts_remainder() {
        let bucket = run_bucket();
        let mut state = bucket.lock();
        state.container.insert(MemoryBlock::units(0, 4, 0, 10));
        state.reserve_units(4).unwrap();
        state.retire_active();
        assert!(state.active.is_none());
        assert!(state.container.contains(&MemoryBlock::units(0, 4, 4, 6)));
    }

    #[test]
    fn test_huge_calc_units() {
        let bucket = Bucket::new_huge();
        assert_eq!(bucket.calc_units(1).unwrap(), 1);
        assert_eq!(bucket.calc_units(CHUNK_SIZE - ALLOC_HEADER_SIZE).unwrap(), 1);
        assert_eq!(bucket.calc_units(CHUNK_SIZE).unwrap(), 2);
        assert_eq!(bucket.calc_units(1_000_000).unwrap(), 4);
    }
}
