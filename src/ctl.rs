//! Hierarchical string-keyed control surface.
//!
//! Keys are dot-separated paths into a fixed node tree; leaves are
//! read-only, write-only or read-write. Unknown or structurally invalid
//! names fail with an invalid-argument error, as does reading a write-only
//! leaf or writing a read-only one.
//!
//! ```text
//! stats.heap.{allocated,freed,active_zones}     RO
//! heap.alloc_class.reset                        WO
//! heap.alloc_class.map.range                    WO
//! heap.alloc_class.<id>.desc                    RW
//! debug.{test_ro,test_wo,test_rw}               test plumbing
//! ```

use crate::core::error::{Error, Result};
use crate::heap::alloc_class::{AllocClassDesc, ClassMapRange, ClassResetParams};
use crate::heap::Heap;

/// Value carried through a control read or write.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlValue {
    /// Plain 64-bit quantity
    U64(u64),
    /// Allocation class description
    ClassDesc(AllocClassDesc),
    /// Class table reset parameters
    Reset(ClassResetParams),
    /// Size range binding
    MapRange(ClassMapRange),
}

impl CtlValue {
    fn as_u64(&self) -> Result<u64> {
        match self {
            CtlValue::U64(v) => Ok(*v),
            _ => Err(Error::invalid_argument("expected a numeric value")),
        }
    }
}

fn unknown(name: &str) -> Error {
    Error::invalid_argument(format!("unknown control node: {name}"))
}

fn parse_class_id(token: &str) -> Result<u8> {
    token
        .parse::<u8>()
        .map_err(|_| Error::invalid_argument(format!("bad class id: {token}")))
}

/// Split a name into tokens, rejecting empty path segments.
fn tokenize(name: &str) -> Result<Vec<&str>> {
    let tokens: Vec<&str> = name.split('.').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(Error::invalid_argument(format!("malformed control name: {name}")));
    }
    Ok(tokens)
}

/// Read a control node.
pub fn ctl_get(heap: &Heap, name: &str) -> Result<CtlValue> {
    let tokens = tokenize(name)?;
    match tokens.as_slice() {
        ["stats", "heap", stat] => {
            // Populate the remaining zones so post-recovery counts are exact.
            heap.populate_all()?;
            match *stat {
                "allocated" => Ok(CtlValue::U64(heap.allocated_bytes())),
                "freed" => Ok(CtlValue::U64(heap.freed_bytes())),
                "active_zones" => Ok(CtlValue::U64(heap.active_zones())),
                _ => Err(unknown(name)),
            }
        }
        ["heap", "alloc_class", id, "desc"] => {
            let id = parse_class_id(id)?;
            Ok(CtlValue::ClassDesc(heap.class_table().read().get_desc(id)?))
        }
        ["debug", "test_ro"] => Ok(CtlValue::U64(0)),
        ["debug", "test_rw"] => Ok(CtlValue::U64(0)),
        ["debug", "test_wo"] => Err(Error::invalid_argument("test_wo is write-only")),
        ["heap", "alloc_class", "reset"] | ["heap", "alloc_class", "map", "range"] => {
            Err(Error::invalid_argument(format!("{name} is write-only")))
        }
        _ => Err(unknown(name)),
    }
}

/// Write a control node.
pub fn ctl_set(heap: &Heap, name: &str, value: &CtlValue) -> Result<()> {
    let tokens = tokenize(name)?;
    match tokens.as_slice() {
        ["heap", "alloc_class", "reset"] => match value {
            CtlValue::Reset(params) => heap.class_table().write().reset(*params),
            _ => Err(Error::invalid_argument("reset expects reset parameters")),
        },
        ["heap", "alloc_class", "map", "range"] => match value {
            CtlValue::MapRange(range) => heap.class_table().write().map_range(*range),
            _ => Err(Error::invalid_argument("map.range expects a range binding")),
        },
        ["heap", "alloc_class", id, "desc"] => {
            let id = parse_class_id(id)?;
            match value {
                CtlValue::ClassDesc(desc) => heap.class_table().write().set_desc(id, *desc),
                _ => Err(Error::invalid_argument("desc expects a class description")),
            }
        }
        ["debug", "test_wo"] | ["debug", "test_rw"] => {
            value.as_u64()?;
            Ok(())
        }
        ["debug", "test_ro"] => Err(Error::invalid_argument("test_ro is read-only")),
        ["stats", "heap", _] => Err(Error::invalid_argument(format!("{name} is read-only"))),
        _ => Err(unknown(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HeapConfig;
    use crate::heap::alloc_class::HeaderKind;
    use crate::layout::Geometry;
    use crate::pmem::{CacheLineFlush, Mapping, PersistOps};
    use memmap2::MmapMut;
    use std::sync::Arc;

    fn test_heap() -> Heap {
        let size = 16u64 << 20;
        let map = Arc::new(Mapping::new(MmapMut::map_anon(size as usize).unwrap()));
        let ops: Arc<dyn PersistOps> = Arc::new(CacheLineFlush);
        let geo = Geometry::new(size, 64).unwrap();
        Heap::new(map, ops, geo, &HeapConfig::default())
    }

    #[test]
    fn test_stats_nodes_read() {
        let heap = test_heap();
        let mut slot = 0u64;
        heap.alloc(&mut slot, 1_000_000).unwrap();
        assert_eq!(
            ctl_get(&heap, "stats.heap.allocated").unwrap(),
            CtlValue::U64(4 * crate::layout::CHUNK_SIZE)
        );
        assert_eq!(ctl_get(&heap, "stats.heap.freed").unwrap(), CtlValue::U64(0));
        let CtlValue::U64(zones) = ctl_get(&heap, "stats.heap.active_zones").unwrap() else {
            panic!("numeric stat expected");
        };
        assert!(zones >= 1);
        assert!(ctl_set(&heap, "stats.heap.allocated", &CtlValue::U64(0)).is_err());
    }

    #[test]
    fn test_malformed_names_rejected() {
        let heap = test_heap();
        for name in ["heap..", "", ".heap", "stats.heap.nope", "heap.alloc_class"] {
            assert!(
                ctl_get(&heap, name).is_err(),
                "expected rejection of {name:?}"
            );
        }
    }

    #[test]
    fn test_class_desc_roundtrip() {
        let heap = test_heap();
        let desc = AllocClassDesc {
            header_type: HeaderKind::Compact,
            unit_size: 128,
            units_per_block: 500,
        };
        ctl_set(&heap, "heap.alloc_class.77.desc", &CtlValue::ClassDesc(desc)).unwrap();
        let CtlValue::ClassDesc(got) = ctl_get(&heap, "heap.alloc_class.77.desc").unwrap() else {
            panic!("class description expected");
        };
        assert_eq!(got.header_type, desc.header_type);
        assert_eq!(got.unit_size, desc.unit_size);
        assert!(got.units_per_block <= desc.units_per_block);
    }

    #[test]
    fn test_reset_then_alloc_matches_scenario() {
        let heap = test_heap();
        ctl_set(
            &heap,
            "heap.alloc_class.reset",
            &CtlValue::Reset(ClassResetParams {
                granularity: 16,
                limit: 1024 * 1024,
                fail_no_matching_class: true,
            }),
        )
        .unwrap();

        let mut slot = 0u64;
        assert!(heap.alloc(&mut slot, 128).unwrap_err().is_invalid_argument());

        ctl_set(
            &heap,
            "heap.alloc_class.0.desc",
            &CtlValue::ClassDesc(AllocClassDesc {
                header_type: HeaderKind::Compact,
                unit_size: 128,
                units_per_block: 1000,
            }),
        )
        .unwrap();
        // Registered but not mapped: still no match.
        assert!(heap.alloc(&mut slot, 128).unwrap_err().is_invalid_argument());

        ctl_set(
            &heap,
            "heap.alloc_class.map.range",
            &CtlValue::MapRange(ClassMapRange {
                class_id: 0,
                start: 16,
                end: 128,
            }),
        )
        .unwrap();
        heap.alloc(&mut slot, 16).unwrap();
        assert_ne!(slot, 0);
        let mut below_range = 0u64;
        assert!(heap
            .alloc(&mut below_range, 8)
            .unwrap_err()
            .is_invalid_argument());
        heap.free(&mut slot).unwrap();
    }

    #[test]
    fn test_debug_nodes() {
        let heap = test_heap();
        assert_eq!(ctl_get(&heap, "debug.test_ro").unwrap(), CtlValue::U64(0));
        assert!(ctl_set(&heap, "debug.test_ro", &CtlValue::U64(1)).is_err());
        assert!(ctl_set(&heap, "debug.test_wo", &CtlValue::U64(1)).is_ok());
        assert!(ctl_get(&heap, "debug.test_wo").is_err());
        assert!(ctl_set(&heap, "debug.test_rw", &CtlValue::U64(1)).is_ok());
        assert_eq!(ctl_get(&heap, "debug.test_rw").unwrap(), CtlValue::U64(0));
    }
}
