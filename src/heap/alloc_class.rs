//! Allocation size classes and the size-to-class range table.
//!
//! A class pairs a unit size with a bitmap shape and a header variant:
//! `Legacy` units carry a 16-byte allocation header, `Compact` units carry
//! none. A Compact allocation is therefore always exactly one unit, because
//! nothing on media could say how many units to free otherwise.
//!
//! Requested byte sizes map to classes through a user-controllable range
//! table. Sizes above the table's limit, and sizes past the last mapped
//! range, fall through to the huge bucket.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::heap::run::{RunBitmap, RUN_UNIT_MAX};
use crate::layout::{ALLOC_HEADER_SIZE, CHUNK_SIZE, RUN_DATA_OFF};

/// Highest usable class id
pub const MAX_CLASS_ID: u8 = 254;

/// Allocation header variant of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// 16-byte per-allocation header before every unit span
    Legacy,
    /// No per-allocation header; one unit per allocation
    Compact,
}

/// One registered size class.
#[derive(Debug)]
pub struct AllocClass {
    /// Class id
    pub id: u8,
    /// Header variant
    pub header: HeaderKind,
    /// Unit size in bytes
    pub unit_size: u64,
    /// Requested units per run; the bitmap shape caps it
    pub units_per_block: u32,
    /// Bitmap shape of this class's runs
    pub bitmap: RunBitmap,
    /// Largest span one allocation may cover
    pub unit_max: u32,
}

impl AllocClass {
    /// Validate and build a class.
    pub fn new(id: u8, header: HeaderKind, unit_size: u64, units_per_block: u32) -> Result<Self> {
        let usable = CHUNK_SIZE - RUN_DATA_OFF;
        if unit_size < 8 || unit_size > usable {
            return Err(Error::invalid_argument(format!(
                "class unit size {unit_size} out of range"
            )));
        }
        if units_per_block == 0 {
            return Err(Error::invalid_argument("class units_per_block is zero"));
        }
        let bitmap = RunBitmap::for_class(unit_size, units_per_block);
        Ok(Self {
            id,
            header,
            unit_size,
            units_per_block,
            bitmap,
            unit_max: RUN_UNIT_MAX.min(bitmap.nallocs),
        })
    }

    /// Per-allocation header bytes of this class
    pub fn header_size(&self) -> u64 {
        match self.header {
            HeaderKind::Legacy => ALLOC_HEADER_SIZE,
            HeaderKind::Compact => 0,
        }
    }

    /// Units needed to hold `size` bytes, header included.
    pub fn calc_units(&self, size: u64) -> Result<u32> {
        debug_assert_ne!(size, 0);
        let need = size + self.header_size();
        let units = need.div_ceil(self.unit_size) as u32;
        match self.header {
            HeaderKind::Compact if units != 1 => Err(Error::invalid_argument(format!(
                "size {size} does not fit one {}-byte unit of headerless class {}",
                self.unit_size, self.id
            ))),
            _ if units > self.unit_max => Err(Error::invalid_argument(format!(
                "size {size} spans {units} units, class {} allows {}",
                self.id, self.unit_max
            ))),
            _ => Ok(units),
        }
    }

    /// Bytes a span of `size_idx` units occupies
    pub fn real_size(&self, size_idx: u32) -> u64 {
        size_idx as u64 * self.unit_size
    }
}

/// Externally visible class description, the ctl `desc` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocClassDesc {
    /// Header variant
    pub header_type: HeaderKind,
    /// Unit size in bytes
    pub unit_size: u64,
    /// Units per run block
    pub units_per_block: u32,
}

/// The ctl `reset` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassResetParams {
    /// Range-table granularity hint
    pub granularity: u64,
    /// Largest size the table may cover
    pub limit: u64,
    /// Fail unmapped sizes instead of falling through
    pub fail_no_matching_class: bool,
}

/// The ctl `map.range` payload: bind sizes in `[start, end]` to a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassMapRange {
    /// Target class id
    pub class_id: u8,
    /// First size bound to the class
    pub start: u64,
    /// Last size bound to the class
    pub end: u64,
}

/// Registered classes plus the size range table.
pub struct ClassTable {
    classes: Vec<Option<Arc<AllocClass>>>,
    /// start -> (end, class id), non-overlapping
    ranges: BTreeMap<u64, (u64, u8)>,
    granularity: u64,
    limit: u64,
    fail_no_matching_class: bool,
}

impl ClassTable {
    /// Empty table with the given parameters.
    pub fn empty(granularity: u64, limit: u64, fail_no_matching_class: bool) -> Self {
        Self {
            classes: vec![None; MAX_CLASS_ID as usize + 1],
            ranges: BTreeMap::new(),
            granularity,
            limit,
            fail_no_matching_class,
        }
    }

    /// Default table covering common small sizes; everything above the last
    /// range goes to the huge bucket.
    pub fn with_defaults(granularity: u64, limit: u64) -> Self {
        let mut table = Self::empty(granularity, limit, false);
        let mut id = 1u8;
        let mut lo = 1u64;
        let mut unit = 256u64;
        while unit <= 64 * 1024 && unit <= limit {
            let hi = unit - ALLOC_HEADER_SIZE;
            table
                .set_desc(
                    id,
                    AllocClassDesc {
                        header_type: HeaderKind::Legacy,
                        unit_size: unit,
                        units_per_block: 1024,
                    },
                )
                .expect("default class");
            table
                .map_range(ClassMapRange {
                    class_id: id,
                    start: lo,
                    end: hi,
                })
                .expect("default range");
            lo = hi + 1;
            unit *= 2;
            id += 1;
        }
        table
    }

    /// Range-table granularity
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Class by id
    pub fn class(&self, id: u8) -> Option<Arc<AllocClass>> {
        self.classes.get(id as usize)?.clone()
    }

    /// Register a class under an unused id.
    pub fn set_desc(&mut self, id: u8, desc: AllocClassDesc) -> Result<()> {
        if id > MAX_CLASS_ID {
            return Err(Error::invalid_argument(format!("class id {id} out of range")));
        }
        if self.classes[id as usize].is_some() {
            return Err(Error::invalid_argument(format!("class {id} already set")));
        }
        let class = AllocClass::new(id, desc.header_type, desc.unit_size, desc.units_per_block)?;
        self.classes[id as usize] = Some(Arc::new(class));
        Ok(())
    }

    /// Description of a registered class.
    pub fn get_desc(&self, id: u8) -> Result<AllocClassDesc> {
        let class = self
            .class(id)
            .ok_or_else(|| Error::invalid_argument(format!("class {id} is not set")))?;
        Ok(AllocClassDesc {
            header_type: class.header,
            unit_size: class.unit_size,
            // Report the shape actually carved into runs.
            units_per_block: class.bitmap.nallocs,
        })
    }

    /// Find or register the class matching a run discovered on media. The
    /// bitmap shape must match exactly so that fullness and demotion checks
    /// read the run the way it was carved.
    pub fn adopt(
        &mut self,
        header: HeaderKind,
        unit_size: u64,
        nallocs: u32,
    ) -> Result<Arc<AllocClass>> {
        if let Some(existing) = self.classes.iter().flatten().find(|c| {
            c.unit_size == unit_size && c.header == header && c.bitmap.nallocs == nallocs
        }) {
            return Ok(Arc::clone(existing));
        }
        let id = self
            .classes
            .iter()
            .position(|c| c.is_none())
            .ok_or_else(|| Error::invalid_argument("class table full"))? as u8;
        let class = Arc::new(AllocClass::new(id, header, unit_size, nallocs)?);
        if class.bitmap.nallocs != nallocs {
            return Err(Error::corrupt(format!(
                "run shape {nallocs}x{unit_size} cannot exist in a chunk"
            )));
        }
        self.classes[id as usize] = Some(Arc::clone(&class));
        tracing::warn!(unit_size, nallocs, id, "registered class for unmatched on-media run");
        Ok(class)
    }

    /// Bind a size range to a class.
    pub fn map_range(&mut self, range: ClassMapRange) -> Result<()> {
        let class = self
            .class(range.class_id)
            .ok_or_else(|| Error::invalid_argument(format!("class {} is not set", range.class_id)))?;
        if range.start == 0 || range.start > range.end || range.end > self.limit {
            return Err(Error::invalid_argument(format!(
                "bad range [{}, {}] (limit {})",
                range.start, range.end, self.limit
            )));
        }
        // Largest mapped size must fit the class.
        class.calc_units(range.end)?;
        let overlaps = self
            .ranges
            .range(..=range.end)
            .next_back()
            .map(|(_, &(end, _))| end >= range.start)
            .unwrap_or(false);
        if overlaps {
            return Err(Error::invalid_argument(format!(
                "range [{}, {}] overlaps an existing mapping",
                range.start, range.end
            )));
        }
        self.ranges.insert(range.start, (range.end, range.class_id));
        Ok(())
    }

    /// Drop every class and mapping, keeping the new parameters.
    pub fn reset(&mut self, params: ClassResetParams) -> Result<()> {
        if params.granularity == 0 || params.limit < params.granularity {
            return Err(Error::invalid_argument("bad class table parameters"));
        }
        *self = Self::empty(params.granularity, params.limit, params.fail_no_matching_class);
        Ok(())
    }

    /// Class serving `size` bytes; `None` routes to the huge bucket.
    pub fn resolve(&self, size: u64) -> Result<Option<Arc<AllocClass>>> {
        if size == 0 {
            return Err(Error::invalid_argument("zero-size allocation"));
        }
        if size > self.limit {
            return Ok(None);
        }
        if let Some((&start, &(end, id))) = self.ranges.range(..=size).next_back() {
            debug_assert!(start <= size);
            if size <= end {
                return Ok(Some(self.class(id).expect("mapped class")));
            }
        }
        if self.fail_no_matching_class {
            return Err(Error::invalid_argument(format!(
                "no allocation class matches size {size}"
            )));
        }
        // Fall through to the next larger mapped range, else huge.
        match self.ranges.range(size..).next() {
            Some((_, &(_, id))) => Ok(Some(self.class(id).expect("mapped class"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_covers_small_sizes() {
        let table = ClassTable::with_defaults(256, 64 * 1024);
        let class = table.resolve(128).unwrap().unwrap();
        assert_eq!(class.unit_size, 256);
        assert_eq!(class.calc_units(128).unwrap(), 1);

        let class = table.resolve(1000).unwrap().unwrap();
        assert_eq!(class.unit_size, 1024);

        // Above every run class: huge.
        assert!(table.resolve(1_000_000).unwrap().is_none());
    }

    #[test]
    fn test_reset_empties_the_table() {
        let mut table = ClassTable::with_defaults(256, 64 * 1024);
        table
            .reset(ClassResetParams {
                granularity: 16,
                limit: 1024 * 1024,
                fail_no_matching_class: true,
            })
            .unwrap();
        assert!(table.resolve(128).is_err());
        // Sizes above the limit still reach the huge bucket.
        assert!(table.resolve(2 * 1024 * 1024).unwrap().is_none());
    }

    #[test]
    fn test_map_range_binds_class() {
        let mut table = ClassTable::empty(16, 1024 * 1024, true);
        table
            .set_desc(
                7,
                AllocClassDesc {
                    header_type: HeaderKind::Compact,
                    unit_size: 128,
                    units_per_block: 500,
                },
            )
            .unwrap();
        table
            .map_range(ClassMapRange {
                class_id: 7,
                start: 1,
                end: 128,
            })
            .unwrap();
        let class = table.resolve(16).unwrap().unwrap();
        assert_eq!(class.id, 7);
        assert!(table.resolve(129).is_err());
    }

    #[test]
    fn test_desc_roundtrip_reports_carved_shape() {
        let mut table = ClassTable::empty(16, 1024 * 1024, false);
        let desc = AllocClassDesc {
            header_type: HeaderKind::Compact,
            unit_size: 128,
            units_per_block: 500,
        };
        table.set_desc(3, desc).unwrap();
        let got = table.get_desc(3).unwrap();
        assert_eq!(got.header_type, desc.header_type);
        assert_eq!(got.unit_size, desc.unit_size);
        assert_eq!(got.units_per_block, 500);
        assert!(table.get_desc(4).is_err());
        assert!(table.set_desc(3, desc).is_err());
    }

    #[test]
    fn test_overlapping_range_rejected() {
        let mut table = ClassTable::empty(16, 1 << 20, false);
        let desc = AllocClassDesc {
            header_type: HeaderKind::Legacy,
            unit_size: 256,
            units_per_block: 100,
        };
        table.set_desc(1, desc).unwrap();
        table
            .map_range(ClassMapRange {
                class_id: 1,
                start: 100,
                end: 200,
            })
            .unwrap();
        assert!(table
            .map_range(ClassMapRange {
                class_id: 1,
                start: 150,
                end: 300,
            })
            .is_err());
        assert!(table
            .map_range(ClassMapRange {
                class_id: 1,
                start: 201,
                end: 240,
            })
            .is_ok());
    }

    #[test]
    fn test_compact_class_single_unit_only() {
        let class = AllocClass::new(1, HeaderKind::Compact, 128, 100).unwrap();
        assert_eq!(class.calc_units(128).unwrap(), 1);
        assert!(class.calc_units(129).is_err());
    }

    #[test]
    fn test_legacy_class_accounts_for_header() {
        let class = AllocClass::new(1, HeaderKind::Legacy, 256, 100).unwrap();
        assert_eq!(class.calc_units(240).unwrap(), 1);
        assert_eq!(class.calc_units(241).unwrap(), 2);
    }

    #[test]
    fn test_adopt_reuses_matching_class() {
        let mut table = ClassTable::with_defaults(256, 64 * 1024);
        let default_shape = table.class(1).unwrap().bitmap.nallocs;
        let a = table.adopt(HeaderKind::Legacy, 256, default_shape).unwrap();
        assert_eq!(a.id, 1);
        // A different shape of the same unit gets its own class.
        let b = table.adopt(HeaderKind::Compact, 1000, 50).unwrap();
        let c = table.adopt(HeaderKind::Compact, 1000, 50).unwrap();
        assert_eq!(b.id, c.id);
        assert_ne!(b.id, a.id);
        assert_eq!(b.bitmap.nallocs, 50);
    }
}
