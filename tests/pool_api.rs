//! End-to-end pool API scenarios.

use pmem_heap::heap::alloc_class::{
    AllocClassDesc, ClassMapRange, ClassResetParams, HeaderKind,
};
use pmem_heap::{CtlValue, Pool, PoolOptions};

const POOL_SIZE: u64 = 64 * 1024 * 1024;

fn options() -> PoolOptions {
    PoolOptions {
        size: POOL_SIZE,
        lane_count: 64,
        ..PoolOptions::default()
    }
}

fn stat(pool: &Pool, name: &str) -> u64 {
    match pool.ctl_get(name).unwrap() {
        CtlValue::U64(v) => v,
        other => panic!("unexpected ctl value {other:?}"),
    }
}

#[test]
fn huge_alloc_free_roundtrip_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("roundtrip.pool");

    let pool = Pool::create(&path, &options()).unwrap();
    let mut p = 0u64;
    pool.heap().alloc(&mut p, 1_000_000).unwrap();
    assert_ne!(p, 0);
    assert!(pool.heap().usable_size(p).unwrap() >= 1_000_000);
    pool.heap().free(&mut p).unwrap();
    assert_eq!(p, 0);
    pool.close().unwrap();

    let pool = Pool::open(&path, &options()).unwrap();
    assert_eq!(stat(&pool, "stats.heap.allocated"), 0);
    pool.close().unwrap();
}

#[test]
fn small_allocations_fill_a_run_and_demote_on_free() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("runs.pool");

    let pool = Pool::create(&path, &options()).unwrap();
    pool.ctl_set(
        "heap.alloc_class.reset",
        &CtlValue::Reset(ClassResetParams {
            granularity: 16,
            limit: 64 * 1024,
            fail_no_matching_class: true,
        }),
    )
    .unwrap();
    pool.ctl_set(
        "heap.alloc_class.1.desc",
        &CtlValue::ClassDesc(AllocClassDesc {
            header_type: HeaderKind::Compact,
            unit_size: 128,
            units_per_block: 1000,
        }),
    )
    .unwrap();
    pool.ctl_set(
        "heap.alloc_class.map.range",
        &CtlValue::MapRange(ClassMapRange {
            class_id: 1,
            start: 1,
            end: 128,
        }),
    )
    .unwrap();

    let mut slots = Vec::new();
    for _ in 0..1000 {
        let mut slot = 0u64;
        pool.heap().alloc(&mut slot, 128).unwrap();
        slots.push(slot);
    }
    let mut unique = slots.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 1000, "offsets must be distinct");

    // The 1001st allocation lands in a freshly promoted run.
    let mut extra = 0u64;
    pool.heap().alloc(&mut extra, 128).unwrap();
    pool.heap().free(&mut extra).unwrap();

    for slot in slots.iter_mut().rev() {
        pool.heap().free(slot).unwrap();
    }
    assert_eq!(stat(&pool, "stats.heap.allocated"), 0);
    pool.close().unwrap();

    // After reopen the demoted chunks are plain free space again: the same
    // pool serves a maximal huge allocation.
    let pool = Pool::open(&path, &options()).unwrap();
    assert_eq!(stat(&pool, "stats.heap.allocated"), 0);
    let mut big = 0u64;
    pool.heap().alloc(&mut big, 4 * 1024 * 1024).unwrap();
    pool.heap().free(&mut big).unwrap();
    pool.close().unwrap();
}

#[test]
fn ctl_parser_scenario() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("ctl.pool");
    let pool = Pool::create(&path, &options()).unwrap();

    let desc = AllocClassDesc {
        header_type: HeaderKind::Compact,
        unit_size: 128,
        units_per_block: 500,
    };
    pool.ctl_set("heap.alloc_class.7.desc", &CtlValue::ClassDesc(desc))
        .unwrap();
    let CtlValue::ClassDesc(got) = pool.ctl_get("heap.alloc_class.7.desc").unwrap() else {
        panic!("class description expected");
    };
    assert_eq!(got.header_type, desc.header_type);
    assert_eq!(got.unit_size, desc.unit_size);

    assert!(pool.ctl_set("heap..", &CtlValue::U64(0)).is_err());

    pool.ctl_set(
        "heap.alloc_class.reset",
        &CtlValue::Reset(ClassResetParams {
            granularity: 16,
            limit: 1024 * 1024,
            fail_no_matching_class: true,
        }),
    )
    .unwrap();
    let mut slot = 0u64;
    assert!(pool
        .heap()
        .alloc(&mut slot, 128)
        .unwrap_err()
        .is_invalid_argument());

    pool.ctl_set(
        "heap.alloc_class.3.desc",
        &CtlValue::ClassDesc(AllocClassDesc {
            header_type: HeaderKind::Compact,
            unit_size: 128,
            units_per_block: 500,
        }),
    )
    .unwrap();
    pool.ctl_set(
        "heap.alloc_class.map.range",
        &CtlValue::MapRange(ClassMapRange {
            class_id: 3,
            start: 16,
            end: 128,
        }),
    )
    .unwrap();
    pool.heap().alloc(&mut slot, 16).unwrap();
    assert_ne!(slot, 0);
    pool.heap().free(&mut slot).unwrap();
    pool.close().unwrap();
}

#[test]
fn realloc_preserves_payload_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("realloc.pool");

    let pool = Pool::create(&path, &options()).unwrap();
    let mut p = 0u64;
    pool.heap().alloc(&mut p, 4096).unwrap();
    let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), pool.heap().direct(p), payload.len())
    };
    pool.heap().realloc(&mut p, 2_000_000).unwrap();
    assert!(pool.heap().usable_size(p).unwrap() >= 2_000_000);
    let off = p;
    pool.close().unwrap();

    let pool = Pool::open(&path, &options()).unwrap();
    let data = unsafe { std::slice::from_raw_parts(pool.heap().direct(off), payload.len()) };
    assert_eq!(data, &payload[..]);
    pool.close().unwrap();
}
