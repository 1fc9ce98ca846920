//! Operation context: aggregated memory operations.
//!
//! The context collects every memory modification an operation needs to make
//! atomically (all of them or none), and abstracts away whether a target is
//! persistent (inside the pool) or transient (process memory). Persistent
//! entries go through the lane's redo log; when exactly one persistent entry
//! exists the redo machinery is skipped entirely, because a single aligned
//! 8-byte store is already crash-atomic.
//!
//! Nothing is visible until the context is processed. Processing order is
//! persistent then transient: a transient entry may publish a value that
//! only becomes meaningful once the persistent state it references exists.

use crate::core::error::Result;
use crate::pmem::{Mapping, PersistOps};
use crate::redo::{self, RedoEntry, RedoOp};

/// A staged transient entry; the raw pointer targets process memory.
#[derive(Debug, Clone, Copy)]
struct TransientEntry {
    ptr: *mut u64,
    value: u64,
    op: RedoOp,
}

/// Staging area for one atomic multi-word mutation.
pub struct OperationContext<'a> {
    map: &'a Mapping,
    ops: &'a dyn PersistOps,
    redo_off: u64,
    redo_capacity: usize,
    persistent: Vec<RedoEntry>,
    transient: Vec<TransientEntry>,
}

impl<'a> OperationContext<'a> {
    /// Create a context backed by the redo log at `redo_off`.
    pub fn new(
        map: &'a Mapping,
        ops: &'a dyn PersistOps,
        redo_off: u64,
        redo_capacity: usize,
    ) -> Self {
        Self {
            map,
            ops,
            redo_off,
            redo_capacity,
            persistent: Vec::with_capacity(8),
            transient: Vec::new(),
        }
    }

    /// Ensure the backing log can hold `nentries` persistent entries.
    pub fn reserve(&self, nentries: usize) -> Result<()> {
        redo::reserve(self.map, self.redo_off, self.redo_capacity, nentries)
    }

    /// Number of staged persistent entries
    pub fn persistent_len(&self) -> usize {
        self.persistent.len()
    }

    /// Whether nothing has been staged
    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.transient.is_empty()
    }

    /// Stage a 64-bit mutation, choosing persistent or transient by where
    /// the pointer lives.
    ///
    /// An entry for the same `(target, op)` pair coalesces instead of
    /// duplicating: SET keeps the latest value, AND and OR merge their
    /// masks. The run bitmap fast path relies on this to fold adjacent unit
    /// mutations into a single entry.
    pub fn add_entry(&mut self, ptr: *mut u64, value: u64, op: RedoOp) {
        if self.map.contains_ptr(ptr as *const u8) {
            let offset = self.map.offset_of(ptr as *const u8);
            debug_assert!(offset % 8 == 0);
            if let Some(e) = self
                .persistent
                .iter_mut()
                .find(|e| e.offset == offset && e.op == op)
            {
                e.value = coalesce(e.value, value, op);
                return;
            }
            self.persistent.push(RedoEntry::new(offset, value, op));
        } else {
            if let Some(e) = self
                .transient
                .iter_mut()
                .find(|e| std::ptr::eq(e.ptr, ptr) && e.op == op)
            {
                e.value = coalesce(e.value, value, op);
                return;
            }
            self.transient.push(TransientEntry { ptr, value, op });
        }
    }

    /// Atomically apply everything staged.
    ///
    /// One persistent entry is applied directly; more go through
    /// store-then-process on the lane's redo log. Transient entries are
    /// applied afterwards, in staging order, without flushes.
    pub fn process(&mut self) {
        match self.persistent.len() {
            0 => {}
            1 => {
                let e = self.persistent[0];
                apply_direct(self.map, self.ops, &e);
            }
            _ => {
                redo::store(
                    self.map,
                    self.ops,
                    self.redo_off,
                    self.redo_capacity,
                    &mut self.persistent,
                );
                redo::process(self.map, self.ops, self.redo_off, self.redo_capacity);
            }
        }

        for t in &self.transient {
            unsafe {
                let cur = std::ptr::read(t.ptr);
                std::ptr::write(
                    t.ptr,
                    match t.op {
                        RedoOp::Set => t.value,
                        RedoOp::And => cur & t.value,
                        RedoOp::Or => cur | t.value,
                    },
                );
            }
        }

        self.persistent.clear();
        self.transient.clear();
    }
}

fn coalesce(existing: u64, value: u64, op: RedoOp) -> u64 {
    match op {
        RedoOp::Set => value,
        RedoOp::And => existing & value,
        RedoOp::Or => existing | value,
    }
}

fn apply_direct(map: &Mapping, ops: &dyn PersistOps, e: &RedoEntry) {
    let target = map.u64_at(e.offset);
    unsafe {
        match e.op {
            RedoOp::Set => std::ptr::write_volatile(target, e.value),
            RedoOp::And => {
                std::ptr::write_volatile(target, std::ptr::read_volatile(target) & e.value)
            }
            RedoOp::Or => {
                std::ptr::write_volatile(target, std::ptr::read_volatile(target) | e.value)
            }
        }
    }
    ops.persist(target as *const u8, 8);
}
