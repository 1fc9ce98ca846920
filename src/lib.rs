//! pmem-heap - A Crash-Safe Transactional Heap for Persistent Memory
//!
//! pmem-heap is a chunk-and-run allocator over a byte-addressable mapped
//! pool. Clients open a pool, obtain offsets through `alloc`/`realloc`, and
//! resolve them with `direct`; every metadata mutation is made atomic by a
//! per-lane redo log, so reopening after any crash returns the pool to the
//! state of the last committed operation.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Durability and on-media format
pub mod layout;
pub mod pmem;
pub mod redo;

// Operation machinery
pub mod lane;
pub mod memops;

// Main functional modules
pub mod ctl;
pub mod heap;
pub mod pool;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Result};
pub use ctl::CtlValue;
pub use heap::Heap;
pub use pool::{Pool, PoolOptions};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing for binaries embedding the heap
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
