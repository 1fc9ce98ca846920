//! Error types and handling for the persistent heap.
//!
//! This module defines all error types used throughout the crate,
//! optimized for zero-cost error propagation and clear diagnostics.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the persistent heap
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Heap layer errors
    #[error("Heap error: {0}")]
    Heap(#[from] HeapError),

    /// Pool lifecycle errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Heap-specific errors
#[derive(Error, Debug)]
pub enum HeapError {
    /// No free block of the required size after exhausting every fallback
    #[error("Out of memory")]
    OutOfMemory,

    /// Bad argument: unknown control key, zero size, class id out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Double free or free of a block that is not allocated
    #[error("Invalid state: block is not allocated")]
    DoubleFree,

    /// The caller demands finer durability granularity than the mapping supports
    #[error("Mapping granularity mismatch")]
    GranularityMismatch,
}

/// Pool lifecycle errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Open-time rejection: the pool was created by an incompatible build
    #[error("Incompatible pool: {0}")]
    Incompatible(String),

    /// Neither the primary header nor any backup validates, or a consistency
    /// check failed
    #[error("Pool corruption detected: {0}")]
    Corrupt(String),

    /// The requested pool size cannot hold a single zone
    #[error("Pool too small: {size} bytes (min: {min})")]
    TooSmall {
        /// Requested pool size in bytes
        size: u64,
        /// Minimum supported pool size in bytes
        min: u64,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::Heap(HeapError::InvalidArgument(msg.into()))
    }

    /// Create a pool corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Pool(PoolError::Corrupt(msg.into()))
    }

    /// Check if this error maps to the EINVAL class of failures
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::Heap(HeapError::InvalidArgument(_)) | Error::Heap(HeapError::DoubleFree)
        )
    }

    /// Check if this error is an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::Heap(HeapError::OutOfMemory))
    }
}
