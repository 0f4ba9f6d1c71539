//! Best-fit with coalescing (BFC) allocator
//!
//! Carves caller allocations out of a small number of large regions reserved
//! from a [`Device`](crate::backend::Device). Free chunks are kept in
//! exponentially sized bins and merged with free neighbours as soon as they
//! are released.

pub mod allocator;
pub mod bins;
pub mod chunk;
pub mod config;
pub mod growth;
pub mod region;
pub mod stats;

pub use allocator::BfcAllocator;
pub use bins::{BinSummary, NUM_BINS};
pub use config::{
    BfcConfig, DEFAULT_DEVICE_HEADROOM, DEFAULT_FRAGMENTATION_THRESHOLD,
    DEFAULT_MIN_ALLOCATION_SIZE, MAX_MIN_ALLOCATION_SIZE, REGION_CAP_ENV,
};
pub use stats::AllocatorStats;
