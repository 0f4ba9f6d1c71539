//! Shared fixtures for allocator integration tests
//!
//! Everything runs against [`SimulatedDevice`], so no GPU is needed. Tests
//! that touch process environment variables must be marked `#[serial]`, and
//! ones that depend on a value read once per process get their own binary.

#![allow(dead_code)]

use std::sync::Arc;

use devalloc::{BfcAllocator, BfcConfig, DevicePtr, SimulatedDevice};
pub use serial_test::serial;

/// Granularity used by the small-pool fixtures
pub const MIN_ALLOC: usize = 100;

/// Pool limit used by the small-pool fixtures
pub const POOL_LIMIT: usize = 1000;

/// Allocator plus the device it draws from
pub struct PoolFixture {
    pub device: Arc<SimulatedDevice>,
    pub alloc: BfcAllocator,
}

impl PoolFixture {
    /// Panic with the invariant violation, if any
    pub fn assert_invariants(&self) {
        if let Err(err) = self.alloc.validate_invariants() {
            panic!("allocator invariants violated: {}", err);
        }
    }

    /// Free every pointer and check the pool is fully coalesced again
    pub fn free_all(&self, ptrs: impl IntoIterator<Item = DevicePtr>) {
        for ptr in ptrs {
            self.alloc.free(ptr);
        }
        self.assert_invariants();
        let stats = self.alloc.stats().expect("stats");
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.free_chunk_count, stats.num_regions);
    }
}

/// Allocator over a 1000-byte pool with 100-byte granularity
pub fn small_pool() -> PoolFixture {
    pool_with(
        BfcConfig::new()
            .with_min_allocation_size(MIN_ALLOC)
            .with_memory_limit(POOL_LIMIT)
            .with_region_cap(usize::MAX)
            .with_name("small_pool"),
    )
}

/// Allocator over a simulated 1 GiB device built from `config`
pub fn pool_with(config: BfcConfig) -> PoolFixture {
    let device = Arc::new(SimulatedDevice::new(1 << 30));
    let alloc = BfcAllocator::new(device.clone(), config).expect("allocator construction");
    PoolFixture { device, alloc }
}

/// Whether `[a, a + a_len)` and `[b, b + b_len)` intersect
pub fn overlaps(a: DevicePtr, a_len: usize, b: DevicePtr, b_len: usize) -> bool {
    a.addr() < b.addr() + b_len && b.addr() < a.addr() + a_len
}
