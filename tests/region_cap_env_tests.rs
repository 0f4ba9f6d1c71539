//! Region cap taken from `DEVALLOC_LIMIT_MEMORY_SIZE_IN_MB`.
//!
//! The variable is read once per process, so this binary holds a single
//! test that sets it before any allocator exists.

mod common;

use common::{pool_with, serial};
use devalloc::bfc::config::region_cap_from_env;
use devalloc::bfc::REGION_CAP_ENV;
use devalloc::BfcConfig;

#[test]
#[serial]
fn test_region_cap_from_environment_is_read_once() {
    std::env::set_var(REGION_CAP_ENV, "1");

    let pool = pool_with(BfcConfig::new().with_memory_limit(16 << 20));
    let a = pool.alloc.allocate(4096).unwrap();
    assert_eq!(pool.device.reserve_log(), vec![1 << 20]);
    pool.free_all([a]);

    // Later changes are not picked up
    std::env::set_var(REGION_CAP_ENV, "2");
    assert_eq!(region_cap_from_env(), Some(1 << 20));
    let pool = pool_with(BfcConfig::new().with_memory_limit(16 << 20));
    let b = pool.alloc.allocate(4096).unwrap();
    assert_eq!(pool.device.reserve_log(), vec![1 << 20]);
    pool.free_all([b]);

    // An explicit cap still wins over the environment
    let pool = pool_with(
        BfcConfig::new()
            .with_memory_limit(16 << 20)
            .with_region_cap(4 << 20),
    );
    let c = pool.alloc.allocate(4096).unwrap();
    assert_eq!(pool.device.reserve_log(), vec![4 << 20]);
    pool.free_all([c]);

    std::env::remove_var(REGION_CAP_ENV);
}
