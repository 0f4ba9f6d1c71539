//! devalloc - device memory pool allocator
//!
//! A best-fit with coalescing allocator that manages a bounded pool of
//! device memory, reserving large regions from the device and sub-allocating
//! them to callers.

pub mod backend;
pub mod bfc;
pub mod error;
pub mod logging;

pub use backend::{Device, DeviceError, DeviceFamily, DevicePtr, DeviceRegistry, SimulatedDevice};
pub use bfc::{AllocatorStats, BfcAllocator, BfcConfig};
pub use error::{BfcError, BfcResult, ErrorCategory};
pub use logging::{init_logging_default, init_logging_from_env, init_with_config, LoggingConfig};
