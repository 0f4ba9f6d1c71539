//! Device backend: the reservation primitive the allocator draws regions from

pub mod capability;
pub mod device;
pub mod error;
pub mod registry;
pub mod simulated;

pub use capability::DeviceFamily;
pub use device::{Device, DevicePtr};
pub use error::{DeviceError, DeviceResult};
pub use registry::DeviceRegistry;
pub use simulated::SimulatedDevice;
