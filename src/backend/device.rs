//! Device memory pointer and the device interface the allocator consumes

use std::fmt;

use super::capability::DeviceFamily;
use super::error::DeviceResult;

/// Address in a device's memory space.
///
/// The allocator never dereferences these; it only does arithmetic on them,
/// so a plain integer is enough and keeps the type `Send + Sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// The null device pointer
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn new(addr: usize) -> Self {
        DevicePtr(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub fn offset(self, bytes: usize) -> Self {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A device that owns a bounded pool of memory.
///
/// `reserve` and `release` are the raw reservation primitive. They are
/// called with the allocator lock held, so implementations do not need to
/// be reentrant for the duration of one call.
pub trait Device: Send + Sync {
    /// Human-readable device name as reported by the runtime
    fn name(&self) -> &str;

    /// Device ordinal within its registry
    fn ordinal(&self) -> usize;

    /// Total addressable memory in bytes
    fn total_memory(&self) -> usize;

    /// Reserve `bytes` of raw device memory
    fn reserve(&self, bytes: usize) -> DeviceResult<DevicePtr>;

    /// Return a reservation obtained from `reserve`
    fn release(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Whether a single region growth request should be capped conservatively
    fn needs_conservative_region_cap(&self) -> bool {
        self.family().needs_conservative_region_cap()
    }

    /// Hardware family used for allocation policy
    fn family(&self) -> DeviceFamily {
        DeviceFamily::from_name(self.name())
    }
}
