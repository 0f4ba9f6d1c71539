//! Configuration for the BFC allocator
//!
//! This module defines [`BfcConfig`], which controls size rounding, the
//! split policy, the pool limit, and how aggressively regions grow.

use once_cell::sync::Lazy;

use crate::backend::capability::region_cap_bytes;
use crate::backend::Device;
use crate::error::{BfcError, BfcResult};

use super::bins::NUM_BINS;

/// Default allocation granularity in bytes
pub const DEFAULT_MIN_ALLOCATION_SIZE: usize = 256;

/// Default largest padding tolerated on an unsplit chunk (128 MiB)
pub const DEFAULT_FRAGMENTATION_THRESHOLD: usize = 128 << 20;

/// Default memory left to the device runtime itself (800 MiB)
pub const DEFAULT_DEVICE_HEADROOM: usize = 800 << 20;

/// Largest granularity whose bin sizes all fit in `usize`
pub const MAX_MIN_ALLOCATION_SIZE: usize = usize::MAX >> NUM_BINS;

/// Environment variable capping a single region growth request, in MiB
pub const REGION_CAP_ENV: &str = "DEVALLOC_LIMIT_MEMORY_SIZE_IN_MB";

/// Region cap from the environment, read once per process
static ENV_REGION_CAP: Lazy<Option<usize>> = Lazy::new(|| {
    let raw = std::env::var(REGION_CAP_ENV).ok()?;
    let cap = parse_region_cap_mb(&raw);
    if cap.is_none() {
        tracing::warn!("Ignoring {}={:?}: expected a positive size in MiB", REGION_CAP_ENV, raw);
    }
    cap
});

/// Parse a region cap given in MiB into bytes
pub fn parse_region_cap_mb(raw: &str) -> Option<usize> {
    let mb: usize = raw.trim().parse().ok()?;
    if mb == 0 {
        return None;
    }
    mb.checked_mul(1024 * 1024)
}

/// Region cap configured through the environment, if any
pub fn region_cap_from_env() -> Option<usize> {
    *ENV_REGION_CAP
}

/// Configuration for a [`BfcAllocator`](super::BfcAllocator)
#[derive(Debug, Clone)]
pub struct BfcConfig {
    /// Allocation granularity; every chunk size is a multiple of this
    pub min_allocation_size: usize,

    /// Split a fitting chunk when it would otherwise waste this many bytes
    pub fragmentation_threshold: usize,

    /// Bytes of device memory left for the device runtime
    pub device_headroom: usize,

    /// Explicit pool limit; overrides `total_memory - device_headroom`
    pub memory_limit: Option<usize>,

    /// Starting region growth target; defaults to the whole pool limit
    pub initial_region_bytes: Option<usize>,

    /// Cap on a single region growth request; overrides environment and device defaults
    pub region_cap: Option<usize>,

    /// Allocator name used in log lines
    pub name: String,
}

impl Default for BfcConfig {
    fn default() -> Self {
        BfcConfig {
            min_allocation_size: DEFAULT_MIN_ALLOCATION_SIZE,
            fragmentation_threshold: DEFAULT_FRAGMENTATION_THRESHOLD,
            device_headroom: DEFAULT_DEVICE_HEADROOM,
            memory_limit: None,
            initial_region_bytes: None,
            region_cap: None,
            name: "bfc".to_string(),
        }
    }
}

impl BfcConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allocation granularity
    pub fn with_min_allocation_size(mut self, min_allocation_size: usize) -> Self {
        self.min_allocation_size = min_allocation_size;
        self
    }

    /// Set the split threshold
    pub fn with_fragmentation_threshold(mut self, fragmentation_threshold: usize) -> Self {
        self.fragmentation_threshold = fragmentation_threshold;
        self
    }

    /// Set device headroom
    pub fn with_device_headroom(mut self, device_headroom: usize) -> Self {
        self.device_headroom = device_headroom;
        self
    }

    /// Set an explicit pool limit
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = Some(memory_limit);
        self
    }

    /// Set the starting region growth target
    pub fn with_initial_region_bytes(mut self, initial_region_bytes: usize) -> Self {
        self.initial_region_bytes = Some(initial_region_bytes);
        self
    }

    /// Set the cap on a single region growth request
    pub fn with_region_cap(mut self, region_cap: usize) -> Self {
        self.region_cap = Some(region_cap);
        self
    }

    /// Set allocator name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Validate the values that do not depend on a device
    pub fn validate(&self) -> BfcResult<()> {
        if self.min_allocation_size == 0 {
            return Err(BfcError::InvalidConfiguration(
                "min_allocation_size must be > 0".to_string(),
            ));
        }
        if self.min_allocation_size > MAX_MIN_ALLOCATION_SIZE {
            return Err(BfcError::InvalidConfiguration(format!(
                "min_allocation_size ({}) exceeds {}",
                self.min_allocation_size, MAX_MIN_ALLOCATION_SIZE
            )));
        }
        if self.fragmentation_threshold == 0 {
            return Err(BfcError::InvalidConfiguration(
                "fragmentation_threshold must be > 0".to_string(),
            ));
        }
        if let Some(limit) = self.memory_limit {
            if limit < self.min_allocation_size {
                return Err(BfcError::InvalidConfiguration(format!(
                    "memory_limit ({}) is smaller than min_allocation_size ({})",
                    limit, self.min_allocation_size
                )));
            }
        }
        if self.initial_region_bytes == Some(0) {
            return Err(BfcError::InvalidConfiguration(
                "initial_region_bytes must be > 0".to_string(),
            ));
        }
        if self.region_cap == Some(0) {
            return Err(BfcError::InvalidConfiguration(
                "region_cap must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool limit for `device`
    pub fn resolve_memory_limit(&self, device: &dyn Device) -> BfcResult<usize> {
        let limit = match self.memory_limit {
            Some(limit) => limit,
            None => device.total_memory().saturating_sub(self.device_headroom),
        };
        if limit < self.min_allocation_size {
            return Err(BfcError::InvalidConfiguration(format!(
                "device {} has {} bytes, not enough for headroom of {} bytes",
                device.name(),
                device.total_memory(),
                self.device_headroom
            )));
        }
        Ok(limit)
    }

    /// Cap on a single region growth request for `device`
    ///
    /// Explicit config wins, then the environment, then the device default.
    pub fn resolve_region_cap(&self, device: &dyn Device) -> usize {
        self.resolve_region_cap_with(device, region_cap_from_env())
    }

    /// Same as [`resolve_region_cap`](Self::resolve_region_cap) with the
    /// environment value supplied by the caller
    pub fn resolve_region_cap_with(&self, device: &dyn Device, env_cap: Option<usize>) -> usize {
        self.region_cap
            .or(env_cap)
            .unwrap_or_else(|| region_cap_bytes(device.needs_conservative_region_cap()))
    }
}
