//! Explicitly owned device registry.
//!
//! Holds the devices a process works with and one shared allocator per
//! device. Allocators are created on first use and dropped on `shutdown`,
//! which returns their regions to the device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bfc::{BfcAllocator, BfcConfig};
use crate::error::{BfcError, BfcResult};

use super::device::Device;

/// Devices and their allocators, keyed by registry ordinal
pub struct DeviceRegistry {
    devices: Vec<Arc<dyn Device>>,
    allocators: Mutex<HashMap<usize, Arc<BfcAllocator>>>,
    config: BfcConfig,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.devices.iter().map(|d| d.name()).collect();
        f.debug_struct("DeviceRegistry")
            .field("devices", &names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Create an empty registry whose allocators use the default config
    pub fn new() -> Self {
        Self::with_config(BfcConfig::default())
    }

    /// Create an empty registry whose allocators use `config`
    pub fn with_config(config: BfcConfig) -> Self {
        DeviceRegistry {
            devices: Vec::new(),
            allocators: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Add a device and return its registry ordinal
    pub fn register(&mut self, device: Arc<dyn Device>) -> usize {
        let ordinal = self.devices.len();
        tracing::info!(
            "Registered device {} ({} bytes) as ordinal {}",
            device.name(),
            device.total_memory(),
            ordinal
        );
        self.devices.push(device);
        ordinal
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device registered under `ordinal`
    pub fn device(&self, ordinal: usize) -> BfcResult<Arc<dyn Device>> {
        self.devices
            .get(ordinal)
            .cloned()
            .ok_or(BfcError::DeviceNotFound(ordinal))
    }

    /// Shared allocator for the device at `ordinal`, created on first use.
    pub fn allocator(&self, ordinal: usize) -> BfcResult<Arc<BfcAllocator>> {
        let device = self.device(ordinal)?;
        let mut allocators = self.allocators.lock()?;
        if let Some(allocator) = allocators.get(&ordinal) {
            return Ok(Arc::clone(allocator));
        }

        let config = self
            .config
            .clone()
            .with_name(&format!("GPU_{}_bfc", ordinal));
        let allocator = Arc::new(BfcAllocator::new(device, config)?);
        allocators.insert(ordinal, Arc::clone(&allocator));
        Ok(allocator)
    }

    /// Whether an allocator has been created for `ordinal`
    pub fn has_allocator(&self, ordinal: usize) -> bool {
        self.allocators
            .lock()
            .map(|a| a.contains_key(&ordinal))
            .unwrap_or(false)
    }

    /// Drop every allocator the registry holds and return how many there were.
    ///
    /// Regions go back to their devices once the last outstanding handle to
    /// each allocator is dropped.
    pub fn shutdown(&self) -> BfcResult<usize> {
        let drained: Vec<(usize, Arc<BfcAllocator>)> = self.allocators.lock()?.drain().collect();
        let count = drained.len();
        for (ordinal, allocator) in drained {
            let outstanding = Arc::strong_count(&allocator) - 1;
            if outstanding > 0 {
                tracing::warn!(
                    "Allocator for device {} still has {} outstanding handles at shutdown",
                    ordinal,
                    outstanding
                );
            }
        }
        tracing::info!("Device registry shut down {} allocators", count);
        Ok(count)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
