//! Simulated device for tests and benchmarks.
//!
//! Hands out addresses from a fake address space (no host or GPU memory is
//! ever touched), tracks outstanding reservations, and can be told to fail
//! reservations so growth back-off paths can be exercised without hardware.

use std::collections::HashMap;
use std::sync::Mutex;

use super::device::{Device, DevicePtr};
use super::error::{DeviceError, DeviceResult};

/// Alignment of every simulated reservation
pub const SIMULATED_ALIGNMENT: usize = 64;

/// First address handed out by a simulated device
const DEFAULT_BASE_ADDRESS: usize = 0x1_0000_0000;

#[derive(Debug, Default)]
struct SimulatedState {
    /// Next address to hand out
    cursor: usize,
    /// Outstanding reservations: base -> size
    reservations: HashMap<usize, usize>,
    /// Bytes currently reserved
    reserved_bytes: usize,
    /// Number of upcoming reservations to fail
    fail_next: usize,
    /// Reservations above this size always fail
    max_single_reservation: Option<usize>,
    /// Every size passed to `reserve`, successful or not
    reserve_log: Vec<usize>,
}

/// Host-side stand-in for a device with `total_memory` bytes.
#[derive(Debug)]
pub struct SimulatedDevice {
    name: String,
    ordinal: usize,
    total_memory: usize,
    state: Mutex<SimulatedState>,
}

impl SimulatedDevice {
    /// Create a simulated device with the given capacity
    pub fn new(total_memory: usize) -> Self {
        Self::with_name("Simulated Device", total_memory)
    }

    /// Create a simulated device reporting `name`
    pub fn with_name(name: &str, total_memory: usize) -> Self {
        SimulatedDevice {
            name: name.to_string(),
            ordinal: 0,
            total_memory,
            state: Mutex::new(SimulatedState {
                cursor: DEFAULT_BASE_ADDRESS,
                ..SimulatedState::default()
            }),
        }
    }

    /// Set the ordinal reported by this device
    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Set the first address handed out
    pub fn with_base_address(self, base: usize) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.cursor = align_up(base.max(SIMULATED_ALIGNMENT));
        }
        self
    }

    /// Fail the next `count` reservations
    pub fn fail_next_reservations(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = count;
        }
    }

    /// Fail every reservation larger than `bytes` (None removes the ceiling)
    pub fn set_max_single_reservation(&self, bytes: Option<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.max_single_reservation = bytes;
        }
    }

    /// Bytes currently reserved
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().map(|s| s.reserved_bytes).unwrap_or(0)
    }

    /// Number of outstanding reservations
    pub fn outstanding_reservations(&self) -> usize {
        self.state.lock().map(|s| s.reservations.len()).unwrap_or(0)
    }

    /// Sizes of every reservation attempt, in call order
    pub fn reserve_log(&self) -> Vec<usize> {
        self.state
            .lock()
            .map(|s| s.reserve_log.clone())
            .unwrap_or_default()
    }
}

fn align_up(addr: usize) -> usize {
    (addr + SIMULATED_ALIGNMENT - 1) / SIMULATED_ALIGNMENT * SIMULATED_ALIGNMENT
}

impl Device for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn total_memory(&self) -> usize {
        self.total_memory
    }

    fn reserve(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let mut state = self.state.lock()?;
        state.reserve_log.push(bytes);

        if bytes == 0 {
            return Err(DeviceError::ReservationFailed(
                "zero-size reservation".to_string(),
            ));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            tracing::trace!("SimulatedDevice: injected failure for {} bytes", bytes);
            return Err(DeviceError::ReservationFailed(format!(
                "injected failure for {} bytes",
                bytes
            )));
        }
        if let Some(max) = state.max_single_reservation {
            if bytes > max {
                return Err(DeviceError::ReservationFailed(format!(
                    "{} bytes exceeds single reservation ceiling of {} bytes",
                    bytes, max
                )));
            }
        }
        if state.reserved_bytes + bytes > self.total_memory {
            return Err(DeviceError::ReservationFailed(format!(
                "{} bytes requested, {} of {} bytes already reserved",
                bytes, state.reserved_bytes, self.total_memory
            )));
        }

        let base = state.cursor;
        state.cursor = align_up(base + bytes);
        state.reservations.insert(base, bytes);
        state.reserved_bytes += bytes;
        tracing::trace!(
            "SimulatedDevice: reserved {} bytes at 0x{:x} ({} outstanding)",
            bytes,
            base,
            state.reservations.len()
        );
        Ok(DevicePtr::new(base))
    }

    fn release(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock()?;
        match state.reservations.remove(&ptr.addr()) {
            Some(size) => {
                state.reserved_bytes -= size;
                Ok(())
            }
            None => Err(DeviceError::InvalidPointer(format!(
                "{} was not reserved from {}",
                ptr, self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservations_do_not_overlap() {
        let device = SimulatedDevice::new(1 << 20);
        let a = device.reserve(100).unwrap();
        let b = device.reserve(200).unwrap();
        assert!(a.addr() + 100 <= b.addr());
        assert_eq!(a.addr() % SIMULATED_ALIGNMENT, 0);
        assert_eq!(b.addr() % SIMULATED_ALIGNMENT, 0);
        assert_eq!(device.reserved_bytes(), 300);
        assert_eq!(device.outstanding_reservations(), 2);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let device = SimulatedDevice::new(1000);
        assert!(device.reserve(600).is_ok());
        assert!(device.reserve(600).is_err());
        assert!(device.reserve(400).is_ok());
    }

    #[test]
    fn test_release_unknown_pointer_fails() {
        let device = SimulatedDevice::new(1000);
        let p = device.reserve(100).unwrap();
        assert!(device.release(p).is_ok());
        assert!(matches!(
            device.release(p),
            Err(DeviceError::InvalidPointer(_))
        ));
        assert_eq!(device.reserved_bytes(), 0);
    }

    #[test]
    fn test_failure_injection() {
        let device = SimulatedDevice::new(1 << 20);
        device.fail_next_reservations(2);
        assert!(device.reserve(64).is_err());
        assert!(device.reserve(64).is_err());
        assert!(device.reserve(64).is_ok());

        device.set_max_single_reservation(Some(128));
        assert!(device.reserve(256).is_err());
        assert!(device.reserve(128).is_ok());
        assert_eq!(device.reserve_log(), vec![64, 64, 64, 256, 128]);
    }

    #[test]
    fn test_custom_base_address() {
        let device = SimulatedDevice::new(1000).with_base_address(0x100);
        assert_eq!(device.reserve(10).unwrap().addr(), 0x100);
    }
}
