//! Region growth policy.
//!
//! Decides how many bytes to ask the device for when no free chunk fits.
//! Growth is eager: the target doubles whenever it was large enough on the
//! first try, so later growths happen less often. It degrades under memory
//! pressure: a refused reservation is retried at 90% of the previous size
//! until it would drop below what the caller needs.

use crate::backend::{Device, DevicePtr};
use crate::error::{BfcError, BfcResult};

/// Shrink factor applied after each refused reservation
const BACKPEDAL_FACTOR: f64 = 0.9;

/// A freshly reserved extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub base: DevicePtr,
    pub size: usize,
}

/// Growth counters and policy for one allocator
#[derive(Debug)]
pub struct RegionGrowth {
    min_allocation_size: usize,
    memory_limit: usize,
    region_cap: usize,
    /// Size of the next growth request; doubles over time
    current_region_allocation_bytes: usize,
    /// Sum of every region reserved so far
    total_region_allocated_bytes: usize,
}

impl RegionGrowth {
    pub fn new(
        min_allocation_size: usize,
        memory_limit: usize,
        initial_region_bytes: usize,
        region_cap: usize,
    ) -> Self {
        let initial = round_up(initial_region_bytes, min_allocation_size).max(min_allocation_size);
        let region_cap = round_down(region_cap, min_allocation_size).max(min_allocation_size);
        RegionGrowth {
            min_allocation_size,
            memory_limit,
            region_cap,
            current_region_allocation_bytes: initial,
            total_region_allocated_bytes: 0,
        }
    }

    /// Bytes still reservable under the pool limit, rounded down to the granularity
    pub fn available(&self) -> usize {
        round_down(
            self.memory_limit
                .saturating_sub(self.total_region_allocated_bytes),
            self.min_allocation_size,
        )
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn region_cap(&self) -> usize {
        self.region_cap
    }

    pub fn current_target(&self) -> usize {
        self.current_region_allocation_bytes
    }

    pub fn total_reserved(&self) -> usize {
        self.total_region_allocated_bytes
    }

    /// Reserve a new region of at least `rounded_bytes` from `device`.
    ///
    /// The region cap only limits growth beyond the request: a single request
    /// larger than the cap is still reserved whole if the pool has room.
    ///
    /// On success the counters are updated and the caller must register the
    /// returned extent. On failure nothing changes except the growth target.
    pub fn extend(&mut self, device: &dyn Device, rounded_bytes: usize) -> BfcResult<Grant> {
        let available = self.available();
        if rounded_bytes > available {
            tracing::debug!(
                "Region growth refused: need {} bytes, {} bytes left under limit {}",
                rounded_bytes,
                available,
                self.memory_limit
            );
            return Err(BfcError::PoolExhausted {
                requested: rounded_bytes,
                available,
            });
        }

        let mut increased_allocation = false;
        while rounded_bytes > self.current_region_allocation_bytes {
            self.current_region_allocation_bytes =
                self.current_region_allocation_bytes.saturating_mul(2);
            increased_allocation = true;
        }

        // The cap bounds speculative growth only; the request itself must fit.
        let mut bytes = self
            .current_region_allocation_bytes
            .min(available)
            .min(self.region_cap)
            .max(rounded_bytes);

        let base = loop {
            match device.reserve(bytes) {
                Ok(base) => break base,
                Err(err) => {
                    let next = self.backpedal(bytes);
                    tracing::debug!(
                        "Reservation of {} bytes on {} failed ({}); retrying with {} bytes",
                        bytes,
                        device.name(),
                        err,
                        next
                    );
                    if next < rounded_bytes {
                        return Err(BfcError::ReservationFailed {
                            requested: rounded_bytes,
                            last_attempt: bytes,
                        });
                    }
                    bytes = next;
                }
            }
        };

        if !increased_allocation {
            self.current_region_allocation_bytes =
                self.current_region_allocation_bytes.saturating_mul(2);
        }
        self.total_region_allocated_bytes += bytes;

        tracing::debug!(
            "Extending allocation by {} bytes at {}; total reserved {} of {} bytes",
            bytes,
            base,
            self.total_region_allocated_bytes,
            self.memory_limit
        );

        Ok(Grant { base, size: bytes })
    }

    /// Next, strictly smaller, request size after a refusal
    fn backpedal(&self, bytes: usize) -> usize {
        let shrunk = round_up(
            (bytes as f64 * BACKPEDAL_FACTOR) as usize,
            self.min_allocation_size,
        );
        if shrunk < bytes {
            shrunk
        } else {
            bytes.saturating_sub(self.min_allocation_size)
        }
    }
}

/// Round `bytes` up to a multiple of `granularity`, or `None` if that
/// multiple does not fit in `usize`
pub fn checked_round_up(bytes: usize, granularity: usize) -> Option<usize> {
    bytes.checked_next_multiple_of(granularity)
}

/// Round `bytes` up to a multiple of `granularity`, saturating at the
/// largest representable multiple
pub fn round_up(bytes: usize, granularity: usize) -> usize {
    checked_round_up(bytes, granularity).unwrap_or_else(|| round_down(usize::MAX, granularity))
}

/// Round `bytes` down to a multiple of `granularity`
pub fn round_down(bytes: usize, granularity: usize) -> usize {
    bytes / granularity * granularity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedDevice;

    #[test]
    fn test_rounding_helpers() {
        assert_eq!(round_up(1, 256), 256);
        assert_eq!(round_up(256, 256), 256);
        assert_eq!(round_up(257, 256), 512);
        assert_eq!(round_up(0, 256), 0);
        assert_eq!(round_down(999, 100), 900);
    }

    #[test]
    fn test_rounding_near_usize_max() {
        assert_eq!(checked_round_up(usize::MAX, 256), None);
        assert_eq!(checked_round_up(usize::MAX - 255, 256), Some(usize::MAX - 255));
        assert_eq!(round_up(usize::MAX, 100), round_down(usize::MAX, 100));
        // A huge initial target saturates instead of overflowing
        let growth = RegionGrowth::new(256, 1 << 20, usize::MAX, usize::MAX);
        assert_eq!(growth.current_target(), round_down(usize::MAX, 256));
    }

    #[test]
    fn test_extend_doubles_target_until_it_fits() {
        let device = SimulatedDevice::new(1 << 20);
        let mut growth = RegionGrowth::new(100, 100_000, 200, usize::MAX);
        let grant = growth.extend(&device, 700).unwrap();
        // 200 -> 400 -> 800
        assert_eq!(grant.size, 800);
        // Doubling happened this call, so no speculative doubling
        assert_eq!(growth.current_target(), 800);
        assert_eq!(growth.total_reserved(), 800);
    }

    #[test]
    fn test_extend_speculatively_doubles_after_first_fit() {
        let device = SimulatedDevice::new(1 << 20);
        let mut growth = RegionGrowth::new(100, 100_000, 200, usize::MAX);
        let grant = growth.extend(&device, 200).unwrap();
        assert_eq!(grant.size, 200);
        assert_eq!(growth.current_target(), 400);

        let grant = growth.extend(&device, 100).unwrap();
        assert_eq!(grant.size, 400);
        assert_eq!(growth.current_target(), 800);
    }

    #[test]
    fn test_extend_clamps_to_available_and_cap() {
        let device = SimulatedDevice::new(1 << 20);
        let mut growth = RegionGrowth::new(100, 1000, 1000, usize::MAX);
        assert_eq!(growth.extend(&device, 100).unwrap().size, 1000);
        assert_eq!(growth.available(), 0);

        let mut capped = RegionGrowth::new(100, 100_000, 100_000, 350);
        assert_eq!(capped.region_cap(), 300);
        assert_eq!(capped.extend(&device, 100).unwrap().size, 300);
        // The cap never shrinks a request below what the caller needs
        assert_eq!(capped.extend(&device, 900).unwrap().size, 900);
    }

    #[test]
    fn test_extend_fails_when_pool_exhausted() {
        let device = SimulatedDevice::new(1 << 20);
        let mut growth = RegionGrowth::new(100, 1000, 200, usize::MAX);
        assert!(matches!(
            growth.extend(&device, 1100),
            Err(BfcError::PoolExhausted {
                requested: 1100,
                available: 1000
            })
        ));
        assert!(device.reserve_log().is_empty());
    }

    #[test]
    fn test_extend_backs_off_on_refusal() {
        let device = SimulatedDevice::new(1 << 20);
        device.set_max_single_reservation(Some(800));
        let mut growth = RegionGrowth::new(100, 100_000, 1000, usize::MAX);
        let grant = growth.extend(&device, 500).unwrap();
        // 1000 refused, then 900, then 810 -> rounded up to 900 would not shrink
        assert_eq!(device.reserve_log()[0], 1000);
        assert!(grant.size <= 800);
        assert!(grant.size >= 500);
        assert_eq!(grant.size % 100, 0);
        assert_eq!(growth.total_reserved(), grant.size);
    }

    #[test]
    fn test_extend_gives_up_below_request() {
        let device = SimulatedDevice::new(1 << 20);
        device.set_max_single_reservation(Some(400));
        let mut growth = RegionGrowth::new(100, 100_000, 1000, usize::MAX);
        let err = growth.extend(&device, 500).unwrap_err();
        assert!(matches!(
            err,
            BfcError::ReservationFailed { requested: 500, .. }
        ));
        assert_eq!(growth.total_reserved(), 0);
        // Every attempt was at least the requested size and strictly shrinking
        let log = device.reserve_log();
        assert!(log.iter().all(|&b| b >= 500));
        assert!(log.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_backpedal_always_shrinks() {
        let growth = RegionGrowth::new(256, 1 << 30, 256, usize::MAX);
        assert_eq!(growth.backpedal(256), 0);
        assert_eq!(growth.backpedal(512), 256);
        assert!(growth.backpedal(1 << 20) < 1 << 20);
    }
}
