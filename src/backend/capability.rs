//! Device family detection.
//!
//! Some parts handle very large single reservations well and others do not.
//! The allocator only ever asks one question ("should a single region growth
//! request be capped conservatively?"), so the name and id matching lives
//! here instead of in the allocator.

/// PCI device id prefix of data-center-max parts (matched on `id & 0xff0`)
const DATA_CENTER_MAX_ID: u32 = 0xbd0;

/// Name fragments reported by data-center-max parts across driver versions
const DATA_CENTER_MAX_NAMES: &[&str] = &["0x0bd", "Data Center GPU Max"];

/// Region cap applied to ordinary devices (MiB)
pub const CONSERVATIVE_REGION_CAP_MB: usize = 4 * 1024;

/// Region cap applied to devices that handle large reservations (MiB).
/// Large enough to mean "no cap" for any real device.
pub const UNLIMITED_REGION_CAP_MB: usize = 1024 * 1024;

/// Hardware family as far as allocation policy is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Data-center-max class accelerator
    DataCenterMax,
    /// Anything else
    Generic,
}

impl DeviceFamily {
    /// Detect the family from the device name reported by the runtime
    pub fn from_name(name: &str) -> Self {
        if DATA_CENTER_MAX_NAMES.iter().any(|frag| name.contains(frag)) {
            DeviceFamily::DataCenterMax
        } else {
            DeviceFamily::Generic
        }
    }

    /// Detect the family from a PCI device id
    pub fn from_device_id(id: u32) -> Self {
        if id & 0xff0 == DATA_CENTER_MAX_ID {
            DeviceFamily::DataCenterMax
        } else {
            DeviceFamily::Generic
        }
    }

    /// Whether a single growth request should be capped conservatively
    pub fn needs_conservative_region_cap(self) -> bool {
        !matches!(self, DeviceFamily::DataCenterMax)
    }

    /// Default cap on a single region growth request, in bytes
    pub fn default_region_cap_bytes(self) -> usize {
        region_cap_bytes(self.needs_conservative_region_cap())
    }
}

/// Region cap in bytes for a device that does or does not need the
/// conservative cap
pub fn region_cap_bytes(conservative: bool) -> usize {
    let mb = if conservative {
        CONSERVATIVE_REGION_CAP_MB
    } else {
        UNLIMITED_REGION_CAP_MB
    };
    mb * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_name() {
        assert_eq!(
            DeviceFamily::from_name("Intel(R) Data Center GPU Max 1550"),
            DeviceFamily::DataCenterMax
        );
        assert_eq!(
            DeviceFamily::from_name("Intel(R) Graphics [0x0bd5]"),
            DeviceFamily::DataCenterMax
        );
        assert_eq!(
            DeviceFamily::from_name("AMD Radeon RX 7900 XTX"),
            DeviceFamily::Generic
        );
    }

    #[test]
    fn test_family_from_device_id() {
        assert_eq!(DeviceFamily::from_device_id(0x0bd5), DeviceFamily::DataCenterMax);
        assert_eq!(DeviceFamily::from_device_id(0x0bda), DeviceFamily::DataCenterMax);
        assert_eq!(DeviceFamily::from_device_id(0x56a0), DeviceFamily::Generic);
    }

    #[test]
    fn test_default_region_cap() {
        assert_eq!(
            DeviceFamily::Generic.default_region_cap_bytes(),
            4096 * 1024 * 1024
        );
        assert!(
            DeviceFamily::DataCenterMax.default_region_cap_bytes()
                > DeviceFamily::Generic.default_region_cap_bytes()
        );
        assert_eq!(region_cap_bytes(false), UNLIMITED_REGION_CAP_MB << 20);
        assert!(DeviceFamily::Generic.needs_conservative_region_cap());
        assert!(!DeviceFamily::DataCenterMax.needs_conservative_region_cap());
    }
}
