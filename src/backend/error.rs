//! Device error types

use thiserror::Error;

/// Errors raised by a device's memory reservation primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device reservation failed: {0}")]
    ReservationFailed(String),
    #[error("Device release failed: {0}")]
    ReleaseFailed(String),
    #[error("Invalid device pointer: {0}")]
    InvalidPointer(String),
    #[error("Device not found: ordinal {0}")]
    DeviceNotFound(usize),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// A failed reservation may succeed later with a smaller request or
    /// after other users of the device free memory. Everything else points
    /// at a caller bug or a broken device.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::ReservationFailed(_))
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
