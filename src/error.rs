//! Unified error handling for devalloc
//!
//! Allocation-path failures are values, never panics:
//! - User errors (bad configuration, zero-size requests)
//! - Recoverable errors (pool exhausted, out of memory)
//! - Backend errors (the device's reservation primitive failed)
//! - Internal errors (invariant checks, poisoned locks)
//!
//! Contract violations by callers (freeing a pointer this allocator does not
//! own, double frees) are not represented here; they panic.

use std::fmt;

use crate::backend::DeviceError;

/// Unified error type for devalloc
#[derive(Debug, thiserror::Error)]
pub enum BfcError {
    /// Zero-byte allocation request
    #[error("Zero-size allocation requested")]
    ZeroSizeRequest,

    /// No free chunk fits and region growth could not supply one
    #[error("Out of memory: requested {requested} bytes (rounded to {rounded} bytes)")]
    OutOfMemory { requested: usize, rounded: usize },

    /// Remaining pool headroom is smaller than the request
    #[error("Pool exhausted: need {requested} bytes, {available} bytes left under the pool limit")]
    PoolExhausted { requested: usize, available: usize },

    /// The device refused every reservation down to the minimum size
    #[error("Device reservation failed: need {requested} bytes, last attempt was {last_attempt} bytes")]
    ReservationFailed { requested: usize, last_attempt: usize },

    /// Invalid allocator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No device registered under this ordinal
    #[error("Device not found: ordinal {0}")]
    DeviceNotFound(usize),

    /// Error reported by the device layer
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Internal invariant check failed (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a thread panicked while holding allocator state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl BfcError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            BfcError::ZeroSizeRequest
            | BfcError::InvalidConfiguration(_)
            | BfcError::DeviceNotFound(_) => ErrorCategory::User,

            BfcError::OutOfMemory { .. } | BfcError::PoolExhausted { .. } => {
                ErrorCategory::Recoverable
            }

            BfcError::ReservationFailed { .. } | BfcError::Device(_) => ErrorCategory::Backend,

            BfcError::InternalError(_) | BfcError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory conditions clear once other callers free memory; the
    /// caller may re-request later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Recoverable error - temporary condition
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Backend error - device failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for BfcError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BfcError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using BfcError
pub type BfcResult<T> = std::result::Result<T, BfcError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("chunk {} missing from bin {}", h, b));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::BfcError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::BfcError::InternalError(format!($fmt, $($arg)*))
    };
}
