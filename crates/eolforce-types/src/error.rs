//! Error taxonomy shared by every layer of the station.
//!
//! - [`DeviceError`] – what a single device operation can fail with.
//! - [`MeasurementError`] – construction-time violations of the record model.
//! - [`EolError`] – configuration and lifecycle failures surfaced to the
//!   caller of the supervisor.  Test outcomes are *not* errors: they are
//!   expressed through a record's verdict and cause.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single device operation.
///
/// Every capability method in the HAL returns one of these variants.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("device fault {code}: {message}")]
    DeviceFault { code: u32, message: String },

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl DeviceError {
    /// Build a [`DeviceError::Timeout`] for `operation`.
    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }

    /// Build a [`DeviceError::DeviceFault`].
    pub fn fault(code: u32, message: impl Into<String>) -> Self {
        Self::DeviceFault {
            code,
            message: message.into(),
        }
    }

    /// `true` for errors a session may retry: timeouts and protocol errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ProtocolError(_))
    }
}

/// Violation of a record-model invariant detected at construction time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("force reading is not finite: {0}")]
    NonFiniteForce(f64),

    #[error("position {position_um} µm outside soft limits [{min_um}, {max_um}]")]
    PositionOutOfLimits {
        position_um: f64,
        min_um: f64,
        max_um: f64,
    },

    #[error("sample timestamp {next_ns} ns does not advance past {prev_ns} ns")]
    NonMonotonicTimestamp { prev_ns: u64, next_ns: u64 },

    #[error("cycle {0} is closed")]
    CycleClosed(u32),

    #[error("cycle {0} has no samples")]
    EmptyCycle(u32),

    #[error("cycle {0} is still open")]
    CycleOpen(u32),

    #[error("cycle {got} appended out of order, expected {expected}")]
    CycleOutOfOrder { expected: u32, got: u32 },
}

/// Errors returned to the caller of the supervisor instead of a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EolError {
    #[error("profile invalid: {0}")]
    ProfileInvalid(String),

    #[error("DUT identity invalid: {0}")]
    DutInvalid(String),

    #[error("device not configured: {0}")]
    DeviceUnconfigured(String),

    #[error("a test is already running")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DeviceError::timeout("move", 5000).is_transient());
        assert!(DeviceError::ProtocolError("bad crc".into()).is_transient());
        assert!(!DeviceError::fault(7, "servo alarm").is_transient());
        assert!(!DeviceError::NotConnected.is_transient());
        assert!(!DeviceError::Cancelled.is_transient());
    }

    #[test]
    fn device_error_display() {
        let err = DeviceError::fault(0x31, "overcurrent");
        assert!(err.to_string().contains("overcurrent"));
        let err = DeviceError::timeout("wait_until_stable", 2000);
        assert_eq!(err.to_string(), "wait_until_stable timed out after 2000 ms");
    }

    #[test]
    fn device_error_serde_roundtrip() {
        let err = DeviceError::fault(12, "limit switch");
        let json = serde_json::to_string(&err).unwrap();
        let back: DeviceError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
