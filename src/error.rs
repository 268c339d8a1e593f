//! Error types
//!
//! Session-level failures end a peripheral session; transport failures are
//! reported per platform call and never end the session on their own.

use crate::infrastructure::sensors::SensorKind;
use thiserror::Error;

/// Failures that end (or refuse to begin) a peripheral session.
#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Missing Bluetooth capability: {0}")]
    CapabilityDenied(String),

    #[error("GATT server init fail: {0}")]
    ServerOpen(#[source] TransportError),

    #[error("Service add fail: {0}")]
    ServiceRegistration(String),
}

impl PeripheralError {
    /// Maps a failed capability check onto the session error it represents.
    pub fn from_capability_check(err: TransportError) -> Self {
        match err {
            TransportError::AdapterUnavailable(detail) => Self::AdapterUnavailable(detail),
            other => Self::CapabilityDenied(other.to_string()),
        }
    }
}

/// Failure of an individual platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("{operation} is not supported by this platform")]
    Unsupported { operation: &'static str },

    #[error("{operation} failed: {message}")]
    Platform {
        operation: &'static str,
        message: String,
    },
}

impl TransportError {
    pub fn platform(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Platform {
            operation,
            message: message.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

/// Wire payload decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("invalid payload size: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Sensor stream registration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("{0:?} sensor not available on this device")]
    NotAvailable(SensorKind),

    #[error("failed to register listener for {sensor:?}: {reason}")]
    RegistrationFailed { sensor: SensorKind, reason: String },

    #[error("no hardware IMU driver on this host, enable the simulated source instead")]
    NoHardwareSource,
}
