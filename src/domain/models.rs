use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Motion service UUID (primary service)
pub const MOTION_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Linear acceleration characteristic UUID (notify + read)
pub const ACCEL_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Angular velocity characteristic UUID (notify + read)
pub const GYRO_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Notification flush period (~10 Hz)
pub const DEFAULT_NOTIFY_INTERVAL_MS: u64 = 100;

/// Three-axis reading (x, y, z).
pub type Vector3 = [f32; 3];

/// One fused motion reading: gravity-free linear acceleration (m/s²) and
/// angular velocity (rad/s).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionSample {
    pub accel: Vector3,
    pub gyro: Vector3,
}

impl MotionSample {
    pub fn new(accel: Vector3, gyro: Vector3) -> Self {
        Self { accel, gyro }
    }

    /// The axis group carried by the given characteristic.
    pub fn axes(&self, kind: CharacteristicKind) -> Vector3 {
        match kind {
            CharacteristicKind::Accel => self.accel,
            CharacteristicKind::Gyro => self.gyro,
        }
    }
}

/// Requested delivery rate, passed to the source on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingRate {
    /// ~5 Hz
    Normal,
    /// ~16 Hz
    #[default]
    Ui,
    /// ~50 Hz
    Game,
    /// As fast as the source can deliver.
    Fastest,
}

impl SamplingRate {
    /// Nominal delivery period.
    pub fn period(self) -> Duration {
        match self {
            Self::Normal => Duration::from_millis(200),
            Self::Ui => Duration::from_millis(60),
            Self::Game => Duration::from_millis(20),
            Self::Fastest => Duration::from_millis(5),
        }
    }
}

/// Opaque identity of a connected central, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CentralId(String);

impl CentralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CentralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two notify-capable characteristics of the motion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    Accel,
    Gyro,
}

impl CharacteristicKind {
    pub const ALL: [Self; 2] = [Self::Accel, Self::Gyro];
}

/// Lifecycle of the single peripheral session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Inactive,
    Initializing,
    ServiceRegistered,
    Advertising,
    Connected,
}

impl PeripheralState {
    pub fn is_active(self) -> bool {
        self != Self::Inactive
    }
}

/// Discrete state reports published to the status bus.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Idle,
    Initializing,
    Advertising,
    Connected(CentralId),
    Disconnected(CentralId),
    /// `fatal` errors end the session; everything else is informational.
    Error {
        detail: String,
        fatal: bool,
    },
    Stopped,
}

impl StatusEvent {
    pub fn recoverable(detail: impl Into<String>) -> Self {
        Self::Error {
            detail: detail.into(),
            fatal: false,
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Error {
            detail: detail.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Initializing => f.write_str("Starting BLE Service..."),
            Self::Advertising => f.write_str("Advertising... Waiting for connection."),
            Self::Connected(id) => write!(f, "Connected to: {}", id),
            Self::Disconnected(id) => write!(f, "Disconnected from: {}. Advertising.", id),
            Self::Error { detail, .. } => write!(f, "Error: {}", detail),
            Self::Stopped => f.write_str("Service Stopped."),
        }
    }
}

/// Everything the core publishes to the host.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(StatusEvent),
    Motion(MotionSample),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
