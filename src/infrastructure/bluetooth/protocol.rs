//! Motion Service Protocol
//!
//! GATT identifiers, notification descriptor values and the binary payload
//! codec shared by reads and notifications.

pub use crate::domain::models::{
    ACCEL_CHAR_UUID, DEFAULT_NOTIFY_INTERVAL_MS, GYRO_CHAR_UUID, MOTION_SERVICE_UUID,
};

use crate::domain::models::{MotionSample, Vector3};
use crate::error::PayloadError;
use uuid::Uuid;

/// Standard Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Combined payload: accel x,y,z then gyro x,y,z
pub const MOTION_PAYLOAD_LEN: usize = 24;

/// Single characteristic payload: x,y,z
pub const AXIS_PAYLOAD_LEN: usize = 12;

pub type AxisPayload = [u8; AXIS_PAYLOAD_LEN];

/// Value written by a central to a configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdValue {
    EnableNotifications,
    DisableNotifications,
    /// Indications or malformed values; acknowledged but ignored.
    Other,
}

impl CccdValue {
    pub fn parse(value: &[u8]) -> Self {
        if value == ENABLE_NOTIFICATION_VALUE {
            Self::EnableNotifications
        } else if value == DISABLE_NOTIFICATION_VALUE {
            Self::DisableNotifications
        } else {
            Self::Other
        }
    }
}

/// ATT response status carried by `respond` calls and platform callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    /// Any other platform-specific status code.
    Failure(u16),
}

impl GattStatus {
    /// ATT error code (0 on success).
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::Failure(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Encode three floats as 12 little-endian bytes
pub fn encode_axis_payload(axes: Vector3) -> AxisPayload {
    let mut bytes = [0u8; AXIS_PAYLOAD_LEN];
    for (chunk, value) in bytes.chunks_exact_mut(4).zip(axes) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a 12-byte characteristic value
pub fn decode_axis_payload(bytes: &[u8]) -> Result<Vector3, PayloadError> {
    if bytes.len() != AXIS_PAYLOAD_LEN {
        return Err(PayloadError::InvalidLength {
            expected: AXIS_PAYLOAD_LEN,
            actual: bytes.len(),
        });
    }
    Ok(read_floats(bytes))
}

/// Encode a fused sample as the 24-byte combined payload
///
/// ```text
/// [0-3]   : Accel X (f32 little-endian, m/s², gravity removed)
/// [4-7]   : Accel Y
/// [8-11]  : Accel Z
/// [12-15] : Gyro X (f32 little-endian, rad/s)
/// [16-19] : Gyro Y
/// [20-23] : Gyro Z
/// ```
pub fn encode_motion_payload(sample: &MotionSample) -> [u8; MOTION_PAYLOAD_LEN] {
    let mut bytes = [0u8; MOTION_PAYLOAD_LEN];
    bytes[..AXIS_PAYLOAD_LEN].copy_from_slice(&encode_axis_payload(sample.accel));
    bytes[AXIS_PAYLOAD_LEN..].copy_from_slice(&encode_axis_payload(sample.gyro));
    bytes
}

/// Decode the 24-byte combined payload
pub fn decode_motion_payload(bytes: &[u8]) -> Result<MotionSample, PayloadError> {
    if bytes.len() != MOTION_PAYLOAD_LEN {
        return Err(PayloadError::InvalidLength {
            expected: MOTION_PAYLOAD_LEN,
            actual: bytes.len(),
        });
    }
    Ok(MotionSample {
        accel: read_floats(&bytes[..AXIS_PAYLOAD_LEN]),
        gyro: read_floats(&bytes[AXIS_PAYLOAD_LEN..]),
    })
}

fn read_floats(bytes: &[u8]) -> Vector3 {
    let mut axes = [0.0f32; 3];
    for (value, chunk) in axes.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    axes
}

/// Slice a characteristic value for a (possibly chunked) read starting at `offset`.
pub fn read_slice(value: &[u8], offset: usize) -> &[u8] {
    value.get(offset..).unwrap_or(&[])
}
