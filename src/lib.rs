//! Motion Peripheral
//!
//! Turns the host into a BLE peripheral that streams fused motion telemetry
//! (gravity-free linear acceleration and angular velocity) to subscribed centrals.
//!
//! - [`domain`] - sample types, status events, settings and the gravity filter
//! - [`infrastructure`] - sensors, the GATT peripheral core and logging
//! - [`error`] - typed errors shared across the crate

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{AppEvent, CentralId, MotionSample, PeripheralState, StatusEvent};
pub use error::{PayloadError, PeripheralError, SensorError, TransportError};
pub use infrastructure::bluetooth::MotionPeripheralService;
