//! Bluetooth Module
//!
//! BLE peripheral role: exposes the motion service and streams samples to
//! subscribed centrals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 MotionPeripheralService                  │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!          ┌─────────────────────────┐
//!          │ GattPeripheralController│◀── TransportEvent
//!          └──┬──────────┬───────┬───┘
//!             │          │       │
//!             ▼          ▼       ▼
//! ┌──────────┐  ┌───────────┐  ┌───────────┐
//! │ Registry │  │   Cache   │  │ Scheduler │──▶ PeripheralTransport
//! │          │  │           │  │           │    (WinRT / test double)
//! │ - who is │  │ - latest  │  │ - periodic│
//! │subscribed│  │ - dirty   │  │   flush   │
//! └──────────┘  └───────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, descriptor values, GATT status codes and payload codec
//! - [`transport`] - platform capability trait and its callback events
//! - [`registry`] - subscribed centrals
//! - [`cache`] - latest value and dirty flag per characteristic
//! - [`scheduler`] - rate-limited notification flushing
//! - [`controller`] - session state machine and GATT callback dispatch
//! - [`service`] - Main service coordinator

pub mod cache;
pub mod controller;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
mod testing;

// Re-export main service for convenience
pub use controller::{GattPeripheralController, PeripheralConfig};
pub use service::MotionPeripheralService;
pub use transport::{PeripheralTransport, TransportEvent};
