//! Peripheral Transport
//!
//! The platform capability set the GATT controller drives. Every method is a
//! fire-and-forget request: an `Err` means the platform refused the call
//! outright (permission denial, missing handle), while the eventual outcome
//! of an accepted request arrives later as a [`TransportEvent`].

use crate::domain::models::CentralId;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::controller::PeripheralConfig;
use crate::infrastructure::bluetooth::protocol::{GattStatus, CCCD_UUID};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Characteristic capabilities advertised in the GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub read_permitted: bool,
    pub descriptors: Vec<DescriptorDefinition>,
}

/// The single primary service registered by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    pub service_uuid: Uuid,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl GattProfile {
    /// Motion service: Accel and Gyro, each notify + read with one CCCD.
    pub fn motion(config: &PeripheralConfig) -> Self {
        let characteristic = |uuid| CharacteristicDefinition {
            uuid,
            properties: CharacteristicProperties {
                read: true,
                notify: true,
            },
            read_permitted: true,
            descriptors: vec![DescriptorDefinition {
                uuid: CCCD_UUID,
                readable: true,
                writable: true,
            }],
        };

        Self {
            service_uuid: config.service_uuid,
            characteristics: vec![
                characteristic(config.accel_char_uuid),
                characteristic(config.gyro_char_uuid),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingParams {
    pub service_uuid: Uuid,
    pub device_name: String,
    pub include_device_name: bool,
    pub connectable: bool,
}

impl AdvertisingParams {
    pub fn for_config(config: &PeripheralConfig) -> Self {
        Self {
            service_uuid: config.service_uuid,
            device_name: config.device_name.clone(),
            include_device_name: config.include_device_name,
            connectable: true,
        }
    }
}

/// Asynchronous platform callbacks delivered to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ServiceAdded {
        service: Uuid,
        status: GattStatus,
    },
    AdvertisingStarted,
    AdvertisingFailed {
        code: i32,
    },
    ConnectionStateChanged {
        central: CentralId,
        status: GattStatus,
        connected: bool,
    },
    CharacteristicReadRequest {
        central: CentralId,
        request_id: u32,
        offset: usize,
        characteristic: Uuid,
    },
    DescriptorWriteRequest {
        central: CentralId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    NotificationSent {
        central: CentralId,
        status: GattStatus,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Platform adapter for the peripheral role.
pub trait PeripheralTransport: Send + Sync {
    /// Verifies the adapter is present and enabled and the process may
    /// advertise and accept connections.
    fn check_capabilities(&self) -> Result<(), TransportError>;

    fn open_server(&self) -> Result<(), TransportError>;

    /// Acknowledged by [`TransportEvent::ServiceAdded`].
    fn register_service(&self, profile: &GattProfile) -> Result<(), TransportError>;

    /// Acknowledged by [`TransportEvent::AdvertisingStarted`] or
    /// [`TransportEvent::AdvertisingFailed`].
    fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError>;

    fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Acknowledged by [`TransportEvent::NotificationSent`].
    fn send_notification(
        &self,
        central: &CentralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn respond(
        &self,
        central: &CentralId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn close_server(&self) -> Result<(), TransportError>;
}
