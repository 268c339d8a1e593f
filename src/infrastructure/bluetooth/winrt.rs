//! WinRT Peripheral Transport
//!
//! [`PeripheralTransport`] on top of `GattServiceProvider`. Windows handles the
//! client configuration descriptor itself and only reports subscription
//! changes, so the adapter turns those into the connection and descriptor-write
//! events the controller expects: a client's first subscription is reported as
//! connect + enable, losing its last one as disable + disconnect.

use crate::domain::models::CentralId;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    GattStatus, CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::transport::{
    AdvertisingParams, GattProfile, PeripheralTransport, TransportEvent, TransportEventSender,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use windows::core::{IInspectable, Ref, GUID, HRESULT};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristicProperties, GattClientNotificationResult, GattCommunicationStatus,
    GattLocalCharacteristic, GattLocalCharacteristicParameters, GattProtectionLevel,
    GattReadRequest, GattReadRequestedEventArgs, GattServiceProvider,
    GattServiceProviderAdvertisementStatus, GattServiceProviderAdvertisementStatusChangedEventArgs,
    GattServiceProviderAdvertisingParameters, GattSubscribedClient,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothError};
use windows::Devices::Radios::RadioState;
use windows::Foundation::{Deferral, TypedEventHandler};
use windows::Storage::Streams::{DataWriter, IBuffer};
use windows_future::IAsyncOperation;

const E_ACCESSDENIED: HRESULT = HRESULT(0x8007_0005_u32 as i32);

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn map_err(operation: &'static str) -> impl Fn(windows::core::Error) -> TransportError {
    move |e| {
        if e.code() == E_ACCESSDENIED {
            TransportError::PermissionDenied(operation)
        } else {
            TransportError::platform(operation, e.message())
        }
    }
}

fn to_buffer(value: &[u8]) -> windows::core::Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(value)?;
    writer.DetachBuffer()
}

fn central_of(client: &GattSubscribedClient) -> windows::core::Result<CentralId> {
    Ok(CentralId::new(client.Session()?.DeviceId()?.Id()?.to_string()))
}

struct PendingRead {
    request: GattReadRequest,
    deferral: Deferral,
}

struct LocalCharacteristic {
    uuid: Uuid,
    handle: GattLocalCharacteristic,
    read_token: i64,
    subscribers_token: i64,
}

/// State reachable from WinRT callbacks.
struct Shared {
    events: TransportEventSender,
    next_request_id: AtomicU32,
    pending_reads: Mutex<HashMap<u32, PendingRead>>,
    /// Subscribed clients per central, per characteristic.
    subscriptions: Mutex<HashMap<CentralId, HashMap<Uuid, GattSubscribedClient>>>,
}

impl Shared {
    fn pending_reads(&self) -> MutexGuard<'_, HashMap<u32, PendingRead>> {
        self.pending_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(
        &self,
    ) -> MutexGuard<'_, HashMap<CentralId, HashMap<Uuid, GattSubscribedClient>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn on_read_requested(
        &self,
        characteristic: Uuid,
        args: &GattReadRequestedEventArgs,
    ) -> windows::core::Result<()> {
        let deferral = args.GetDeferral()?;
        let central = CentralId::new(args.Session()?.DeviceId()?.Id()?.to_string());
        let request = args.GetRequestAsync()?.get()?;
        let offset = request.Offset()? as usize;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending_reads()
            .insert(request_id, PendingRead { request, deferral });
        self.emit(TransportEvent::CharacteristicReadRequest {
            central,
            request_id,
            offset,
            characteristic,
        });
        Ok(())
    }

    fn on_subscribers_changed(
        &self,
        characteristic: Uuid,
        local: &GattLocalCharacteristic,
    ) -> windows::core::Result<()> {
        let clients = local.SubscribedClients()?;
        let mut current = HashMap::new();
        for i in 0..clients.Size()? {
            let client = clients.GetAt(i)?;
            current.insert(central_of(&client)?, client);
        }

        let mut subscriptions = self.subscriptions();

        for (central, client) in current.iter() {
            let per_central = subscriptions.entry(central.clone()).or_default();
            let first = per_central.is_empty();
            per_central.insert(characteristic, client.clone());
            if first {
                self.emit(TransportEvent::ConnectionStateChanged {
                    central: central.clone(),
                    status: GattStatus::Success,
                    connected: true,
                });
                self.emit(self.descriptor_write(
                    central,
                    characteristic,
                    ENABLE_NOTIFICATION_VALUE,
                ));
            }
        }

        let gone: Vec<CentralId> = subscriptions
            .iter()
            .filter(|(central, per_central)| {
                per_central.contains_key(&characteristic) && !current.contains_key(*central)
            })
            .map(|(central, _)| central.clone())
            .collect();
        for central in gone {
            let last = subscriptions.get_mut(&central).is_some_and(|per_central| {
                per_central.remove(&characteristic);
                per_central.is_empty()
            });
            if last {
                subscriptions.remove(&central);
                self.emit(self.descriptor_write(
                    &central,
                    characteristic,
                    DISABLE_NOTIFICATION_VALUE,
                ));
                self.emit(TransportEvent::ConnectionStateChanged {
                    central,
                    status: GattStatus::Success,
                    connected: false,
                });
            }
        }
        Ok(())
    }

    fn descriptor_write(
        &self,
        central: &CentralId,
        characteristic: Uuid,
        value: [u8; 2],
    ) -> TransportEvent {
        TransportEvent::DescriptorWriteRequest {
            central: central.clone(),
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            characteristic,
            descriptor: CCCD_UUID,
            response_needed: false,
            offset: 0,
            value: value.to_vec(),
        }
    }
}

#[derive(Default)]
struct Server {
    open: bool,
    provider: Option<GattServiceProvider>,
    advertisement_token: Option<i64>,
    characteristics: Vec<LocalCharacteristic>,
}

pub struct WinRtTransport {
    shared: Arc<Shared>,
    server: Mutex<Server>,
}

impl WinRtTransport {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                events,
                next_request_id: AtomicU32::new(1),
                pending_reads: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
            server: Mutex::new(Server::default()),
        }
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_characteristic(
        &self,
        provider: &GattServiceProvider,
        uuid: Uuid,
        read: bool,
        notify: bool,
    ) -> windows::core::Result<LocalCharacteristic> {
        let params = GattLocalCharacteristicParameters::new()?;
        let mut properties = GattCharacteristicProperties::None;
        if read {
            properties |= GattCharacteristicProperties::Read;
        }
        if notify {
            properties |= GattCharacteristicProperties::Notify;
        }
        params.SetCharacteristicProperties(properties)?;
        params.SetReadProtectionLevel(GattProtectionLevel::Plain)?;

        let result = provider
            .Service()?
            .CreateCharacteristicAsync(to_guid(uuid), &params)?
            .get()?;
        if result.Error()? != BluetoothError::Success {
            return Err(windows::core::Error::new(
                HRESULT(0x8000_4005_u32 as i32),
                format!("characteristic {} rejected: {:?}", uuid, result.Error()?),
            ));
        }
        let handle = result.Characteristic()?;

        let shared = self.shared.clone();
        let read_token = handle.ReadRequested(&TypedEventHandler::new(
            move |_: Ref<GattLocalCharacteristic>, args: Ref<GattReadRequestedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    shared.on_read_requested(uuid, args)?;
                }
                Ok(())
            },
        ))?;

        let shared = self.shared.clone();
        let subscribers_token = handle.SubscribedClientsChanged(&TypedEventHandler::new(
            move |local: Ref<GattLocalCharacteristic>, _: Ref<IInspectable>| {
                if let Some(local) = local.as_ref() {
                    shared.on_subscribers_changed(uuid, local)?;
                }
                Ok(())
            },
        ))?;

        debug!("Created local characteristic {}", uuid);
        Ok(LocalCharacteristic {
            uuid,
            handle,
            read_token,
            subscribers_token,
        })
    }

    fn release(&self, server: &mut Server) {
        for characteristic in server.characteristics.drain(..) {
            let _ = characteristic
                .handle
                .RemoveReadRequested(characteristic.read_token);
            let _ = characteristic
                .handle
                .RemoveSubscribedClientsChanged(characteristic.subscribers_token);
        }
        if let (Some(provider), Some(token)) =
            (server.provider.as_ref(), server.advertisement_token.take())
        {
            let _ = provider.RemoveAdvertisementStatusChanged(token);
        }
        server.provider = None;

        for (_, pending) in self.shared.pending_reads().drain() {
            let _ = pending.deferral.Complete();
        }
        self.shared.subscriptions().clear();
    }
}

impl PeripheralTransport for WinRtTransport {
    fn check_capabilities(&self) -> Result<(), TransportError> {
        let adapter = BluetoothAdapter::GetDefaultAsync()
            .and_then(|op| op.get())
            .map_err(|e| TransportError::AdapterUnavailable(e.message()))?;

        let le = adapter
            .IsLowEnergySupported()
            .map_err(map_err("check_capabilities"))?;
        let peripheral = adapter
            .IsPeripheralRoleSupported()
            .map_err(map_err("check_capabilities"))?;
        if !le || !peripheral {
            return Err(TransportError::Unsupported {
                operation: "peripheral role",
            });
        }

        let radio = adapter
            .GetRadioAsync()
            .and_then(|op| op.get())
            .map_err(map_err("check_capabilities"))?;
        let state = radio.State().map_err(map_err("check_capabilities"))?;
        if state != RadioState::On {
            return Err(TransportError::AdapterUnavailable(format!(
                "radio is {:?}",
                state
            )));
        }
        Ok(())
    }

    fn open_server(&self) -> Result<(), TransportError> {
        // The provider is created with the service in `register_service`.
        self.server().open = true;
        Ok(())
    }

    fn register_service(&self, profile: &GattProfile) -> Result<(), TransportError> {
        let mut server = self.server();
        if !server.open {
            return Err(TransportError::platform("register_service", "server not open"));
        }

        let operation = map_err("register_service");
        let created: IAsyncOperation<_> =
            GattServiceProvider::CreateAsync(to_guid(profile.service_uuid)).map_err(&operation)?;
        let result = created.get().map_err(&operation)?;
        let error = result.Error().map_err(&operation)?;
        if error != BluetoothError::Success {
            // Reported asynchronously, like the other platforms do.
            self.shared.emit(TransportEvent::ServiceAdded {
                service: profile.service_uuid,
                status: GattStatus::Failure(error.0 as u16),
            });
            return Ok(());
        }
        let provider = result.ServiceProvider().map_err(&operation)?;

        for definition in &profile.characteristics {
            let characteristic = self
                .create_characteristic(
                    &provider,
                    definition.uuid,
                    definition.properties.read,
                    definition.properties.notify,
                )
                .map_err(&operation)?;
            server.characteristics.push(characteristic);
        }

        let events = self.shared.events.clone();
        let token = provider
            .AdvertisementStatusChanged(&TypedEventHandler::new(
                move |_: Ref<GattServiceProvider>,
                      args: Ref<GattServiceProviderAdvertisementStatusChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let event = match args.Status()? {
                            GattServiceProviderAdvertisementStatus::Started => {
                                Some(TransportEvent::AdvertisingStarted)
                            }
                            GattServiceProviderAdvertisementStatus::Aborted => {
                                Some(TransportEvent::AdvertisingFailed {
                                    code: args.Error()?.0,
                                })
                            }
                            _ => None,
                        };
                        if let Some(event) = event {
                            let _ = events.send(event);
                        }
                    }
                    Ok(())
                },
            ))
            .map_err(&operation)?;

        server.advertisement_token = Some(token);
        server.provider = Some(provider);
        info!("Service {} published", profile.service_uuid);
        self.shared.emit(TransportEvent::ServiceAdded {
            service: profile.service_uuid,
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError> {
        let server = self.server();
        let provider = server
            .provider
            .as_ref()
            .ok_or_else(|| TransportError::platform("start_advertising", "no service"))?;

        let operation = map_err("start_advertising");
        let parameters = GattServiceProviderAdvertisingParameters::new().map_err(&operation)?;
        parameters
            .SetIsConnectable(params.connectable)
            .map_err(&operation)?;
        parameters.SetIsDiscoverable(true).map_err(&operation)?;
        if params.include_device_name {
            // The system advertises the adapter's own name.
            trace!("Device name {} comes from the system", params.device_name);
        }
        provider
            .StartAdvertisingWithParameters(&parameters)
            .map_err(&operation)
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        match self.server().provider.as_ref() {
            Some(provider) => provider
                .StopAdvertising()
                .map_err(map_err("stop_advertising")),
            None => Ok(()),
        }
    }

    fn send_notification(
        &self,
        central: &CentralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let client = self
            .shared
            .subscriptions()
            .get(central)
            .and_then(|per_central| per_central.get(&characteristic).cloned());
        let Some(client) = client else {
            // Windows only delivers to clients subscribed to this characteristic.
            trace!("{} not subscribed to {}", central, characteristic);
            return Ok(());
        };

        let operation = map_err("send_notification");
        let server = self.server();
        let local = server
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                TransportError::platform("send_notification", "unknown characteristic")
            })?;
        let buffer = to_buffer(value).map_err(&operation)?;
        let pending: IAsyncOperation<GattClientNotificationResult> = local
            .handle
            .NotifyValueForSubscribedClientAsync(&buffer, &client)
            .map_err(&operation)?;

        let events = self.shared.events.clone();
        let central = central.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let status = match pending.await.and_then(|r| r.Status()) {
                    Ok(GattCommunicationStatus::Success) => GattStatus::Success,
                    Ok(other) => GattStatus::Failure(other.0 as u16),
                    Err(e) => {
                        warn!("Notification to {} failed: {}", central, e.message());
                        GattStatus::Failure(0xFFFF)
                    }
                };
                let _ = events.send(TransportEvent::NotificationSent { central, status });
            });
        }
        Ok(())
    }

    fn respond(
        &self,
        central: &CentralId,
        request_id: u32,
        status: GattStatus,
        _offset: usize,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let pending = self
            .shared
            .pending_reads()
            .remove(&request_id)
            .ok_or_else(|| {
                TransportError::platform("respond", format!("no request {}", request_id))
            })?;

        let operation = map_err("respond");
        let outcome = if status.is_success() {
            to_buffer(value).and_then(|buffer| pending.request.RespondWithValue(&buffer))
        } else {
            pending.request.RespondWithProtocolError(status.code() as u8)
        };
        let _ = pending.deferral.Complete();
        trace!("Responded to {} request {}", central, request_id);
        outcome.map_err(operation)
    }

    fn close_server(&self) -> Result<(), TransportError> {
        let mut server = self.server();
        self.release(&mut server);
        server.open = false;
        Ok(())
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = server.provider.as_ref() {
            let _ = provider.StopAdvertising();
        }
        self.release(&mut server);
    }
}
