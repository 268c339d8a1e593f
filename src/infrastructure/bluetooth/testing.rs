//! Recording transport used by the bluetooth tests.

use crate::domain::models::CentralId;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::GattStatus;
use crate::infrastructure::bluetooth::transport::{
    AdvertisingParams, GattProfile, PeripheralTransport,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CheckCapabilities,
    OpenServer,
    RegisterService(GattProfile),
    StartAdvertising(AdvertisingParams),
    StopAdvertising,
    Notify {
        central: CentralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Respond {
        central: CentralId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    },
    CloseServer,
}

type NotifyHook = Arc<dyn Fn(&CentralId) + Send + Sync>;

/// Records accepted calls; operations named in `deny` fail with
/// `PermissionDenied`, operations named in `fail` with a platform error.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    denied: Mutex<HashSet<&'static str>>,
    failing: Mutex<HashSet<&'static str>>,
    on_notify: Mutex<Option<NotifyHook>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, operation: &'static str) {
        self.denied.lock().unwrap().insert(operation);
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn allow_all(&self) {
        self.denied.lock().unwrap().clear();
        self.failing.lock().unwrap().clear();
    }

    /// Runs `hook` before each notification is recorded.
    pub fn on_notify(&self, hook: impl Fn(&CentralId) + Send + Sync + 'static) {
        *self.on_notify.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn notifications(&self) -> Vec<(CentralId, Uuid, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Notify {
                    central,
                    characteristic,
                    value,
                } => Some((central, characteristic, value)),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<(u32, GattStatus, usize, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Respond {
                    request_id,
                    status,
                    offset,
                    value,
                    ..
                } => Some((request_id, status, offset, value)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<(), TransportError> {
        if self.denied.lock().unwrap().contains(operation) {
            return Err(TransportError::PermissionDenied(operation));
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(TransportError::platform(operation, "injected failure"));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl PeripheralTransport for RecordingTransport {
    fn check_capabilities(&self) -> Result<(), TransportError> {
        self.record("check_capabilities", Call::CheckCapabilities)
    }

    fn open_server(&self) -> Result<(), TransportError> {
        self.record("open_server", Call::OpenServer)
    }

    fn register_service(&self, profile: &GattProfile) -> Result<(), TransportError> {
        self.record("register_service", Call::RegisterService(profile.clone()))
    }

    fn start_advertising(&self, params: &AdvertisingParams) -> Result<(), TransportError> {
        self.record("start_advertising", Call::StartAdvertising(params.clone()))
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.record("stop_advertising", Call::StopAdvertising)
    }

    fn send_notification(
        &self,
        central: &CentralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let hook = self.on_notify.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(central);
        }
        self.record(
            "send_notification",
            Call::Notify {
                central: central.clone(),
                characteristic,
                value: value.to_vec(),
            },
        )
    }

    fn respond(
        &self,
        central: &CentralId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(
            "respond",
            Call::Respond {
                central: central.clone(),
                request_id,
                status,
                offset,
                value: value.to_vec(),
            },
        )
    }

    fn close_server(&self) -> Result<(), TransportError> {
        self.record("close_server", Call::CloseServer)
    }
}
