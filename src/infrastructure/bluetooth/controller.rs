//! GATT Peripheral Controller
//!
//! Session state machine for the motion service. Owns the subscriber registry,
//! the characteristic cache and the notification scheduler, and turns
//! transport callbacks into updates of all three.
//!
//! ```text
//! Inactive ──start()──▶ Initializing ──ServiceAdded──▶ ServiceRegistered
//!                            │                               │
//!                   fatal error (cleanup,          AdvertisingStarted
//!                   single Error report)                     ▼
//!                            ▼                  Advertising ◀──▶ Connected
//!                        Inactive
//! ```

use crate::domain::models::{
    AppEvent, CentralId, CharacteristicKind, MessageSeverity, MotionSample, PeripheralState,
    StatusEvent, StatusMessage,
};
use crate::domain::settings::PeripheralSettings;
use crate::error::PeripheralError;
use crate::infrastructure::bluetooth::cache::CharacteristicCache;
use crate::infrastructure::bluetooth::protocol::{
    self, CccdValue, GattStatus, CCCD_UUID, DEFAULT_NOTIFY_INTERVAL_MS,
};
use crate::infrastructure::bluetooth::registry::{Occupancy, SubscriberRegistry};
use crate::infrastructure::bluetooth::scheduler::{NotificationScheduler, SchedulerStatus};
use crate::infrastructure::bluetooth::transport::{
    AdvertisingParams, GattProfile, PeripheralTransport, TransportEvent,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Immutable identity and pacing of the peripheral, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralConfig {
    pub service_uuid: Uuid,
    pub accel_char_uuid: Uuid,
    pub gyro_char_uuid: Uuid,
    pub cccd_uuid: Uuid,
    pub device_name: String,
    pub include_device_name: bool,
    pub notify_interval: Duration,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self::from(&PeripheralSettings::default())
    }
}

impl From<&PeripheralSettings> for PeripheralConfig {
    fn from(settings: &PeripheralSettings) -> Self {
        let interval_ms = if settings.notify_interval_ms == 0 {
            warn!(
                "Notify interval of 0 ms is invalid, using {} ms",
                DEFAULT_NOTIFY_INTERVAL_MS
            );
            DEFAULT_NOTIFY_INTERVAL_MS
        } else {
            settings.notify_interval_ms
        };

        Self {
            service_uuid: settings.service_uuid,
            accel_char_uuid: settings.accel_char_uuid,
            gyro_char_uuid: settings.gyro_char_uuid,
            cccd_uuid: CCCD_UUID,
            device_name: settings.device_name.clone(),
            include_device_name: settings.include_device_name,
            notify_interval: Duration::from_millis(interval_ms),
        }
    }
}

impl PeripheralConfig {
    pub fn characteristic_kind(&self, uuid: &Uuid) -> Option<CharacteristicKind> {
        if *uuid == self.accel_char_uuid {
            Some(CharacteristicKind::Accel)
        } else if *uuid == self.gyro_char_uuid {
            Some(CharacteristicKind::Gyro)
        } else {
            None
        }
    }

    pub fn characteristic_uuid(&self, kind: CharacteristicKind) -> Uuid {
        match kind {
            CharacteristicKind::Accel => self.accel_char_uuid,
            CharacteristicKind::Gyro => self.gyro_char_uuid,
        }
    }
}

/// Handles acquired during the current session.
#[derive(Debug, Default)]
struct Session {
    state: PeripheralState,
    server_open: bool,
    advertise_requested: bool,
}

pub struct GattPeripheralController {
    config: Arc<PeripheralConfig>,
    transport: Arc<dyn PeripheralTransport>,
    registry: Arc<SubscriberRegistry>,
    cache: Arc<CharacteristicCache>,
    scheduler: NotificationScheduler,
    session: Mutex<Session>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl GattPeripheralController {
    pub fn new(
        config: PeripheralConfig,
        transport: Arc<dyn PeripheralTransport>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SubscriberRegistry::new());
        let cache = Arc::new(CharacteristicCache::new());
        let scheduler = NotificationScheduler::new(
            config.clone(),
            registry.clone(),
            cache.clone(),
            transport.clone(),
        );

        Self {
            config,
            transport,
            registry,
            cache,
            scheduler,
            session: Mutex::new(Session::default()),
            event_sender,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begins a session: capability check, GATT server, service registration.
    ///
    /// Advertising follows automatically once the platform acknowledges the
    /// service. Calling `start` on an active session does nothing. On failure
    /// the session is torn down, a single fatal status is reported and the
    /// error is returned.
    pub fn start(&self) -> Result<(), PeripheralError> {
        {
            let mut session = self.session();
            if session.state.is_active() {
                debug!("Peripheral session already {:?}", session.state);
                return Ok(());
            }
            session.state = PeripheralState::Initializing;
        }

        info!("Starting BLE peripheral for service {}", self.config.service_uuid);
        self.send_status(StatusEvent::Initializing);

        if let Err(e) = self.initialize() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    fn initialize(&self) -> Result<(), PeripheralError> {
        self.transport
            .check_capabilities()
            .map_err(PeripheralError::from_capability_check)?;

        self.transport
            .open_server()
            .map_err(PeripheralError::ServerOpen)?;
        {
            let mut session = self.session();
            if session.state != PeripheralState::Initializing {
                // Stopped while the server was opening.
                drop(session);
                if let Err(e) = self.transport.close_server() {
                    warn!("Could not close GATT server: {}", e);
                }
                return Ok(());
            }
            session.server_open = true;
        }

        let profile = GattProfile::motion(&self.config);
        self.transport
            .register_service(&profile)
            .map_err(|e| PeripheralError::ServiceRegistration(e.to_string()))?;
        debug!(
            "Registration requested for service {} ({} characteristics)",
            profile.service_uuid,
            profile.characteristics.len()
        );
        Ok(())
    }

    /// Ends the session. Safe to call repeatedly or before any `start`.
    pub fn stop(&self) {
        let previous = self.teardown();
        if previous.is_active() {
            info!("BLE peripheral stopped");
            self.send_status(StatusEvent::Stopped);
        } else {
            debug!("Stop requested on inactive peripheral session");
        }
    }

    /// Releases everything the session acquired and returns the prior state.
    fn teardown(&self) -> PeripheralState {
        let (previous, server_open, advertise_requested) = {
            let mut session = self.session();
            let released = (
                session.state,
                session.server_open,
                session.advertise_requested,
            );
            *session = Session::default();
            released
        };

        self.scheduler.pause();
        let dropped = self.registry.clear();
        if dropped > 0 {
            debug!("Cleared {} subscribers", dropped);
        }
        self.cache.reset();

        if advertise_requested {
            if let Err(e) = self.transport.stop_advertising() {
                warn!("Could not stop advertising: {}", e);
            }
        }
        if server_open {
            if let Err(e) = self.transport.close_server() {
                warn!("Could not close GATT server: {}", e);
            }
        }
        previous
    }

    fn fail(&self, error: &PeripheralError) {
        error!("Peripheral session failed: {}", error);
        self.teardown();
        self.send_status(StatusEvent::fatal(error.to_string()));
    }

    /// Caches a fused sample for reads and the next notification flush.
    pub fn publish_sample(&self, sample: &MotionSample) {
        if !self.state().is_active() {
            return;
        }
        let dirty = self.cache.update(sample);
        if !dirty.is_empty() {
            trace!("Characteristics updated: {:?}", dirty);
        }
    }

    /// Latest value of a characteristic starting at `offset`.
    ///
    /// Offsets at or past the end yield an empty value so chunked long reads
    /// terminate; unknown characteristics are not readable.
    pub fn read_characteristic(
        &self,
        characteristic: &Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, GattStatus> {
        let kind = self
            .config
            .characteristic_kind(characteristic)
            .ok_or(GattStatus::ReadNotPermitted)?;
        let value = self.cache.latest(kind);
        Ok(protocol::read_slice(&value, offset).to_vec())
    }

    /// Dispatches one platform callback.
    pub fn handle_event(&self, event: TransportEvent) {
        if !self.state().is_active() {
            debug!("Ignoring {:?} on inactive session", event);
            return;
        }

        match event {
            TransportEvent::ServiceAdded { service, status } => {
                self.on_service_added(service, status)
            }
            TransportEvent::AdvertisingStarted => self.on_advertising_started(),
            TransportEvent::AdvertisingFailed { code } => self.on_advertising_failed(code),
            TransportEvent::ConnectionStateChanged {
                central,
                status,
                connected,
            } => self.on_connection_state_changed(central, status, connected),
            TransportEvent::CharacteristicReadRequest {
                central,
                request_id,
                offset,
                characteristic,
            } => self.on_read_request(central, request_id, offset, characteristic),
            TransportEvent::DescriptorWriteRequest {
                central,
                request_id,
                characteristic,
                descriptor,
                response_needed,
                offset,
                value,
            } => self.on_descriptor_write(
                central,
                request_id,
                characteristic,
                descriptor,
                response_needed,
                offset,
                &value,
            ),
            TransportEvent::NotificationSent { central, status } => {
                if !status.is_success() {
                    error!(
                        "FAILED: Notification send to {}, status: {:#04x}",
                        central,
                        status.code()
                    );
                }
            }
        }
    }

    fn on_service_added(&self, service: Uuid, status: GattStatus) {
        if service != self.config.service_uuid {
            warn!("Acknowledgment for unexpected service {}", service);
            return;
        }
        if !status.is_success() {
            self.fail(&PeripheralError::ServiceRegistration(format!(
                "status {:#04x}",
                status.code()
            )));
            return;
        }

        {
            let mut session = self.session();
            if session.state != PeripheralState::Initializing {
                debug!("Duplicate service acknowledgment in {:?}", session.state);
                return;
            }
            session.state = PeripheralState::ServiceRegistered;
        }
        info!("Service {} added successfully", service);
        self.start_advertising();
    }

    fn start_advertising(&self) {
        let params = AdvertisingParams::for_config(&self.config);
        match self.transport.start_advertising(&params) {
            Ok(()) => {
                self.session().advertise_requested = true;
                debug!(
                    "Advertising requested (name: {}, connectable: {})",
                    params.device_name, params.connectable
                );
            }
            Err(e) => {
                error!("Advertising request rejected: {}", e);
                self.send_status(StatusEvent::recoverable(format!("Advertise fail: {}", e)));
            }
        }
    }

    fn on_advertising_started(&self) {
        {
            let mut session = self.session();
            if session.state == PeripheralState::ServiceRegistered {
                session.state = PeripheralState::Advertising;
            }
        }
        info!("Advertising started successfully");
        self.send_status(StatusEvent::Advertising);
    }

    fn on_advertising_failed(&self, code: i32) {
        error!("Advertising failed: {}", code);
        self.send_status(StatusEvent::recoverable(format!("Adv Fail {}", code)));
    }

    fn on_connection_state_changed(&self, central: CentralId, status: GattStatus, connected: bool) {
        if !status.is_success() {
            warn!(
                "Connection state error for {}. Status: {:#04x}, connected: {}",
                central,
                status.code(),
                connected
            );
            self.unsubscribe(&central);
            self.settle_if_unsubscribed();
            self.send_status(StatusEvent::recoverable(format!(
                "Conn Error {} for {}",
                status.code(),
                central
            )));
            return;
        }

        if connected {
            {
                let mut session = self.session();
                if matches!(
                    session.state,
                    PeripheralState::ServiceRegistered | PeripheralState::Advertising
                ) {
                    session.state = PeripheralState::Connected;
                }
            }
            // Subscription waits for the configuration descriptor write.
            info!("Device connected: {}", central);
            self.send_status(StatusEvent::Connected(central));
        } else {
            info!("Device disconnected: {}", central);
            self.unsubscribe(&central);
            self.send_status(StatusEvent::Disconnected(central));
            if self.settle_if_unsubscribed() {
                debug!("No subscribers left, advertising");
                self.send_status(StatusEvent::Advertising);
            }
        }
    }

    /// Falls back from Connected to Advertising once nobody is subscribed.
    /// Returns whether the registry is empty.
    fn settle_if_unsubscribed(&self) -> bool {
        let mut session = self.session();
        let empty = self.registry.is_empty();
        if empty && session.state == PeripheralState::Connected {
            session.state = PeripheralState::Advertising;
        }
        empty
    }

    fn on_read_request(
        &self,
        central: CentralId,
        request_id: u32,
        offset: usize,
        characteristic: Uuid,
    ) {
        debug!(
            "Read request for {} from {} at offset {}",
            characteristic, central, offset
        );
        match self.read_characteristic(&characteristic, offset) {
            Ok(value) => {
                self.send_response(&central, request_id, GattStatus::Success, offset, &value)
            }
            Err(status) => {
                warn!("Read of unknown characteristic {} from {}", characteristic, central);
                self.send_response(&central, request_id, status, 0, &[]);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_descriptor_write(
        &self,
        central: CentralId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        response_needed: bool,
        offset: usize,
        value: &[u8],
    ) {
        let is_configuration = descriptor == self.config.cccd_uuid
            && self.config.characteristic_kind(&characteristic).is_some();
        if !is_configuration {
            warn!(
                "Write request for unknown descriptor {} on {} from {}",
                descriptor, characteristic, central
            );
            if response_needed {
                self.send_response(
                    &central,
                    request_id,
                    GattStatus::WriteNotPermitted,
                    offset,
                    &[],
                );
            }
            return;
        }

        // One subscription covers both characteristics.
        match CccdValue::parse(value) {
            CccdValue::EnableNotifications => {
                info!(
                    "Notifications ENABLED by {} for {}",
                    central, characteristic
                );
                self.subscribe(central.clone());
            }
            CccdValue::DisableNotifications => {
                info!(
                    "Notifications DISABLED by {} for {}",
                    central, characteristic
                );
                self.unsubscribe(&central);
            }
            CccdValue::Other => {
                debug!("Ignoring configuration value {:02X?} from {}", value, central)
            }
        }

        if response_needed {
            self.send_response(&central, request_id, GattStatus::Success, offset, value);
        }
    }

    fn subscribe(&self, central: CentralId) {
        let occupancy = {
            // Held across the insert so a concurrent teardown clears after us.
            let session = self.session();
            if !session.state.is_active() {
                debug!("Ignoring subscription from {} after stop", central);
                return;
            }
            self.registry.insert(central)
        };

        if occupancy == Occupancy::BecameNonEmpty {
            debug!("First subscriber, starting notification flushes");
            self.scheduler.start();
            // Teardown between the insert and the start missed this task.
            if !self.state().is_active() {
                self.scheduler.pause();
            }
        }
    }

    fn unsubscribe(&self, central: &CentralId) {
        if self.registry.remove(central) == Occupancy::BecameEmpty {
            debug!("Last subscriber gone, pausing notification flushes");
            self.scheduler.pause();
        }
    }

    /// Best-effort acknowledgment; state changes never depend on it.
    fn send_response(
        &self,
        central: &CentralId,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) {
        if let Err(e) = self
            .transport
            .respond(central, request_id, status, offset, value)
        {
            if e.is_permission_denied() {
                error!("Missing permission to respond to {}: {}", central, e);
            } else {
                warn!("Response to {} not sent: {}", central, e);
            }
            self.send_log(
                &format!("Response to {} not sent", central),
                MessageSeverity::Warning,
            );
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.session().state
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_subscribed(&self, central: &CentralId) -> bool {
        self.registry.contains(central)
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    fn send_status(&self, status: StatusEvent) {
        let _ = self.event_sender.send(AppEvent::Status(status));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for GattPeripheralController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        encode_axis_payload, ACCEL_CHAR_UUID, DISABLE_NOTIFICATION_VALUE,
        ENABLE_NOTIFICATION_VALUE, GYRO_CHAR_UUID, MOTION_SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::testing::{Call, RecordingTransport};

    struct Harness {
        controller: Arc<GattPeripheralController>,
        transport: Arc<RecordingTransport>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let transport = RecordingTransport::new();
            let (tx, events) = mpsc::unbounded_channel();
            let controller = Arc::new(GattPeripheralController::new(
                PeripheralConfig::default(),
                transport.clone(),
                tx,
            ));
            Self {
                controller,
                transport,
                events,
            }
        }

        /// Starts the session and acknowledges service + advertising.
        fn advertising() -> Self {
            let harness = Self::new();
            harness.controller.start().unwrap();
            harness.controller.handle_event(TransportEvent::ServiceAdded {
                service: MOTION_SERVICE_UUID,
                status: GattStatus::Success,
            });
            harness
                .controller
                .handle_event(TransportEvent::AdvertisingStarted);
            harness
        }

        fn statuses(&mut self) -> Vec<StatusEvent> {
            let mut statuses = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let AppEvent::Status(status) = event {
                    statuses.push(status);
                }
            }
            statuses
        }

        fn connect(&self, central: &CentralId) {
            self.controller
                .handle_event(TransportEvent::ConnectionStateChanged {
                    central: central.clone(),
                    status: GattStatus::Success,
                    connected: true,
                });
        }

        fn disconnect(&self, central: &CentralId) {
            self.controller
                .handle_event(TransportEvent::ConnectionStateChanged {
                    central: central.clone(),
                    status: GattStatus::Success,
                    connected: false,
                });
        }

        fn write_cccd(&self, central: &CentralId, characteristic: Uuid, value: [u8; 2]) {
            self.controller
                .handle_event(TransportEvent::DescriptorWriteRequest {
                    central: central.clone(),
                    request_id: 7,
                    characteristic,
                    descriptor: CCCD_UUID,
                    response_needed: true,
                    offset: 0,
                    value: value.to_vec(),
                });
        }
    }

    #[test]
    fn test_config_from_settings() {
        let settings = PeripheralSettings {
            notify_interval_ms: 0,
            ..PeripheralSettings::default()
        };
        let config = PeripheralConfig::from(&settings);
        assert_eq!(config.notify_interval, Duration::from_millis(100));
        assert_eq!(config.cccd_uuid, CCCD_UUID);
        assert_eq!(
            config.characteristic_kind(&GYRO_CHAR_UUID),
            Some(CharacteristicKind::Gyro)
        );
        assert_eq!(config.characteristic_kind(&MOTION_SERVICE_UUID), None);
        assert_eq!(
            config.characteristic_uuid(CharacteristicKind::Accel),
            ACCEL_CHAR_UUID
        );
    }

    #[tokio::test]
    async fn test_start_registers_service_then_advertises() {
        let mut h = Harness::new();
        h.controller.start().unwrap();
        assert_eq!(h.controller.state(), PeripheralState::Initializing);

        let calls = h.transport.calls();
        assert_eq!(calls[0], Call::CheckCapabilities);
        assert_eq!(calls[1], Call::OpenServer);
        match &calls[2] {
            Call::RegisterService(profile) => {
                assert_eq!(profile.service_uuid, MOTION_SERVICE_UUID);
                assert_eq!(profile.characteristics.len(), 2);
                for characteristic in &profile.characteristics {
                    assert!(characteristic.properties.read && characteristic.properties.notify);
                    assert_eq!(characteristic.descriptors.len(), 1);
                    assert_eq!(characteristic.descriptors[0].uuid, CCCD_UUID);
                }
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(calls.len(), 3);

        h.controller.handle_event(TransportEvent::ServiceAdded {
            service: MOTION_SERVICE_UUID,
            status: GattStatus::Success,
        });
        assert_eq!(h.controller.state(), PeripheralState::ServiceRegistered);
        match h.transport.calls().last() {
            Some(Call::StartAdvertising(params)) => {
                assert!(params.connectable);
                assert!(params.include_device_name);
                assert_eq!(params.service_uuid, MOTION_SERVICE_UUID);
            }
            other => panic!("expected advertising request, got {:?}", other),
        }

        h.controller.handle_event(TransportEvent::AdvertisingStarted);
        assert_eq!(h.controller.state(), PeripheralState::Advertising);
        assert_eq!(
            h.statuses(),
            vec![StatusEvent::Initializing, StatusEvent::Advertising]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = Harness::advertising();
        h.transport.clear();
        h.controller.start().unwrap();
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.controller.state(), PeripheralState::Advertising);
    }

    #[tokio::test]
    async fn test_capability_failure_is_fatal() {
        let mut h = Harness::new();
        h.transport.deny("check_capabilities");

        let err = h.controller.start().unwrap_err();
        assert!(matches!(err, PeripheralError::CapabilityDenied(_)));
        assert_eq!(h.controller.state(), PeripheralState::Inactive);
        assert!(h.transport.calls().is_empty());

        let statuses = h.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(matches!(statuses[1], StatusEvent::Error { fatal: true, .. }));
    }

    #[tokio::test]
    async fn test_service_add_failure_cleans_up() {
        let mut h = Harness::new();
        h.controller.start().unwrap();
        h.controller.handle_event(TransportEvent::ServiceAdded {
            service: MOTION_SERVICE_UUID,
            status: GattStatus::Failure(0x85),
        });

        assert_eq!(h.controller.state(), PeripheralState::Inactive);
        assert_eq!(h.transport.calls().last(), Some(&Call::CloseServer));
        let statuses = h.statuses();
        assert!(matches!(
            statuses.last(),
            Some(StatusEvent::Error { fatal: true, .. })
        ));
        assert!(!statuses.contains(&StatusEvent::Stopped));
    }

    #[tokio::test]
    async fn test_server_open_failure_is_fatal() {
        let h = Harness::new();
        h.transport.fail("open_server");
        let err = h.controller.start().unwrap_err();
        assert!(matches!(err, PeripheralError::ServerOpen(_)));
        assert_eq!(h.controller.state(), PeripheralState::Inactive);
        // Nothing was opened, so nothing is closed.
        assert_eq!(h.transport.count(|c| *c == Call::CloseServer), 0);
    }

    #[tokio::test]
    async fn test_advertising_failure_is_recoverable() {
        let mut h = Harness::new();
        h.transport.deny("start_advertising");
        h.controller.start().unwrap();
        h.controller.handle_event(TransportEvent::ServiceAdded {
            service: MOTION_SERVICE_UUID,
            status: GattStatus::Success,
        });
        h.controller
            .handle_event(TransportEvent::AdvertisingFailed { code: 3 });

        assert_eq!(h.controller.state(), PeripheralState::ServiceRegistered);
        let errors: Vec<_> = h
            .statuses()
            .into_iter()
            .filter(|s| matches!(s, StatusEvent::Error { fatal: false, .. }))
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_does_not_subscribe() {
        let mut h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);

        assert_eq!(h.controller.state(), PeripheralState::Connected);
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        assert!(h.statuses().contains(&StatusEvent::Connected(central)));
    }

    #[tokio::test]
    async fn test_enable_subscribes_and_flushes_immediately() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.controller
            .publish_sample(&MotionSample::new([1.0, 0.0, 9.8], [0.0; 3]));

        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);

        assert!(h.controller.is_subscribed(&central));
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Scheduled);
        // Combined subscription: both characteristics are delivered.
        let notifications = h.transport.notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(h.transport.responses(), vec![(7, GattStatus::Success, 0, vec![1, 0])]);
    }

    #[tokio::test]
    async fn test_disable_pauses_scheduler() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.write_cccd(&central, GYRO_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.write_cccd(&central, GYRO_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        assert_eq!(h.controller.subscriber_count(), 1);

        h.write_cccd(&central, GYRO_CHAR_UUID, DISABLE_NOTIFICATION_VALUE);
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        // Still connected, only unsubscribed.
        assert_eq!(h.controller.state(), PeripheralState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_always_unsubscribes() {
        let mut h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.statuses();

        h.disconnect(&central);
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        assert_eq!(h.controller.state(), PeripheralState::Advertising);
        assert_eq!(
            h.statuses(),
            vec![StatusEvent::Disconnected(central.clone()), StatusEvent::Advertising]
        );

        // Disconnect of an unknown central is harmless.
        h.disconnect(&CentralId::new("ghost"));
        assert_eq!(h.controller.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_advertising_reported_when_subscribers_leave() {
        let mut h = Harness::advertising();
        let a = CentralId::new("central-a");
        let b = CentralId::new("central-b");
        h.connect(&a);
        h.connect(&b);
        h.write_cccd(&a, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.statuses();

        // B stays connected but never subscribed.
        h.disconnect(&a);
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        assert_eq!(h.controller.state(), PeripheralState::Advertising);
        assert_eq!(
            h.statuses(),
            vec![StatusEvent::Disconnected(a), StatusEvent::Advertising]
        );
    }

    #[tokio::test]
    async fn test_disconnect_with_remaining_subscriber_stays_connected() {
        let mut h = Harness::advertising();
        let a = CentralId::new("central-a");
        let b = CentralId::new("central-b");
        h.connect(&a);
        h.connect(&b);
        h.write_cccd(&a, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.write_cccd(&b, GYRO_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.statuses();

        h.disconnect(&a);
        assert_eq!(h.controller.state(), PeripheralState::Connected);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Scheduled);
        assert_eq!(h.statuses(), vec![StatusEvent::Disconnected(a)]);
    }

    #[tokio::test]
    async fn test_subscribe_racing_stop_leaves_nothing_scheduled() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);

        // Dispatch already passed its activity check when teardown ran.
        h.controller.stop();
        h.controller.subscribe(central.clone());

        assert_eq!(h.controller.subscriber_count(), 0);
        assert!(!h.controller.is_subscribed(&central));
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
    }

    #[tokio::test]
    async fn test_connection_error_removes_subscriber() {
        let mut h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);

        h.controller
            .handle_event(TransportEvent::ConnectionStateChanged {
                central: central.clone(),
                status: GattStatus::Failure(0x08),
                connected: false,
            });
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        assert!(matches!(
            h.statuses().last(),
            Some(StatusEvent::Error { fatal: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_descriptor_rejected() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.controller
            .handle_event(TransportEvent::DescriptorWriteRequest {
                central: central.clone(),
                request_id: 11,
                characteristic: ACCEL_CHAR_UUID,
                descriptor: Uuid::from_u128(0x2901),
                response_needed: true,
                offset: 0,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            });

        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(
            h.transport.responses(),
            vec![(11, GattStatus::WriteNotPermitted, 0, vec![])]
        );
    }

    #[tokio::test]
    async fn test_write_applied_when_response_denied() {
        let mut h = Harness::advertising();
        h.transport.deny("respond");
        let central = CentralId::new("central-a");
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);

        assert!(h.controller.is_subscribed(&central));
        assert!(h.transport.responses().is_empty());
        assert!(!h
            .statuses()
            .iter()
            .any(|s| matches!(s, StatusEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_read_slices_at_offset() {
        let h = Harness::advertising();
        h.controller
            .publish_sample(&MotionSample::new([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]));
        let gyro = encode_axis_payload([4.0, 5.0, 6.0]);

        assert_eq!(
            h.controller.read_characteristic(&GYRO_CHAR_UUID, 0),
            Ok(gyro.to_vec())
        );
        assert_eq!(
            h.controller.read_characteristic(&GYRO_CHAR_UUID, 8),
            Ok(gyro[8..].to_vec())
        );
        assert_eq!(
            h.controller.read_characteristic(&GYRO_CHAR_UUID, 12),
            Ok(vec![])
        );
        assert_eq!(
            h.controller
                .read_characteristic(&Uuid::from_u128(0x2a19), 0),
            Err(GattStatus::ReadNotPermitted)
        );
    }

    #[tokio::test]
    async fn test_read_request_responds() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.controller
            .publish_sample(&MotionSample::new([1.0, 2.0, 3.0], [0.0; 3]));

        h.controller
            .handle_event(TransportEvent::CharacteristicReadRequest {
                central: central.clone(),
                request_id: 1,
                offset: 4,
                characteristic: ACCEL_CHAR_UUID,
            });
        h.controller
            .handle_event(TransportEvent::CharacteristicReadRequest {
                central,
                request_id: 2,
                offset: 0,
                characteristic: Uuid::from_u128(0x2a19),
            });

        let accel = encode_axis_payload([1.0, 2.0, 3.0]);
        assert_eq!(
            h.transport.responses(),
            vec![
                (1, GattStatus::Success, 4, accel[4..].to_vec()),
                (2, GattStatus::ReadNotPermitted, 0, vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_notification_keeps_subscriber() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.controller.handle_event(TransportEvent::NotificationSent {
            central: central.clone(),
            status: GattStatus::Failure(0x01),
        });
        assert!(h.controller.is_subscribed(&central));
    }

    #[tokio::test]
    async fn test_stop_releases_everything_once() {
        let mut h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.statuses();

        h.controller.stop();
        h.controller.stop();

        assert_eq!(h.controller.state(), PeripheralState::Inactive);
        assert_eq!(h.controller.subscriber_count(), 0);
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Idle);
        assert_eq!(h.transport.count(|c| *c == Call::StopAdvertising), 1);
        assert_eq!(h.transport.count(|c| *c == Call::CloseServer), 1);
        assert_eq!(h.statuses(), vec![StatusEvent::Stopped]);

        // Late callbacks after stop are ignored.
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        assert_eq!(h.controller.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut h = Harness::new();
        h.controller.stop();
        assert!(h.transport.calls().is_empty());
        assert!(h.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_stop_tolerates_permission_denials() {
        let h = Harness::advertising();
        h.transport.deny("stop_advertising");
        h.transport.deny("close_server");
        h.controller.stop();
        assert_eq!(h.controller.state(), PeripheralState::Inactive);

        // A fresh session can start afterwards.
        h.transport.allow_all();
        h.controller.start().unwrap();
        assert_eq!(h.controller.state(), PeripheralState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accel_notification_within_one_tick() {
        let h = Harness::advertising();
        let central = CentralId::new("central-a");
        h.connect(&central);
        h.write_cccd(&central, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.transport.clear();

        h.controller
            .publish_sample(&MotionSample::new([1.0, 0.0, 9.8], [0.0, 0.0, 0.0]));
        tokio::time::sleep(Duration::from_millis(101)).await;

        let expected = encode_axis_payload([1.0, 0.0, 9.8]).to_vec();
        let accel: Vec<_> = h
            .transport
            .notifications()
            .into_iter()
            .filter(|(_, characteristic, _)| *characteristic == ACCEL_CHAR_UUID)
            .collect();
        assert_eq!(accel, vec![(central, ACCEL_CHAR_UUID, expected)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_flush_completes_for_others() {
        let h = Harness::advertising();
        let a = CentralId::new("central-a");
        let b = CentralId::new("central-b");
        h.connect(&a);
        h.connect(&b);
        h.write_cccd(&a, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.write_cccd(&b, ACCEL_CHAR_UUID, ENABLE_NOTIFICATION_VALUE);
        h.transport.clear();

        // Central A drops while the flush is notifying.
        let controller = Arc::downgrade(&h.controller);
        let dropped = a.clone();
        h.transport.on_notify(move |_| {
            if let Some(controller) = controller.upgrade() {
                controller.handle_event(TransportEvent::ConnectionStateChanged {
                    central: dropped.clone(),
                    status: GattStatus::Success,
                    connected: false,
                });
            }
        });

        h.controller
            .publish_sample(&MotionSample::new([0.5, 0.5, 0.5], [0.0; 3]));
        tokio::time::sleep(Duration::from_millis(101)).await;

        let to_b = h
            .transport
            .notifications()
            .into_iter()
            .filter(|(central, _, _)| *central == b)
            .count();
        assert_eq!(to_b, 2);
        assert_eq!(h.controller.subscriber_count(), 1);
        assert!(h.controller.is_subscribed(&b));
        assert_eq!(h.controller.scheduler_status(), SchedulerStatus::Scheduled);
    }
}
