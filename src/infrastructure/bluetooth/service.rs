//! Motion Peripheral Service
//!
//! Main service that wires the sampler, the GATT controller and the event
//! pumps between them and the platform.

use crate::domain::models::{AppEvent, PeripheralState, StatusEvent};
use crate::domain::settings::Settings;
use crate::error::PeripheralError;
use crate::infrastructure::bluetooth::controller::{GattPeripheralController, PeripheralConfig};
use crate::infrastructure::bluetooth::transport::{PeripheralTransport, TransportEventReceiver};
use crate::infrastructure::sensors::{MotionSampler, SensorSource};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Public entry point for the application.
pub struct MotionPeripheralService {
    controller: Arc<GattPeripheralController>,
    sampler: Arc<MotionSampler>,
    transport_events: Arc<tokio::sync::Mutex<TransportEventReceiver>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl MotionPeripheralService {
    pub fn new(
        config: PeripheralConfig,
        transport: Arc<dyn PeripheralTransport>,
        transport_events: TransportEventReceiver,
        sampler: MotionSampler,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let _ = event_sender.send(AppEvent::Status(StatusEvent::Idle));
        Self {
            controller: Arc::new(GattPeripheralController::new(
                config,
                transport,
                event_sender.clone(),
            )),
            sampler: Arc::new(sampler),
            transport_events: Arc::new(tokio::sync::Mutex::new(transport_events)),
            pumps: Mutex::new(Vec::new()),
            event_sender,
        }
    }

    /// Builds the service from persisted settings.
    pub fn from_settings(
        settings: &Settings,
        transport: Arc<dyn PeripheralTransport>,
        transport_events: TransportEventReceiver,
        source: Arc<dyn SensorSource>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let sampler = MotionSampler::new(
            source,
            settings.sensors.rate,
            settings.sensors.gravity_alpha(),
            event_sender.clone(),
        );
        Self::new(
            PeripheralConfig::from(&settings.peripheral),
            transport,
            transport_events,
            sampler,
            event_sender,
        )
    }

    fn pumps(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pumps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the peripheral session, then sampling. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) -> Result<(), PeripheralError> {
        let mut pumps = self.pumps();
        if !pumps.is_empty() {
            if self.controller.state().is_active() {
                debug!("Motion peripheral service already running");
                return Ok(());
            }
            debug!("Previous session ended, restarting");
            for pump in pumps.drain(..) {
                pump.abort();
            }
            self.sampler.stop();
        }

        pumps.push(self.spawn_transport_pump());
        if let Err(e) = self.controller.start() {
            for pump in pumps.drain(..) {
                pump.abort();
            }
            return Err(e);
        }

        self.sampler.start();
        pumps.push(self.spawn_sample_pump());
        info!("Motion peripheral service started");
        Ok(())
    }

    pub fn stop(&self) {
        let pumps: Vec<_> = self.pumps().drain(..).collect();
        for pump in pumps {
            pump.abort();
        }
        self.sampler.stop();
        self.controller.stop();
    }

    fn spawn_transport_pump(&self) -> JoinHandle<()> {
        let receiver = self.transport_events.clone();
        let controller = self.controller.clone();
        let sampler = self.sampler.clone();
        tokio::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(event) = receiver.recv().await {
                let was_active = controller.state().is_active();
                controller.handle_event(event);
                if was_active && controller.state() == PeripheralState::Inactive {
                    warn!("Peripheral session ended, stopping sampler");
                    sampler.stop();
                }
            }
            debug!("Transport event channel closed");
        })
    }

    fn spawn_sample_pump(&self) -> JoinHandle<()> {
        let mut samples = self.sampler.subscribe();
        let controller = self.controller.clone();
        let event_sender = self.event_sender.clone();
        tokio::spawn(async move {
            while samples.changed().await.is_ok() {
                let sample = *samples.borrow_and_update();
                if let Some(sample) = sample {
                    controller.publish_sample(&sample);
                    let _ = event_sender.send(AppEvent::Motion(sample));
                }
            }
        })
    }

    pub fn controller(&self) -> &GattPeripheralController {
        &self.controller
    }

    pub fn sampler(&self) -> &MotionSampler {
        &self.sampler
    }

    pub fn state(&self) -> PeripheralState {
        self.controller.state()
    }
}

impl Drop for MotionPeripheralService {
    fn drop(&mut self) {
        self.stop();
    }
}
