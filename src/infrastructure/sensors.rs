//! Sensor Sampling
//!
//! Subscribes to the raw accelerometer and gyroscope streams, runs them through
//! [`MotionFusion`] and publishes each fused [`MotionSample`] as a whole value on
//! a watch channel.

use crate::domain::imu::MotionFusion;
use crate::domain::models::{AppEvent, MessageSeverity, MotionSample, StatusMessage, Vector3};
use crate::domain::settings::SensorSettings;
use crate::error::SensorError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub use crate::domain::models::SamplingRate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
}

impl SensorKind {
    pub const ALL: [Self; 2] = [Self::Accelerometer, Self::Gyroscope];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAccuracy {
    Unreliable,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawSensorEvent {
    Reading { sensor: SensorKind, values: Vector3 },
    AccuracyChanged { sensor: SensorKind, accuracy: SensorAccuracy },
}

pub type SensorEventSender = mpsc::UnboundedSender<RawSensorEvent>;

/// Platform sensor access.
pub trait SensorSource: Send + Sync {
    /// Starts delivering `kind` readings into `sink`.
    fn register(
        &self,
        kind: SensorKind,
        rate: SamplingRate,
        sink: SensorEventSender,
    ) -> Result<(), SensorError>;

    /// Stops delivery for `kind`. No-op when not registered.
    fn unregister(&self, kind: SensorKind);
}

/// Picks the sensor source the settings ask for.
pub fn source_for(settings: &SensorSettings) -> Result<Arc<dyn SensorSource>, SensorError> {
    if settings.simulated {
        Ok(Arc::new(SimulatedImu::new()))
    } else {
        Err(SensorError::NoHardwareSource)
    }
}

struct Fusion {
    state: MotionFusion,
    /// Bumped on every stop; readings from an earlier run are dropped.
    generation: u64,
}

struct SamplerShared {
    fusion: Mutex<Fusion>,
    samples: watch::Sender<Option<MotionSample>>,
}

impl SamplerShared {
    fn fusion(&self) -> MutexGuard<'_, Fusion> {
        self.fusion.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.fusion().generation
    }

    /// Fuses one event. With `Some(generation)` the event is dropped unless
    /// it belongs to the current run.
    fn ingest(&self, generation: Option<u64>, event: RawSensorEvent) -> Option<MotionSample> {
        let mut fusion = self.fusion();
        if generation.is_some_and(|g| g != fusion.generation) {
            trace!("Dropping reading from a stopped run");
            return None;
        }

        let sample = match event {
            RawSensorEvent::Reading {
                sensor: SensorKind::Accelerometer,
                values,
            } => fusion.state.ingest_accel(values),
            RawSensorEvent::Reading {
                sensor: SensorKind::Gyroscope,
                values,
            } => fusion.state.ingest_gyro(values),
            RawSensorEvent::AccuracyChanged { sensor, accuracy } => {
                info!("{:?} accuracy changed to {:?}", sensor, accuracy);
                None
            }
        }?;

        trace!(?sample, "Fused motion sample");
        // Published under the lock so a concurrent reset cannot be overtaken.
        self.samples.send_replace(Some(sample));
        Some(sample)
    }

    fn reset(&self) {
        let mut fusion = self.fusion();
        fusion.generation += 1;
        fusion.state.reset();
    }
}

#[derive(Default)]
struct Running {
    pump: Option<JoinHandle<()>>,
    registered: Vec<SensorKind>,
}

pub struct MotionSampler {
    source: Arc<dyn SensorSource>,
    rate: SamplingRate,
    shared: Arc<SamplerShared>,
    running: Mutex<Running>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl MotionSampler {
    pub fn new(
        source: Arc<dyn SensorSource>,
        rate: SamplingRate,
        gravity_alpha: f32,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (samples, _) = watch::channel(None);
        Self {
            source,
            rate,
            shared: Arc::new(SamplerShared {
                fusion: Mutex::new(Fusion {
                    state: MotionFusion::new(gravity_alpha),
                    generation: 0,
                }),
                samples,
            }),
            running: Mutex::new(Running::default()),
            event_sender,
        }
    }

    fn running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to both raw streams. Returns the number of sensors that
    /// registered; a missing sensor is reported, not returned as an error.
    ///
    /// Calling `start` while running does nothing and returns 0.
    pub fn start(&self) -> usize {
        let mut running = self.running();
        if running.pump.is_some() {
            debug!("Motion sampler already running");
            return 0;
        }

        let (sink, mut raw_events) = mpsc::unbounded_channel();
        for kind in SensorKind::ALL {
            match self.source.register(kind, self.rate, sink.clone()) {
                Ok(()) => {
                    debug!("Registered {:?} listener at {:?}", kind, self.rate);
                    running.registered.push(kind);
                }
                Err(e) => {
                    warn!("{}", e);
                    let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
                        message: e.to_string(),
                        severity: MessageSeverity::Warning,
                    }));
                }
            }
        }
        drop(sink);

        let shared = self.shared.clone();
        let generation = shared.generation();
        running.pump = Some(tokio::spawn(async move {
            while let Some(event) = raw_events.recv().await {
                shared.ingest(Some(generation), event);
            }
            debug!("Raw sensor streams closed");
        }));

        info!(
            "Motion sampler started with {} of {} sensors",
            running.registered.len(),
            SensorKind::ALL.len()
        );
        running.registered.len()
    }

    /// Unsubscribes both streams and resets the fusion state. Safe when not
    /// started.
    pub fn stop(&self) {
        let mut running = self.running();
        let Some(pump) = running.pump.take() else {
            return;
        };
        for kind in running.registered.drain(..) {
            self.source.unregister(kind);
        }
        pump.abort();
        self.shared.reset();
        info!("Motion sampler stopped");
    }

    /// Feeds one raw event directly, bypassing the source.
    pub fn ingest(&self, event: RawSensorEvent) -> Option<MotionSample> {
        self.shared.ingest(None, event)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MotionSample>> {
        self.shared.samples.subscribe()
    }

    pub fn latest(&self) -> Option<MotionSample> {
        *self.shared.samples.borrow()
    }

    /// Current gravity estimate, for diagnostics.
    pub fn gravity(&self) -> Vector3 {
        self.shared.fusion().state.gravity()
    }

    pub fn is_running(&self) -> bool {
        self.running().pump.is_some()
    }
}

impl Drop for MotionSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stand-in IMU: a device lying flat, gently rocking about the x axis.
pub struct SimulatedImu {
    tasks: Mutex<HashMap<SensorKind, JoinHandle<()>>>,
}

const STANDARD_GRAVITY: f32 = 9.81;
const ROCK_AMPLITUDE_RAD: f32 = 0.1;
const ROCK_PERIOD_SECS: f32 = 4.0;

impl SimulatedImu {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<SensorKind, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reading of `kind` at `t` seconds.
    pub fn reading_at(kind: SensorKind, t: f32) -> Vector3 {
        let omega = std::f32::consts::TAU / ROCK_PERIOD_SECS;
        let angle = ROCK_AMPLITUDE_RAD * (omega * t).sin();
        match kind {
            SensorKind::Accelerometer => [
                0.0,
                STANDARD_GRAVITY * angle.sin(),
                STANDARD_GRAVITY * angle.cos(),
            ],
            SensorKind::Gyroscope => [ROCK_AMPLITUDE_RAD * omega * (omega * t).cos(), 0.0, 0.0],
        }
    }
}

impl Default for SimulatedImu {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedImu {
    fn register(
        &self,
        kind: SensorKind,
        rate: SamplingRate,
        sink: SensorEventSender,
    ) -> Result<(), SensorError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            SensorError::RegistrationFailed {
                sensor: kind,
                reason: e.to_string(),
            }
        })?;

        let task = handle.spawn(async move {
            let started = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(rate.period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let t = started.elapsed().as_secs_f32();
                let event = RawSensorEvent::Reading {
                    sensor: kind,
                    values: Self::reading_at(kind, t),
                };
                if sink.send(event).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.tasks().insert(kind, task) {
            previous.abort();
        }
        Ok(())
    }

    fn unregister(&self, kind: SensorKind) {
        if let Some(task) = self.tasks().remove(&kind) {
            task.abort();
        }
    }
}

impl Drop for SimulatedImu {
    fn drop(&mut self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}
