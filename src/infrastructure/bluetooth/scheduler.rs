//! Notification Scheduler
//!
//! Flushes dirty characteristic values to every subscriber at a fixed period,
//! independent of how fast samples arrive. The periodic task exists only while
//! the registry has members: it is started by the first subscriber and stops
//! itself (or is paused) once the registry empties.

use crate::infrastructure::bluetooth::cache::CharacteristicCache;
use crate::infrastructure::bluetooth::controller::PeripheralConfig;
use crate::infrastructure::bluetooth::registry::SubscriberRegistry;
use crate::infrastructure::bluetooth::transport::PeripheralTransport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Scheduled,
}

/// Each start gets a fresh generation so a superseded task can never
/// overwrite the state of its replacement.
#[derive(Debug)]
enum TickState {
    Idle,
    Scheduled { generation: u64, task: JoinHandle<()> },
}

struct Shared {
    config: Arc<PeripheralConfig>,
    registry: Arc<SubscriberRegistry>,
    cache: Arc<CharacteristicCache>,
    transport: Arc<dyn PeripheralTransport>,
    state: Mutex<TickState>,
    next_generation: AtomicU64,
    ticks: AtomicU64,
}

pub struct NotificationScheduler {
    shared: Arc<Shared>,
}

impl NotificationScheduler {
    pub fn new(
        config: Arc<PeripheralConfig>,
        registry: Arc<SubscriberRegistry>,
        cache: Arc<CharacteristicCache>,
        transport: Arc<dyn PeripheralTransport>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                cache,
                transport,
                state: Mutex::new(TickState::Idle),
                next_generation: AtomicU64::new(0),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules periodic flushing and runs the first flush immediately.
    ///
    /// Returns `false` (and does nothing) when already scheduled. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        {
            let mut state = self.shared.state();
            if matches!(*state, TickState::Scheduled { .. }) {
                return false;
            }
            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            let task = tokio::spawn(run_periodic(self.shared.clone(), generation));
            *state = TickState::Scheduled { generation, task };
        }

        debug!(
            "Notification scheduler started ({:?} period)",
            self.shared.config.notify_interval
        );
        self.shared.flush();
        true
    }

    /// Cancels the pending tick. Returns `false` when nothing was scheduled.
    pub fn pause(&self) -> bool {
        let previous = std::mem::replace(&mut *self.shared.state(), TickState::Idle);
        match previous {
            TickState::Scheduled { task, .. } => {
                task.abort();
                debug!("Notification scheduler paused");
                true
            }
            TickState::Idle => false,
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        match *self.shared.state() {
            TickState::Idle => SchedulerStatus::Idle,
            TickState::Scheduled { .. } => SchedulerStatus::Scheduled,
        }
    }

    /// Number of flushes attempted so far, including immediate ones.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        self.pause();
    }
}

async fn run_periodic(shared: Arc<Shared>, generation: u64) {
    loop {
        tokio::time::sleep(shared.config.notify_interval).await;
        if !shared.is_current(generation) {
            return;
        }
        shared.flush();
        if !shared.reschedule(generation) {
            return;
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(*self.state(), TickState::Scheduled { generation: g, .. } if g == generation)
    }

    /// Decides whether the task identified by `generation` keeps ticking.
    fn reschedule(&self, generation: u64) -> bool {
        let mut state = self.state();
        match *state {
            TickState::Scheduled { generation: g, .. } if g == generation => {
                if self.registry.is_empty() {
                    debug!("Not rescheduling notifications, no subscribers");
                    *state = TickState::Idle;
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Sends every dirty characteristic to a snapshot of the registry.
    fn flush(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.registry.snapshot();
        if subscribers.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for (kind, payload) in self.cache.take_dirty() {
            let characteristic = self.config.characteristic_uuid(kind);
            for central in &subscribers {
                match self
                    .transport
                    .send_notification(central, characteristic, &payload)
                {
                    Ok(()) => sent += 1,
                    Err(e) if e.is_permission_denied() => {
                        error!("Missing permission to notify {}: {}", central, e)
                    }
                    Err(e) => warn!(
                        "Failed to notify {} for {}: {}",
                        central, characteristic, e
                    ),
                }
            }
        }

        trace!(sent, subscribers = subscribers.len(), "Notification flush");
        sent
    }
}
