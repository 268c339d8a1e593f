//! Characteristic Cache
//!
//! Latest encoded value and dirty flag for each motion characteristic. Written
//! by the sample path, drained by the notification scheduler.

use crate::domain::models::{CharacteristicKind, MotionSample};
use crate::infrastructure::bluetooth::protocol::{self, AxisPayload, AXIS_PAYLOAD_LEN};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Default)]
struct CharacteristicState {
    latest_payload: Option<AxisPayload>,
    dirty: bool,
}

impl CharacteristicState {
    /// Stores `payload`, marking dirty only when it differs from the cached value.
    fn store(&mut self, payload: AxisPayload) -> bool {
        if self.latest_payload == Some(payload) {
            return false;
        }
        self.latest_payload = Some(payload);
        self.dirty = true;
        true
    }
}

#[derive(Debug, Default)]
struct Slots {
    accel: CharacteristicState,
    gyro: CharacteristicState,
}

impl Slots {
    fn get(&self, kind: CharacteristicKind) -> &CharacteristicState {
        match kind {
            CharacteristicKind::Accel => &self.accel,
            CharacteristicKind::Gyro => &self.gyro,
        }
    }

    fn get_mut(&mut self, kind: CharacteristicKind) -> &mut CharacteristicState {
        match kind {
            CharacteristicKind::Accel => &mut self.accel,
            CharacteristicKind::Gyro => &mut self.gyro,
        }
    }
}

#[derive(Debug, Default)]
pub struct CharacteristicCache {
    slots: Mutex<Slots>,
}

impl CharacteristicCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caches both axis groups of `sample`; returns the characteristics that
    /// became dirty.
    pub fn update(&self, sample: &MotionSample) -> Vec<CharacteristicKind> {
        let mut slots = self.slots();
        CharacteristicKind::ALL
            .into_iter()
            .filter(|kind| {
                let payload = protocol::encode_axis_payload(sample.axes(*kind));
                slots.get_mut(*kind).store(payload)
            })
            .collect()
    }

    /// Takes every dirty payload and clears the flags in one step.
    pub fn take_dirty(&self) -> Vec<(CharacteristicKind, AxisPayload)> {
        let mut slots = self.slots();
        CharacteristicKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let state = slots.get_mut(kind);
                if !state.dirty {
                    return None;
                }
                state.dirty = false;
                state.latest_payload.map(|payload| (kind, payload))
            })
            .collect()
    }

    /// Latest value of a characteristic (zeros before the first sample).
    pub fn latest(&self, kind: CharacteristicKind) -> AxisPayload {
        self.slots()
            .get(kind)
            .latest_payload
            .unwrap_or([0u8; AXIS_PAYLOAD_LEN])
    }

    pub fn is_dirty(&self, kind: CharacteristicKind) -> bool {
        self.slots().get(kind).dirty
    }

    pub fn reset(&self) {
        *self.slots() = Slots::default();
    }
}
