//! IMU (Inertial Measurement Unit) Fusion
//!
//! Separates gravity from raw accelerometer readings and pairs the result with
//! the latest gyroscope reading.

use crate::domain::models::{MotionSample, Vector3};

/// Smoothing factor of the gravity low-pass filter. Closer to 1 = more smoothing.
pub const DEFAULT_GRAVITY_ALPHA: f32 = 0.8;

/// First-order low-pass filter tracking the gravity component of acceleration.
#[derive(Debug, Clone)]
pub struct GravityFilter {
    alpha: f32,
    gravity: Vector3,
}

impl GravityFilter {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha,
            gravity: [0.0; 3],
        }
    }

    /// Feeds one raw accelerometer reading and returns the linear acceleration
    /// (the reading with the updated gravity estimate removed).
    pub fn update(&mut self, raw: Vector3) -> Vector3 {
        let mut linear = [0.0; 3];
        for i in 0..3 {
            self.gravity[i] = self.alpha * self.gravity[i] + (1.0 - self.alpha) * raw[i];
            linear[i] = raw[i] - self.gravity[i];
        }
        linear
    }

    pub fn gravity(&self) -> Vector3 {
        self.gravity
    }

    pub fn reset(&mut self) {
        self.gravity = [0.0; 3];
    }
}

impl Default for GravityFilter {
    fn default() -> Self {
        Self::new(DEFAULT_GRAVITY_ALPHA)
    }
}

/// Latest processed accel/gyro state.
///
/// Nothing is emitted until both sensors have reported at least once; after
/// that every reading produces a sample built from the latest value of each.
#[derive(Debug, Clone, Default)]
pub struct MotionFusion {
    filter: GravityFilter,
    accel: Option<Vector3>,
    gyro: Option<Vector3>,
}

impl MotionFusion {
    pub fn new(alpha: f32) -> Self {
        Self {
            filter: GravityFilter::new(alpha),
            accel: None,
            gyro: None,
        }
    }

    pub fn ingest_accel(&mut self, raw: Vector3) -> Option<MotionSample> {
        if self.accel.is_none() {
            tracing::debug!("Received initial accelerometer update");
        }
        self.accel = Some(self.filter.update(raw));
        self.snapshot()
    }

    pub fn ingest_gyro(&mut self, raw: Vector3) -> Option<MotionSample> {
        if self.gyro.is_none() {
            tracing::debug!("Received initial gyroscope update");
        }
        self.gyro = Some(raw);
        self.snapshot()
    }

    /// Current combined sample, if both sensors have reported.
    pub fn snapshot(&self) -> Option<MotionSample> {
        match (self.accel, self.gyro) {
            (Some(accel), Some(gyro)) => Some(MotionSample { accel, gyro }),
            _ => None,
        }
    }

    pub fn is_warmed_up(&self) -> bool {
        self.accel.is_some() && self.gyro.is_some()
    }

    pub fn gravity(&self) -> Vector3 {
        self.filter.gravity()
    }

    /// Clears the warm-up flags and the gravity estimate.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.accel = None;
        self.gyro = None;
    }
}
