use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::types::TimestampNs;

/// A single timestamped inertial sample.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InertialSample {
    /// Monotonically increasing nanosecond timestamp.
    pub t_ns: TimestampNs,
    /// Angular velocity, body frame, rad/s.
    pub gyro: Vector3<f64>,
    /// Specific force, body frame, m/s².
    pub acc: Vector3<f64>,
    /// Which physical IMU this sample came from.
    pub sensor_id: u32,
}

impl InertialSample {
    pub fn new(t_ns: TimestampNs, gyro: Vector3<f64>, acc: Vector3<f64>, sensor_id: u32) -> Self {
        Self {
            t_ns,
            gyro,
            acc,
            sensor_id,
        }
    }

    /// Linear interpolation between `self` and `other` at fraction `k` in
    /// [0, 1] of the way from `self` to `other`. Mirrors the original's
    /// `linearInterpolate` helper used at both ends of a preintegration
    /// interval.
    pub fn lerp(&self, other: &InertialSample, k: f64) -> InertialSample {
        InertialSample {
            t_ns: self.t_ns + ((other.t_ns - self.t_ns) as f64 * k) as i64,
            gyro: self.gyro + (other.gyro - self.gyro) * k,
            acc: self.acc + (other.acc - self.acc) * k,
            sensor_id: self.sensor_id,
        }
    }
}

/// Gyro/accelerometer bias state, owned by the ring buffer and updated
/// additively by the filter's residuals.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BiasState {
    pub bg: Vector3<f64>,
    pub ba: Vector3<f64>,
}

impl BiasState {
    pub fn zero() -> Self {
        Self {
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
        }
    }

    pub fn update(&mut self, d_bg: Vector3<f64>, d_ba: Vector3<f64>) {
        self.bg += d_bg;
        self.ba += d_ba;
    }

    pub fn set(&mut self, bg: Vector3<f64>, ba: Vector3<f64>) {
        self.bg = bg;
        self.ba = ba;
    }
}
