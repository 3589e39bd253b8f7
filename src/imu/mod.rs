//! IMU sample storage and preintegration.

pub mod preintegration;
pub mod ring_buffer;
pub mod sample;

pub use preintegration::{compose, imu_noise_covariance, preintegrate, InertialDelta};
pub use ring_buffer::InertialRingBuffer;
pub use sample::{BiasState, InertialSample};
