//! MSCKF-style square-root EKF visual-inertial odometry core.
//!
//! Four subsystems, wired together by [`vio::FrameOrchestrator`]:
//! IMU preintegration over a fixed-capacity ring buffer (`imu`), the
//! data-association pipeline (classification, grid-based spatial coverage,
//! two-point RANSAC, MSCKF/SLAM budgeting — `vio::association`), the
//! square-root EKF solver interface and its default sliding-window
//! implementation (`vio::solver`), and the frame orchestrator itself
//! (`vio::orchestrator`). Configuration, error types, and shared numeric
//! types live in `config`, `error`, and `types`.

pub mod config;
pub mod error;
pub mod imu;
pub mod types;
pub mod vio;

pub use error::{Result, VioError};
