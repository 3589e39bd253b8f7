//! Linear algebra type system for the VIO estimation core.
//!
//! Provides compile-time dimension checking and clean type aliases for the
//! preintegration error state and the solver's measurement Jacobians. The
//! sliding-window state itself is variable-sized (it grows/shrinks with the
//! number of cloned poses) and so uses `nalgebra::{DMatrix, DVector}` instead.

use nalgebra::{SMatrix, SVector};

// ===== Preintegration error-state dimension =====
/// Error state order is (Δθ, ΔV, ΔP), each 3-D, in the body frame at t0.
pub const PREINT_STATE_DIM: usize = 9;
/// IMU noise input order is (gyro noise, accel noise), each 3-D.
pub const PREINT_NOISE_DIM: usize = 6;

pub type PreintCov = SMatrix<f64, PREINT_STATE_DIM, PREINT_STATE_DIM>;
pub type PreintTransition = SMatrix<f64, PREINT_STATE_DIM, PREINT_STATE_DIM>;
pub type PreintNoiseJacobian = SMatrix<f64, PREINT_STATE_DIM, PREINT_NOISE_DIM>;
pub type PreintNoiseCov = SMatrix<f64, PREINT_NOISE_DIM, PREINT_NOISE_DIM>;

/// Per-observation measurement Jacobian block w.r.t. a 3-D feature position.
pub type FeatureJacobian = SMatrix<f64, 2, 3>;
/// Per-observation measurement Jacobian block w.r.t. a 6-DoF pose error.
pub type PoseJacobian = SMatrix<f64, 2, 6>;
pub type Vec9 = SVector<f64, 9>;
pub type Vec6 = SVector<f64, 6>;
