//! SO(3) IMU preintegration between two arbitrary timestamps,
//! following Forster et al., "On-Manifold Preintegration for Real-Time
//! Visual-Inertial Odometry", as implemented in `ImuBuffer::ImuPreIntegration`
//! (see `original_source/src/IO/dataBuffer/ImuBuffer.cpp`).

use nalgebra::{Matrix3, Rotation3, Vector3};

use super::ring_buffer::InertialRingBuffer;
use crate::error::{Result, VioError};
use crate::types::linalg::{PreintCov, PreintNoiseCov};
use crate::types::TimestampNs;

/// A preintegrated relative-motion term between `t0` and `t1`.
#[derive(Clone, Debug)]
pub struct InertialDelta {
    pub t0: TimestampNs,
    pub t1: TimestampNs,

    /// Cumulative rotation, body frame at t0.
    pub delta_r: Rotation3<f64>,
    /// Cumulative velocity increment, body frame at t0.
    pub delta_v: Vector3<f64>,
    /// Cumulative position increment, body frame at t0.
    pub delta_p: Vector3<f64>,

    /// 9x9 covariance over (Δθ, ΔV, ΔP).
    pub cov: PreintCov,

    /// ∂ΔR/∂bg
    pub d_r_d_bg: Matrix3<f64>,
    /// ∂ΔV/∂ba
    pub d_v_d_ba: Matrix3<f64>,
    /// ∂ΔV/∂bg
    pub d_v_d_bg: Matrix3<f64>,
    /// ∂ΔP/∂ba
    pub d_p_d_ba: Matrix3<f64>,
    /// ∂ΔP/∂bg
    pub d_p_d_bg: Matrix3<f64>,

    /// Total integrated time span, nanoseconds.
    pub d_t_ns: i64,
    pub sensor_id: u32,
}

impl InertialDelta {
    pub fn reset(t0: TimestampNs, t1: TimestampNs) -> Self {
        Self {
            t0,
            t1,
            delta_r: Rotation3::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            cov: PreintCov::zeros(),
            d_r_d_bg: Matrix3::zeros(),
            d_v_d_ba: Matrix3::zeros(),
            d_v_d_bg: Matrix3::zeros(),
            d_p_d_ba: Matrix3::zeros(),
            d_p_d_bg: Matrix3::zeros(),
            d_t_ns: 0,
            sensor_id: 0,
        }
    }

    /// `true` once `cov` looks like a valid symmetric PSD 9x9 matrix, used
    /// by tests/invariant checks; not required on every call's hot path.
    pub fn covariance_is_psd(&self) -> bool {
        let sym = (&self.cov - self.cov.transpose()).abs().max();
        if sym > 1e-8 {
            return false;
        }
        match self.cov.symmetric_eigen().eigenvalues.min() {
            min if min >= -1e-8 => true,
            _ => false,
        }
    }
}

/// `I - 0.5 * skew(x)`, the first-order right-Jacobian approximation used
/// throughout the original's per-step update (named `vector2Jac` there).
fn vector_to_jacobian(x: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::identity() - 0.5 * skew(x)
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Preintegrate IMU data from `t0` to `t1` against the samples already in
/// `buffer`. Does not block or retry: returns `VioError::ImuGap` if `t1` is
/// beyond the newest sample and `VioError::ImuStale` if `t0` precedes the
/// oldest retained sample — the caller (frame orchestrator) owns the
/// retry/backoff policy.
///
/// `frame_period_ns` is the nominal inter-frame period; exceeding 1.5x it
/// logs a frame-drop warning but does not fail.
/// `noise_cov` is the discrete IMU noise covariance (see
/// [`imu_noise_covariance`]), computed once from `VioConfig` by the caller.
pub fn preintegrate(
    buffer: &InertialRingBuffer,
    t0: TimestampNs,
    t1: TimestampNs,
    frame_period_ns: i64,
    noise_cov: &PreintNoiseCov,
) -> Result<InertialDelta> {
    if t0 >= t1 {
        return Err(VioError::NonMonotonicInterval { t0, t1 });
    }

    let i0 = buffer.index_leq(t0)?;
    let i1 = buffer.index_leq(t1)?;

    let mut delta = InertialDelta::reset(t0, t1);
    delta.sensor_id = buffer.newest().map(|s| s.sensor_id).unwrap_or(0);
    let bias = buffer.bias();

    let mut a = nalgebra::SMatrix::<f64, 9, 9>::identity();
    let mut b = nalgebra::SMatrix::<f64, 9, 6>::zeros();

    let mut dr0 = Rotation3::<f64>::identity();
    let mut dv0 = Vector3::zeros();

    // Breakpoints are t0, every raw sample strictly between t0 and t1, then
    // t1 — the first and last sub-intervals are therefore fractional while
    // interior ones span exactly one raw sample spacing.
    let mut breakpoints = vec![t0];
    for k in (i0 + 1)..=i1 {
        let ts = buffer.range(k, k)[0].1.t_ns;
        if ts < t1 {
            breakpoints.push(ts);
        }
    }
    breakpoints.push(t1);
    breakpoints.dedup();

    for w in 0..breakpoints.len() - 1 {
        let (ta, tb) = (breakpoints[w], breakpoints[w + 1]);
        let dt_ns = tb - ta;
        let dt = dt_ns as f64 * 1e-9;

        // Midpoint rule: for interior sub-intervals this is exactly the
        // average of the two bracketing raw samples (interpolation is
        // linear); for the clipped first/last sub-intervals it is the
        // interpolated value at the sub-interval's midpoint.
        let mid = ta + dt_ns / 2;
        let mid_sample = buffer.get_by_timestamp(mid)?;
        let gyro = mid_sample.gyro - bias.bg;
        let acc = mid_sample.acc - bias.ba;

        let dd_v0 = acc * dt;
        let dd_r0 = gyro * dt;
        let dd_r = Rotation3::from_scaled_axis(dd_r0);

        a.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(dd_r.matrix().transpose().as_ref());
        let vel_theta_block = -dr0.matrix() * skew(&dd_v0);
        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&vel_theta_block);
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(0.5 * dt * vel_theta_block));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        b.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(vector_to_jacobian(&dd_r0) * dt));
        b.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(dr0.matrix() * dt));
        b.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(dr0.matrix() * (0.5 * dt * dt)));

        delta.cov = a * delta.cov * a.transpose() + b * *noise_cov * b.transpose();

        // Bias-Jacobian update, in the exact order the source uses (later
        // rows read the just-updated `d_r_d_bg`).
        delta.d_r_d_bg -= dd_r.matrix().transpose() * vector_to_jacobian(&dd_r0) * dt;
        delta.d_v_d_ba -= dr0.matrix() * dt;
        delta.d_v_d_bg -= dr0.matrix() * skew(&dd_v0) * delta.d_r_d_bg;
        // NOTE: coefficient 1.5 (not the reference paper's 1.0) is carried
        // over verbatim from the source for regression compatibility — see
        // an open question left unresolved upstream.
        delta.d_p_d_ba -= 1.5 * dr0.matrix() * dt * dt;
        delta.d_p_d_bg -= 1.5 * dr0.matrix() * skew(&dd_v0) * delta.d_r_d_bg * dt;

        let dd_v = dr0.matrix() * acc * dt;
        delta.delta_p += dv0 * dt + 0.5 * dd_v * dt;
        dr0 = dr0 * dd_r;
        dv0 += dd_v;

        delta.delta_r = dr0;
        delta.delta_v = dv0;
    }

    delta.d_t_ns += t1 - t0;
    let threshold = (1.5 * frame_period_ns as f64) as i64;
    if delta.d_t_ns > threshold {
        log::warn!(
            "frame drop detected: dT={}ns exceeds 1.5x nominal period ({}ns)",
            delta.d_t_ns,
            threshold
        );
    }

    Ok(delta)
}

/// Discrete noise covariance `diag(sigma_g^2 * fps, sigma_a^2 * fps)`
/// used to scale continuous-time noise densities to the sample rate.
pub fn imu_noise_covariance(fps: f64, gyro_noise_std: f64, accel_noise_std: f64) -> PreintNoiseCov {
    let mut q = PreintNoiseCov::zeros();
    let gyro_var = gyro_noise_std * gyro_noise_std * fps;
    let acc_var = accel_noise_std * accel_noise_std * fps;
    for i in 0..3 {
        q[(i, i)] = gyro_var;
    }
    for i in 3..6 {
        q[(i, i)] = acc_var;
    }
    q
}

/// Compose two adjacent preintegrated deltas `(t0,t1)` and `(t1,t2)` into a
/// single `(t0,t2)` delta. Covariance and bias Jacobians are propagated to
/// first order.
pub fn compose(first: &InertialDelta, second: &InertialDelta) -> InertialDelta {
    assert_eq!(first.t1, second.t0, "compose requires adjacent intervals");

    let mut out = InertialDelta::reset(first.t0, second.t1);
    out.sensor_id = first.sensor_id;

    let dt2 = (second.t1 - second.t0) as f64 * 1e-9;
    out.delta_p = first.delta_p
        + first.delta_v * dt2
        + first.delta_r.matrix() * second.delta_p;
    out.delta_v = first.delta_v + first.delta_r.matrix() * second.delta_v;
    out.delta_r = first.delta_r * second.delta_r;

    let mut a = nalgebra::SMatrix::<f64, 9, 9>::identity();
    a.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(second.delta_r.matrix().transpose().as_ref());
    a.fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(-first.delta_r.matrix() * skew(&second.delta_v)));
    a.fixed_view_mut::<3, 3>(6, 0)
        .copy_from(&(-first.delta_r.matrix() * skew(&second.delta_p)));
    a.fixed_view_mut::<3, 3>(6, 3)
        .copy_from(&(Matrix3::identity() * dt2));
    out.cov = a * first.cov * a.transpose() + second.cov;

    out.d_t_ns = first.d_t_ns + second.d_t_ns;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::sample::InertialSample;

    fn fill_buffer(
        hz: f64,
        duration_s: f64,
        gyro: Vector3<f64>,
        acc: Vector3<f64>,
    ) -> InertialRingBuffer {
        let n = (hz * duration_s) as usize + 10;
        let mut buf = InertialRingBuffer::new(n + 10);
        let dt_ns = (1.0e9 / hz) as i64;
        for i in 0..n {
            buf.push(InertialSample::new(i as i64 * dt_ns, gyro, acc, 0));
        }
        buf
    }

    fn test_noise_cov() -> PreintNoiseCov {
        imu_noise_covariance(200.0, 0.004, 0.04)
    }

    #[test]
    fn pure_rotation_matches_expected_angle() {
        let gyro = Vector3::new(0.0, 0.0, 0.5);
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let buf = fill_buffer(200.0, 1.1, gyro, acc);
        let t0 = 0i64;
        let t1 = 1_000_000_000i64;
        let delta = preintegrate(&buf, t0, t1, 50_000_000, &test_noise_cov()).unwrap();

        let expected = Rotation3::from_scaled_axis(Vector3::new(0.0, 0.0, 0.5));
        let err = (delta.delta_r.matrix() - expected.matrix()).abs().max();
        assert!(err < 2e-3, "rotation error too large: {err}");

        // Gravity-compensated velocity/position should stay near zero.
        let v_free = delta.delta_v - delta.delta_r.matrix() * Vector3::zeros();
        assert!(v_free.norm() < 0.2, "unexpected velocity drift: {v_free}");
    }

    #[test]
    fn free_fall_matches_half_g_t_squared() {
        let gyro = Vector3::zeros();
        let acc = Vector3::zeros();
        let buf = fill_buffer(200.0, 0.2, gyro, acc);
        let delta = preintegrate(&buf, 0, 100_000_000, 50_000_000, &test_noise_cov()).unwrap();
        // No gravity compensation happens inside preintegrate (that is a
        // filter-level concern); with zero specific force the body-frame
        // delta-position is ~0, matching a freely falling accelerometer
        // reading zero proper acceleration.
        assert!(delta.delta_p.norm() < 1e-9);
        assert!(delta.delta_v.norm() < 1e-9);
    }

    #[test]
    fn rotation_stays_valid() {
        let gyro = Vector3::new(0.1, -0.2, 0.3);
        let acc = Vector3::new(0.2, 0.1, 9.81);
        let buf = fill_buffer(200.0, 1.0, gyro, acc);
        let delta = preintegrate(&buf, 0, 900_000_000, 50_000_000, &test_noise_cov()).unwrap();
        let det = delta.delta_r.matrix().determinant();
        assert!((det - 1.0).abs() < 1e-5);
        let orth = (delta.delta_r.matrix() * delta.delta_r.matrix().transpose()
            - Matrix3::identity())
        .abs()
        .max();
        assert!(orth < 1e-5);
    }

    #[test]
    fn covariance_stays_symmetric_psd() {
        let gyro = Vector3::new(0.05, 0.0, 0.0);
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let buf = fill_buffer(200.0, 1.0, gyro, acc);
        let delta = preintegrate(&buf, 0, 900_000_000, 50_000_000, &test_noise_cov()).unwrap();
        assert!(delta.covariance_is_psd());
    }

    #[test]
    fn rejects_non_monotonic_interval() {
        let buf = fill_buffer(200.0, 1.0, Vector3::zeros(), Vector3::zeros());
        let err = preintegrate(&buf, 500, 100, 50_000_000, &test_noise_cov()).unwrap_err();
        assert!(matches!(err, VioError::NonMonotonicInterval { .. }));
    }

    #[test]
    fn split_and_compose_agrees_with_direct() {
        let gyro = Vector3::new(0.0, 0.2, 0.0);
        let acc = Vector3::new(0.1, 0.0, 9.81);
        let buf = fill_buffer(200.0, 1.0, gyro, acc);
        let noise = test_noise_cov();

        let direct = preintegrate(&buf, 0, 600_000_000, 50_000_000, &noise).unwrap();
        let first = preintegrate(&buf, 0, 300_000_000, 50_000_000, &noise).unwrap();
        let second = preintegrate(&buf, 300_000_000, 600_000_000, 50_000_000, &noise).unwrap();
        let composed = compose(&first, &second);

        let r_err = (direct.delta_r.matrix() - composed.delta_r.matrix())
            .abs()
            .max();
        assert!(r_err < 1e-3, "rotation mismatch: {r_err}");
        let p_err = (direct.delta_p - composed.delta_p).norm();
        assert!(p_err < 1e-2, "position mismatch: {p_err}");
    }
}
