//! Black-box scenarios exercising the estimation core's public API.

use nalgebra::{Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vio_msckf::config::VioConfig;
use vio_msckf::imu::{imu_noise_covariance, preintegrate, InertialRingBuffer, InertialSample};
use vio_msckf::types::PixelCoord;
use vio_msckf::vio::association::{DataAssociation, LandmarkSlab};
use vio_msckf::vio::camera::PinholeCamera;
use vio_msckf::vio::grid::{self, GridCandidate};
use vio_msckf::vio::landmark::VisualObservation;
use vio_msckf::vio::ransac::{two_point_ransac, RansacParams};
use vio_msckf::vio::solver::{CamPoseState, EkfSolver};

fn fill_buffer(hz: f64, duration_s: f64, gyro: Vector3<f64>, acc: Vector3<f64>) -> InertialRingBuffer {
    let n = (hz * duration_s) as usize + 10;
    let mut buf = InertialRingBuffer::new(n + 10);
    let dt_ns = (1.0e9 / hz) as i64;
    for i in 0..n {
        buf.push(InertialSample::new(i as i64 * dt_ns, gyro, acc, 0));
    }
    buf
}

/// Scenario 1: pure rotation about z at 0.5 rad/s for 1.0 s with gravity as
/// the only specific force. Expected dR ~ Rz(0.5 rad), dP/dV ~ 0.
#[test]
fn scenario_pure_rotation() {
    let gyro = Vector3::new(0.0, 0.0, 0.5);
    let acc = Vector3::new(0.0, 0.0, 9.81);
    let buf = fill_buffer(200.0, 1.1, gyro, acc);
    let noise = imu_noise_covariance(200.0, 0.004, 0.04);

    let delta = preintegrate(&buf, 0, 1_000_000_000, 50_000_000, &noise).unwrap();

    let expected = Rotation3::from_scaled_axis(Vector3::new(0.0, 0.0, 0.5));
    let r_err = (delta.delta_r.matrix() - expected.matrix()).abs().max();
    assert!(r_err < 2e-3, "rotation error too large: {r_err}");
    assert!(delta.delta_v.norm() < 0.2);
}

/// Scenario 2: free fall for 0.1 s (zero specific force, zero gyro) from
/// rest. With no gravity compensation inside preintegrate itself, the
/// body-frame delta-position tracks the (zero) proper acceleration, which
/// is exactly the precondition a filter-level gravity subtraction needs to
/// then reconstruct the 1/2*g*t^2 drop in the world frame.
#[test]
fn scenario_free_fall() {
    let buf = fill_buffer(200.0, 0.2, Vector3::zeros(), Vector3::zeros());
    let noise = imu_noise_covariance(200.0, 0.004, 0.04);
    let delta = preintegrate(&buf, 0, 100_000_000, 50_000_000, &noise).unwrap();
    assert!(delta.delta_p.norm() < 1e-9);
    assert!(delta.delta_v.norm() < 1e-9);
}

/// Scenario 3: 100 landmarks on a uniform 10x10 pixel grid, all dead_all
/// with equal ray_angle. Exactly the top 2 per 4x4 bin should survive
/// coarsening, and at budget=4 (one slot per quadrant) at most one per
/// quadrant reaches the solver.
#[test]
fn scenario_grid_coverage() {
    let width = 640u32;
    let height = 480u32;
    let mut candidates = Vec::new();
    let mut id = 0u64;
    for gy in 0..10 {
        for gx in 0..10 {
            let x = (gx as f64 + 0.5) * width as f64 / 10.0;
            let y = (gy as f64 + 0.5) * height as f64 / 10.0;
            candidates.push(GridCandidate {
                id,
                px: PixelCoord::new(x, y),
                ray_angle: 1.0,
                alive: false,
            });
            id += 1;
        }
    }

    let selection = grid::select(candidates, width, height);

    let per_quadrant_budget = 1usize;
    for quadrant in &selection.quadrants {
        assert!(quadrant.len() <= 2 * 4, "each quadrant draws from at most 4 bins x 2");
        let admitted: Vec<_> = quadrant.iter().rev().take(per_quadrant_budget).collect();
        assert!(admitted.len() <= 1, "budget=4 admits at most one per quadrant");
    }
}

/// Scenario 4: 200 static IMU samples below the gyro/accel thresholds.
/// `detect_static` reports true and `update_bias_by_static` sets the gyro
/// bias to the sample mean.
#[test]
fn scenario_static_frame_detection() {
    let mut buf = InertialRingBuffer::new(300);
    for i in 0..200 {
        buf.push(InertialSample::new(
            i * 5_000_000,
            Vector3::new(0.001, -0.001, 0.0005),
            Vector3::new(0.0, 0.0, 9.81),
            0,
        ));
    }
    assert!(buf.detect_static());
    buf.update_bias_by_static();
    assert!((buf.bias().bg - Vector3::new(0.001, -0.001, 0.0005)).norm() < 1e-9);
    assert_eq!(buf.bias().ba, Vector3::zeros());
}

/// Scenario 5: two-point RANSAC over 50 correct correspondences and 50
/// randomized ones recovers at least 48 correct inliers and admits at most
/// 2 random outliers.
#[test]
fn scenario_ransac_rejects_outliers() {
    let mut rng = StdRng::seed_from_u64(42);
    let delta_r = Rotation3::from_scaled_axis(Vector3::new(0.0, 0.01, 0.02));
    let translation = Vector3::new(0.1, 0.0, 0.0);

    let mut rays0 = Vec::new();
    let mut rays1 = Vec::new();
    for _ in 0..50 {
        let depth = rng.gen_range(2.0..5.0);
        let r0 = Vector3::new(rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3), 1.0).normalize();
        let point_cam0 = r0 * depth;
        let point_cam1 = delta_r.inverse() * (point_cam0 - translation);
        rays0.push(r0);
        rays1.push(point_cam1.normalize());
    }
    for _ in 0..50 {
        let jitter = |rng: &mut StdRng| {
            Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            )
        };
        rays0.push((Vector3::new(0.0, 0.0, 1.0) + jitter(&mut rng) * 0.5).normalize());
        rays1.push((Vector3::new(0.0, 0.0, 1.0) + jitter(&mut rng) * 0.5).normalize());
    }

    let params = RansacParams {
        residual_threshold: 0.02,
        ..RansacParams::default()
    };
    let mask = two_point_ransac(&rays0, &rays1, &delta_r, &params);

    let correct = mask[..50].iter().filter(|&&b| b).count();
    let wrong = mask[50..].iter().filter(|&&b| b).count();
    assert!(correct >= 48, "only recovered {correct} of 50 true inliers");
    assert!(wrong <= 2, "admitted {wrong} of 50 random outliers");
}

/// Scenario 6: with the MSCKF budget starved to zero, the main selection
/// pass admits nothing; the stereo fallback then admits points up to the
/// configured point budget from the same dead-set candidates.
#[test]
fn scenario_stereo_fallback_admits_points() {
    let cam = PinholeCamera::new(640, 480, 400.0, 400.0, 320.0, 240.0).with_stereo(true);
    let mut solver = EkfSolver::new(cam, 20, 1.0);
    solver.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::zeros()));
    solver.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::new(0.2, 0.0, 0.0)));

    let mut slab = LandmarkSlab::new();
    let truth = Vector3::new(0.1, 0.0, 3.0);
    let id = slab.insert(1);
    {
        let lm = slab.get_mut(id).unwrap();
        let slot1_bearing = {
            let pose = &solver.poses[1];
            (pose.rotation.inverse() * (truth - pose.position)).normalize()
        };
        for (slot, pose) in solver.poses.iter().enumerate() {
            let bearing = (pose.rotation.inverse() * (truth - pose.position)).normalize();
            lm.push_observation(VisualObservation::new(0, slot, PixelCoord::new(320.0, 240.0), bearing));
        }
        for _ in 0..5 {
            lm.push_observation(VisualObservation::new(0, 1, PixelCoord::new(320.0, 240.0), slot1_bearing));
        }
        lm.flag_dead_all = true;
        lm.stereo_parallax = 0.05;
    }

    let config = VioConfig {
        stereo: true,
        max_obs_size: 0,
        max_additional_msckf_point: 0,
        max_point_size: 10,
        ..VioConfig::default()
    };
    assert!(config.msckf_budget(0) <= 0, "budget must be starved for this scenario");

    let mut assoc = DataAssociation::new();
    let stats = assoc.process_frame(1, &[id], &mut slab, &mut solver, &config);

    assert_eq!(stats.admitted_msckf, 0, "main pass must admit nothing with a zero budget");
    assert_eq!(stats.admitted_slam, 0);
    assert!(
        stats.stereo_fallback_admitted >= 1,
        "stereo fallback should admit the starved candidate"
    );
}
