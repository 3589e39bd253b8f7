//! Gyro-aided two-point RANSAC: rejects feature correspondences that are
//! inconsistent with a rotation-only (translation-free direction unknown)
//! epipolar constraint between two frames.

use nalgebra::{Rotation3, Vector3};
use rand::seq::index::sample;
use rand::Rng;

/// Configuration for [`two_point_ransac`].
#[derive(Clone, Copy, Debug)]
pub struct RansacParams {
    pub confidence: f64,
    pub inlier_ratio: f64,
    pub max_iterations: usize,
    pub residual_threshold: f64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            confidence: 0.99,
            inlier_ratio: 0.5,
            max_iterations: 200,
            residual_threshold: 1e-3,
        }
    }
}

/// Gyro-aided two-point RANSAC over bearing-ray correspondences `(r0[i],
/// r1[i])`, with the inter-frame rotation `delta_r` fixed from integrated
/// gyro. Returns a Boolean inlier mask aligned to the input order.
///
/// With rotation fixed, a correct correspondence's rotated-first-ray and
/// second-ray both lie in the epipolar plane spanned by the (unknown)
/// translation direction `t`; the residual is the angle between the
/// observed second ray and the plane normal `t x (delta_r * r0)`.
pub fn two_point_ransac(
    rays0: &[Vector3<f64>],
    rays1: &[Vector3<f64>],
    delta_r: &Rotation3<f64>,
    params: &RansacParams,
) -> Vec<bool> {
    let n = rays0.len();
    assert_eq!(n, rays1.len(), "correspondence sets must be the same length");
    if n < 2 {
        return vec![true; n];
    }

    let rotated0: Vec<Vector3<f64>> = rays0.iter().map(|r| delta_r * r).collect();

    let mut rng = rand::thread_rng();
    let mut best_inliers = vec![false; n];
    let mut best_count = 0usize;
    let mut iterations = params.max_iterations;
    let mut tried = 0usize;

    while tried < iterations {
        tried += 1;
        let idx: Vec<usize> = sample(&mut rng, n, 2).into_iter().collect();
        let (i, j) = (idx[0], idx[1]);

        let Some(t_hat) = translation_from_pair(&rotated0[i], &rays1[i], &rotated0[j], &rays1[j])
        else {
            continue;
        };

        let mut inliers = vec![false; n];
        let mut count = 0;
        for k in 0..n {
            let normal = t_hat.cross(&rotated0[k]);
            let normal_norm = normal.norm();
            if normal_norm < 1e-12 {
                // Degenerate: rotated ray parallel to translation, cannot
                // discriminate; treat conservatively as inlier.
                inliers[k] = true;
                count += 1;
                continue;
            }
            let residual = (rays1[k].dot(&normal) / normal_norm).abs();
            if residual < params.residual_threshold {
                inliers[k] = true;
                count += 1;
            }
        }

        if count > best_count {
            best_count = count;
            best_inliers = inliers;

            let w = (best_count as f64 / n as f64).max(params.inlier_ratio).min(1.0 - 1e-9);
            let needed = ((1.0 - params.confidence).ln() / (1.0 - w * w).ln()).ceil();
            if needed.is_finite() {
                iterations = iterations.min(needed as usize).max(tried);
            }
        }
    }

    best_inliers
}

/// Recover a unit translation direction consistent with two correspondences
/// under a fixed rotation, via the two-point linear epipolar constraint.
/// Returns `None` on a degenerate (near-parallel) configuration.
fn translation_from_pair(
    r0a: &Vector3<f64>,
    r1a: &Vector3<f64>,
    r0b: &Vector3<f64>,
    r1b: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    let na = r1a.cross(r0a);
    let nb = r1b.cross(r0b);
    let t = na.cross(&nb);
    let norm = t.norm();
    if norm < 1e-9 {
        None
    } else {
        Some(t / norm)
    }
}

/// Draw `count` random unit bearing rays with small, bounded perpendicular
/// jitter applied to simulate outliers; used by tests exercising RANSAC
/// recovery rates.
#[cfg(test)]
pub fn jittered_ray<R: Rng + ?Sized>(rng: &mut R, base: Vector3<f64>, magnitude: f64) -> Vector3<f64> {
    let perturb = Vector3::new(
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
    ) * magnitude;
    (base + perturb).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn recovers_majority_inliers_with_random_outliers() {
        let mut rng = StdRng::seed_from_u64(7);
        let delta_r = Rotation3::from_scaled_axis(Vector3::new(0.0, 0.02, 0.01));
        let translation = Vector3::new(0.1, 0.0, 0.0);

        let n_inlier = 50;
        let n_outlier = 50;
        let mut rays0 = Vec::new();
        let mut rays1 = Vec::new();

        for _ in 0..n_inlier {
            let depth = rng.gen_range(2.0..5.0);
            let r0 = Vector3::new(
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.3..0.3),
                1.0,
            )
            .normalize();
            let point_cam0 = r0 * depth;
            let point_cam1 = delta_r.inverse() * (point_cam0 - translation);
            rays0.push(r0);
            rays1.push(point_cam1.normalize());
        }
        for _ in 0..n_outlier {
            rays0.push(jittered_ray(&mut rng, Vector3::new(0.0, 0.0, 1.0), 0.5));
            rays1.push(jittered_ray(&mut rng, Vector3::new(0.0, 0.0, 1.0), 0.5));
        }

        let params = RansacParams {
            residual_threshold: 0.02,
            ..RansacParams::default()
        };
        let mask = two_point_ransac(&rays0, &rays1, &delta_r, &params);

        let correct_inliers = mask[..n_inlier].iter().filter(|&&b| b).count();
        let false_inliers = mask[n_inlier..].iter().filter(|&&b| b).count();

        assert!(correct_inliers >= 40, "only recovered {correct_inliers} true inliers");
        assert!(false_inliers <= 20, "accepted {false_inliers} random outliers");
    }

    #[test]
    fn short_input_is_trivially_all_inliers() {
        let delta_r = Rotation3::identity();
        let rays0 = vec![Vector3::new(0.0, 0.0, 1.0)];
        let rays1 = vec![Vector3::new(0.0, 0.0, 1.0)];
        let mask = two_point_ransac(&rays0, &rays1, &delta_r, &RansacParams::default());
        assert_eq!(mask, vec![true]);
    }
}
