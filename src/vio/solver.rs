//! Square-root EKF solver interface the association orchestrator drives,
//! plus a concrete sliding-window implementation.
//!
//! Generalizes the explicit H/S/K, Joseph-form covariance update style used
//! by the dense 13D/15D filters to a square-root (Cholesky-factor)
//! information form over a sliding window of camera poses, with eigen
//! null-space projection for MSCKF (one-shot) points and direct state
//! augmentation for SLAM (persistent) points.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};

use crate::types::PoseSlot;
use crate::vio::camera::CameraModel;
use crate::vio::landmark::{Landmark, PointState};

/// Degrees of freedom per cloned pose in the error state: 3 rotation + 3
/// position.
const POSE_DOF: usize = 6;
/// Degrees of freedom per persistent SLAM feature.
const FEATURE_DOF: usize = 3;
/// Diagonal value seeded for a freshly appended or vacated state block,
/// representing a deliberately vague/uninformative prior.
const PRIOR_SQRT_INFO: f64 = 1e-3;

/// Per-frame cloned camera pose kept in the sliding window.
#[derive(Clone, Debug)]
pub struct CamPoseState {
    pub rotation: Rotation3<f64>,
    pub position: Vector3<f64>,
    /// Observation ids referencing this pose, for unlink-on-discard.
    pub ref_count: usize,
}

impl CamPoseState {
    pub fn new(rotation: Rotation3<f64>, position: Vector3<f64>) -> Self {
        Self {
            rotation,
            position,
            ref_count: 0,
        }
    }
}

/// The five operations the data-association orchestrator drives against the
/// solver.
pub trait Solver {
    /// Gauss-Newton triangulation on inverse depth. `false` on degenerate
    /// geometry (insufficient baseline, points behind the camera, failure
    /// to converge).
    fn triangulate(&self, landmark: &Landmark) -> bool;

    /// Builds H_x/H_f/r for `landmark` at `position` and checks that the
    /// null-space projection of `H_f` leaves a non-empty residual. `false`
    /// if the projected residual's null space is rank-deficient.
    fn compute_jacobians(&self, landmark: &Landmark, position: Vector3<f64>) -> bool;

    /// Chi-squared gating on the whitened, null-space-projected residual.
    fn mahalanobis_test(&self, landmark: &Landmark, point: &PointState) -> bool;

    /// Augments the persistent state vector with a new SLAM point and folds
    /// its reprojection residual into the information filter.
    fn add_slam_point(&mut self, landmark_id: u64, landmark: &Landmark, point: PointState);

    /// Contributes a one-shot null-projected update and discards the
    /// landmark's state (does not persist across frames).
    fn add_msckf_point(&mut self, landmark_id: u64, landmark: &Landmark, point: PointState);
}

/// Standard-normal quantile for a 95% one-sided confidence level, used by
/// the Wilson-Hilferty chi-squared approximation below.
const Z_95: f64 = 1.645;

/// Wilson-Hilferty cube-root approximation of the chi-squared quantile at
/// 95% confidence for `dof` degrees of freedom. No chi-squared table or
/// crate is pulled in for this; the approximation is within a few percent
/// of the exact quantile for the small dof this filter gates on.
fn chi2_quantile_95(dof: f64) -> f64 {
    let dof = dof.max(1.0);
    let term = 1.0 - 2.0 / (9.0 * dof) + Z_95 * (2.0 / (9.0 * dof)).sqrt();
    dof * term.powi(3)
}

/// Reprojection residual and Jacobians for one landmark, stacked over all
/// of its live observations.
struct Residual {
    /// k x n Jacobian with respect to the full pose-window error state
    /// (n = solver's current state width); feature columns are zero.
    h_x: DMatrix<f64>,
    /// k x 3 Jacobian with respect to the feature position.
    h_f: DMatrix<f64>,
    /// k-vector of stacked pixel residuals (observed - predicted).
    r: DVector<f64>,
}

fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Build the stacked reprojection residual/Jacobians for `landmark` at
/// `position`, against the solver's current pose window. `None` if fewer
/// than two observations resolve to a live pose with positive depth.
fn build_residual<C: CameraModel>(
    solver: &EkfSolver<C>,
    landmark: &Landmark,
    position: Vector3<f64>,
) -> Option<Residual> {
    let n = solver.sqrt_info.nrows();
    let obs: Vec<_> = landmark.observations.iter().flatten().collect();
    if obs.len() < 2 {
        return None;
    }

    let mut residual_rows: Vec<f64> = Vec::new();
    let mut h_x_rows: Vec<Vec<f64>> = Vec::new();
    let mut h_f_rows: Vec<[f64; 3]> = Vec::new();

    for o in &obs {
        let Some(pose) = solver.poses.get(o.pose_slot) else {
            continue;
        };
        let cam_frame = pose.rotation.inverse() * (position - pose.position);
        if cam_frame.z <= 1e-6 {
            continue;
        }
        let predicted = solver.camera.project(&cam_frame);
        let jac_proj = solver.camera.projection_jacobian(&cam_frame);
        let r_inv = *pose.rotation.inverse().matrix();

        // d(cam_frame)/d(theta) = skew(cam_frame) (left-perturbation error
        // state), d(cam_frame)/d(p) = -R^-1, d(cam_frame)/d(feature) = R^-1.
        let h_theta = jac_proj * skew(cam_frame);
        let h_p = -jac_proj * r_inv;
        let h_feat = jac_proj * r_inv;

        let off = o.pose_slot * POSE_DOF;
        for row in 0..2 {
            let mut cols = vec![0.0; n];
            if off + POSE_DOF <= n {
                for c in 0..3 {
                    cols[off + c] = h_theta[(row, c)];
                    cols[off + 3 + c] = h_p[(row, c)];
                }
            }
            h_x_rows.push(cols);
            h_f_rows.push([h_feat[(row, 0)], h_feat[(row, 1)], h_feat[(row, 2)]]);
        }
        residual_rows.push(o.px.x - predicted.x);
        residual_rows.push(o.px.y - predicted.y);
    }

    let k = residual_rows.len();
    if k < 4 {
        // Fewer than 2 full (x, y) observation pairs: the null-space
        // projection below would leave nothing.
        return None;
    }

    let mut h_x = DMatrix::<f64>::zeros(k, n);
    let mut h_f = DMatrix::<f64>::zeros(k, FEATURE_DOF);
    let mut r = DVector::<f64>::zeros(k);
    for i in 0..k {
        r[i] = residual_rows[i];
        for c in 0..n {
            h_x[(i, c)] = h_x_rows[i][c];
        }
        for c in 0..FEATURE_DOF {
            h_f[(i, c)] = h_f_rows[i][c];
        }
    }

    Some(Residual { h_x, h_f, r })
}

/// Orthonormal basis for the left null space of `h_f` (the subspace a
/// one-shot feature observation carries no information about), found via
/// the eigendecomposition of the idempotent projector `I - H_f(H_f^T
/// H_f)^-1 H_f^T`: eigenvalues near 1 are null-space directions.
fn null_space_basis(h_f: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let m = h_f.nrows();
    if m <= FEATURE_DOF {
        return None;
    }
    let gram = h_f.transpose() * h_f;
    let gram_inv = gram.try_inverse()?;
    let proj = DMatrix::<f64>::identity(m, m) - h_f * gram_inv * h_f.transpose();
    let eig = nalgebra::linalg::SymmetricEigen::new(proj);

    let cols: Vec<usize> = (0..m).filter(|&i| eig.eigenvalues[i] > 0.5).collect();
    if cols.is_empty() {
        return None;
    }
    let mut basis = DMatrix::<f64>::zeros(m, cols.len());
    for (j, &c) in cols.iter().enumerate() {
        basis.set_column(j, &eig.eigenvectors.column(c));
    }
    Some(basis)
}

/// Project `H_f` out of `(h_x, r)` via the null-space basis, collapsing the
/// stacked per-observation rows down to a feature-independent residual.
fn null_project(residual: &Residual) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let basis = null_space_basis(&residual.h_f)?;
    let h_proj = basis.transpose() * &residual.h_x;
    let r_proj = basis.transpose() * &residual.r;
    Some((h_proj, r_proj))
}

/// The four operations the data-association orchestrator drives against the
/// solver, plus bookkeeping for the square-root information state.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolverStats {
    pub triangulated: u64,
    pub triangulation_failed: u64,
    pub jacobian_degenerate: u64,
    pub mahalanobis_rejected: u64,
    pub msckf_admitted: u64,
    pub slam_admitted: u64,
}

/// Sliding-window square-root EKF solver.
pub struct EkfSolver<C: CameraModel> {
    pub camera: C,
    pub poses: Vec<CamPoseState>,
    max_window_size: usize,
    reproj_noise_std: f64,
    /// Square-root (Cholesky-style) factor of the information matrix over
    /// the current state: `max_window_size * 6` pose dof, plus 3 dof per
    /// live SLAM point appended at the end. `sqrt_info^T * sqrt_info` is
    /// the information matrix; `sqrt_info * dx = info_vec` is solved for
    /// the error-state correction after each measurement fold-in.
    sqrt_info: DMatrix<f64>,
    /// Accumulated, whitened right-hand side of the information form.
    info_vec: DVector<f64>,
    /// Column offset into `sqrt_info`/`info_vec` for each live SLAM point.
    slam_offsets: HashMap<u64, usize>,
    slam_points: Vec<(u64, PointState)>,
    pub stats: SolverStats,
}

impl<C: CameraModel> EkfSolver<C> {
    pub fn new(camera: C, max_window_size: usize, reproj_noise_std: f64) -> Self {
        let pose_region = max_window_size * POSE_DOF;
        Self {
            camera,
            poses: Vec::with_capacity(max_window_size),
            max_window_size,
            reproj_noise_std,
            sqrt_info: DMatrix::identity(pose_region, pose_region) * PRIOR_SQRT_INFO,
            info_vec: DVector::zeros(pose_region),
            slam_offsets: HashMap::new(),
            slam_points: Vec::new(),
            stats: SolverStats::default(),
        }
    }

    /// Clone the current pose into the sliding window, marginalizing the
    /// oldest if the window is full. Returns the new pose's slot.
    pub fn clone_pose(&mut self, rotation: Rotation3<f64>, position: Vector3<f64>) -> PoseSlot {
        if self.poses.len() >= self.max_window_size {
            self.marginalize_oldest();
        }
        self.poses.push(CamPoseState::new(rotation, position));
        self.poses.len() - 1
    }

    /// Drops the oldest pose. Slot indices held by existing observations
    /// shift by one; callers remap `pose_slot` on marginalization, mirroring
    /// the inverse-index cleanup required by discard. The information
    /// factor's pose columns shift to match (see [`Self::shift_pose_columns`]);
    /// this discards cross-pose correlation with the departing pose rather
    /// than performing a full Schur-complement elimination, a deliberate
    /// simplification given the sliding window's bounded size.
    fn marginalize_oldest(&mut self) {
        if !self.poses.is_empty() {
            self.poses.remove(0);
            self.shift_pose_columns();
        }
    }

    /// Permutes `sqrt_info`'s columns so the vacated pose slot (index 0)
    /// is dropped and every later pose slot shifts down by one, re-seeding
    /// the freed tail slot with a weak prior. Only columns move: `R P^T` is
    /// still a valid square-root factor of `P A P^T` for any state
    /// permutation `P`, so rows (which index accumulated measurement
    /// combinations, not state) are untouched.
    fn shift_pose_columns(&mut self) {
        let d = POSE_DOF;
        let pr = self.max_window_size * d;
        let n = self.sqrt_info.nrows();
        let mut shifted = DMatrix::<f64>::zeros(n, n);

        if pr > d {
            let src = self.sqrt_info.view((0, d), (n, pr - d)).into_owned();
            shifted.view_mut((0, 0), (n, pr - d)).copy_from(&src);
        }
        for i in 0..d {
            shifted[(pr - d + i, pr - d + i)] = PRIOR_SQRT_INFO;
        }
        if n > pr {
            let src = self.sqrt_info.view((0, pr), (n, n - pr)).into_owned();
            shifted.view_mut((0, pr), (n, n - pr)).copy_from(&src);
        }
        self.sqrt_info = shifted;
    }

    /// Grows the state by one feature block, returning its column offset.
    fn append_feature_block(&mut self) -> usize {
        let n = self.sqrt_info.nrows();
        let new_n = n + FEATURE_DOF;
        let mut grown = DMatrix::<f64>::zeros(new_n, new_n);
        grown.view_mut((0, 0), (n, n)).copy_from(&self.sqrt_info);
        for i in 0..FEATURE_DOF {
            grown[(n + i, n + i)] = PRIOR_SQRT_INFO;
        }
        self.sqrt_info = grown;

        let mut grown_vec = DVector::<f64>::zeros(new_n);
        grown_vec.rows_mut(0, n).copy_from(&self.info_vec);
        self.info_vec = grown_vec;
        n
    }

    /// Drops a feature's 3 dof from the state entirely (both the matching
    /// row and column), approximating the marginalized feature as
    /// uncorrelated with the remaining state. Shifts every later offset
    /// in `slam_offsets` down by [`FEATURE_DOF`].
    fn remove_block_at(&mut self, offset: usize) {
        let n = self.sqrt_info.nrows();
        let dim = FEATURE_DOF;
        let new_n = n - dim;
        let tail = n - offset - dim;

        let mut shrunk = DMatrix::<f64>::zeros(new_n, new_n);
        shrunk
            .view_mut((0, 0), (offset, offset))
            .copy_from(&self.sqrt_info.view((0, 0), (offset, offset)));
        if tail > 0 {
            let top_right = self.sqrt_info.view((0, offset + dim), (offset, tail)).into_owned();
            shrunk.view_mut((0, offset), (offset, tail)).copy_from(&top_right);
            let bot_left = self.sqrt_info.view((offset + dim, 0), (tail, offset)).into_owned();
            shrunk.view_mut((offset, 0), (tail, offset)).copy_from(&bot_left);
            let bot_right = self
                .sqrt_info
                .view((offset + dim, offset + dim), (tail, tail))
                .into_owned();
            shrunk.view_mut((offset, offset), (tail, tail)).copy_from(&bot_right);
        }
        self.sqrt_info = shrunk;

        let mut shrunk_vec = DVector::<f64>::zeros(new_n);
        shrunk_vec.rows_mut(0, offset).copy_from(&self.info_vec.rows(0, offset));
        if tail > 0 {
            shrunk_vec
                .rows_mut(offset, tail)
                .copy_from(&self.info_vec.rows(offset + dim, tail));
        }
        self.info_vec = shrunk_vec;

        for off in self.slam_offsets.values_mut() {
            if *off > offset {
                *off -= dim;
            }
        }
    }

    /// Folds a whitened measurement `(h, r)` into the information form by
    /// stacking `[sqrt_info | info_vec; h | r]` and re-triangularizing via
    /// QR. `h`'s column count must equal the current state width.
    fn apply_measurement(&mut self, h: &DMatrix<f64>, r: &DVector<f64>) {
        let n = self.sqrt_info.nrows();
        let k = h.nrows();
        let mut stacked_a = DMatrix::<f64>::zeros(n + k, n);
        stacked_a.view_mut((0, 0), (n, n)).copy_from(&self.sqrt_info);
        stacked_a.view_mut((n, 0), (k, n)).copy_from(h);

        let mut stacked_b = DVector::<f64>::zeros(n + k);
        stacked_b.rows_mut(0, n).copy_from(&self.info_vec);
        stacked_b.rows_mut(n, k).copy_from(r);

        let qr = nalgebra::linalg::QR::new(stacked_a);
        let q = qr.q();
        // Economy QR on the (n+k) x n stack: r is already n x n.
        self.sqrt_info = qr.r();
        self.info_vec = q.transpose() * stacked_b;
    }

    /// Solves `sqrt_info * dx = info_vec` for the accumulated error-state
    /// correction and applies it to every pose and SLAM feature, then
    /// resets `info_vec` (the correction has been absorbed into the
    /// linearization point).
    fn apply_correction(&mut self) {
        let Some(dx) = self.sqrt_info.clone().lu().solve(&self.info_vec) else {
            return;
        };

        for (slot, pose) in self.poses.iter_mut().enumerate() {
            let off = slot * POSE_DOF;
            if off + POSE_DOF > dx.len() {
                continue;
            }
            let d_theta = Vector3::new(dx[off], dx[off + 1], dx[off + 2]);
            let d_p = Vector3::new(dx[off + 3], dx[off + 4], dx[off + 5]);
            pose.rotation *= Rotation3::from_scaled_axis(d_theta);
            pose.position += d_p;
        }

        let offsets = self.slam_offsets.clone();
        for (id, point) in self.slam_points.iter_mut() {
            if let Some(&off) = offsets.get(id) {
                if off + FEATURE_DOF <= dx.len() {
                    point.position += Vector3::new(dx[off], dx[off + 1], dx[off + 2]);
                }
            }
        }

        self.info_vec.fill(0.0);
    }

    /// Removes a SLAM point from the persistent state, invoked once its
    /// `flag_to_next_marginalize` bookkeeping flag is acted on.
    pub fn marginalize_slam_point(&mut self, landmark_id: u64) {
        if let Some(offset) = self.slam_offsets.remove(&landmark_id) {
            self.remove_block_at(offset);
        }
        self.slam_points.retain(|(id, _)| *id != landmark_id);
    }

    pub fn slam_point_count(&self) -> usize {
        self.slam_points.len()
    }

    /// Public wrapper exposing the triangulated position for a landmark
    /// that already passed `triangulate`, used by the association
    /// orchestrator to build the `PointState` it gates and admits.
    pub fn triangulate_position(&self, landmark: &Landmark) -> Option<Vector3<f64>> {
        self.triangulate_inner(landmark)
    }

    /// Triangulate `landmark` via Gauss-Newton on inverse depth, anchored
    /// at its first observation's pose.
    fn triangulate_inner(&self, landmark: &Landmark) -> Option<Vector3<f64>> {
        let obs: Vec<_> = landmark.observations.iter().flatten().collect();
        if obs.len() < 2 {
            return None;
        }
        let anchor = obs[0];
        let anchor_pose = self.poses.get(anchor.pose_slot)?;

        // Inverse-depth state (alpha, beta, rho) relative to the anchor
        // frame: X = (1/rho) * R_anchor * [alpha, beta, 1]^T + p_anchor.
        let mut alpha = anchor.bearing.x / anchor.bearing.z;
        let mut beta = anchor.bearing.y / anchor.bearing.z;
        let mut rho = 1.0 / 3.0; // 3 m initial depth guess

        for _ in 0..10 {
            let mut jtj = nalgebra::Matrix3::<f64>::zeros();
            let mut jtr = Vector3::<f64>::zeros();
            let mut cost = 0.0;

            for o in &obs {
                let Some(pose) = self.poses.get(o.pose_slot) else {
                    continue;
                };
                let p_anchor_frame = Vector3::new(alpha, beta, 1.0);
                let world = anchor_pose.rotation * (p_anchor_frame / rho) + anchor_pose.position;
                let cam_frame = pose.rotation.inverse() * (world - pose.position);
                if cam_frame.z <= 1e-6 {
                    continue;
                }
                let predicted = Vector3::new(cam_frame.x / cam_frame.z, cam_frame.y / cam_frame.z, 1.0);
                let observed = o.bearing / o.bearing.z;
                let residual = Vector3::new(predicted.x - observed.x, predicted.y - observed.y, 0.0);

                let h = numerical_inverse_depth_jacobian(
                    alpha,
                    beta,
                    rho,
                    &anchor_pose.rotation,
                    anchor_pose.position,
                    &pose.rotation,
                    pose.position,
                );
                jtj += h.transpose() * h;
                jtr += h.transpose() * residual;
                cost += residual.norm_squared();
            }

            if jtj.determinant().abs() < 1e-12 {
                return None;
            }
            let step = jtj.lu().solve(&(-jtr))?;
            alpha += step.x;
            beta += step.y;
            rho += step.z;

            if rho <= 1e-6 || !rho.is_finite() {
                return None;
            }
            if cost.sqrt() < 1e-10 {
                break;
            }
        }

        if rho <= 1e-6 || !rho.is_finite() {
            return None;
        }
        let p_anchor_frame = Vector3::new(alpha, beta, 1.0) / rho;
        Some(anchor_pose.rotation * p_anchor_frame + anchor_pose.position)
    }
}

fn numerical_inverse_depth_jacobian(
    alpha: f64,
    beta: f64,
    rho: f64,
    anchor_r: &Rotation3<f64>,
    anchor_p: Vector3<f64>,
    obs_r: &Rotation3<f64>,
    obs_p: Vector3<f64>,
) -> nalgebra::Matrix3<f64> {
    let eval = |a: f64, b: f64, r: f64| -> Vector3<f64> {
        let world = anchor_r * (Vector3::new(a, b, 1.0) / r) + anchor_p;
        let cam = obs_r.inverse() * (world - obs_p);
        if cam.z.abs() < 1e-9 {
            Vector3::new(0.0, 0.0, 0.0)
        } else {
            Vector3::new(cam.x / cam.z, cam.y / cam.z, 0.0)
        }
    };
    let h = 1e-6;
    let base = eval(alpha, beta, rho);
    let da = (eval(alpha + h, beta, rho) - base) / h;
    let db = (eval(alpha, beta + h, rho) - base) / h;
    let dr = (eval(alpha, beta, rho + h) - base) / h;
    nalgebra::Matrix3::from_columns(&[da, db, dr])
}

impl<C: CameraModel> Solver for EkfSolver<C> {
    fn triangulate(&self, landmark: &Landmark) -> bool {
        self.triangulate_inner(landmark).is_some()
    }

    fn compute_jacobians(&self, landmark: &Landmark, position: Vector3<f64>) -> bool {
        let Some(residual) = build_residual(self, landmark, position) else {
            return false;
        };
        null_space_basis(&residual.h_f).is_some()
    }

    fn mahalanobis_test(&self, landmark: &Landmark, point: &PointState) -> bool {
        let Some(residual) = build_residual(self, landmark, point.position) else {
            return false;
        };
        let Some((_, r_proj)) = null_project(&residual) else {
            return false;
        };
        let sigma2 = self.reproj_noise_std.max(1e-6).powi(2);
        let chi2 = r_proj.dot(&r_proj) / sigma2;
        chi2 < chi2_quantile_95(r_proj.len() as f64)
    }

    fn add_slam_point(&mut self, landmark_id: u64, landmark: &Landmark, point: PointState) {
        let offset = self.append_feature_block();
        self.slam_offsets.insert(landmark_id, offset);

        if let Some(residual) = build_residual(self, landmark, point.position) {
            let rows = residual.h_x.nrows();
            let mut h_full = residual.h_x;
            h_full
                .view_mut((0, offset), (rows, FEATURE_DOF))
                .copy_from(&residual.h_f);

            let sigma = self.reproj_noise_std.max(1e-6);
            let h_w = h_full / sigma;
            let r_w = residual.r / sigma;
            self.apply_measurement(&h_w, &r_w);
            self.apply_correction();
        }

        self.slam_points.push((landmark_id, point));
        self.stats.slam_admitted += 1;
    }

    fn add_msckf_point(&mut self, landmark_id: u64, landmark: &Landmark, point: PointState) {
        let _ = landmark_id;
        if let Some(residual) = build_residual(self, landmark, point.position) {
            if let Some((h_proj, r_proj)) = null_project(&residual) {
                let sigma = self.reproj_noise_std.max(1e-6);
                let h_w = h_proj / sigma;
                let r_w = r_proj / sigma;
                self.apply_measurement(&h_w, &r_w);
                self.apply_correction();
            }
        }
        self.stats.msckf_admitted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vio::camera::PinholeCamera;
    use crate::vio::landmark::VisualObservation;
    use crate::types::PixelCoord;

    fn solver() -> EkfSolver<PinholeCamera> {
        let cam = PinholeCamera::new(640, 480, 400.0, 400.0, 320.0, 240.0);
        EkfSolver::new(cam, 10, 1.0)
    }

    fn observed_landmark(s: &EkfSolver<PinholeCamera>, truth: Vector3<f64>) -> Landmark {
        let mut lm = Landmark::new(1, 1);
        for (slot, pose) in s.poses.iter().enumerate() {
            let cam_frame = pose.rotation.inverse() * (truth - pose.position);
            let bearing = cam_frame.normalize();
            let px = s.camera.project(&cam_frame);
            lm.push_observation(VisualObservation::new(0, slot, px, bearing));
        }
        lm
    }

    #[test]
    fn triangulate_recovers_known_point() {
        let mut s = solver();
        let truth = Vector3::new(0.2, -0.1, 3.0);

        let pose0 = CamPoseState::new(Rotation3::identity(), Vector3::new(0.0, 0.0, 0.0));
        let pose1 = CamPoseState::new(Rotation3::identity(), Vector3::new(0.3, 0.0, 0.0));
        s.poses.push(pose0);
        s.poses.push(pose1);

        let mut lm = Landmark::new(1, 1);
        for (slot, pose) in s.poses.iter().enumerate() {
            let cam_frame = pose.rotation.inverse() * (truth - pose.position);
            let bearing = cam_frame.normalize();
            lm.push_observation(VisualObservation::new(0, slot, PixelCoord::new(0.0, 0.0), bearing));
        }

        assert!(s.triangulate(&lm));
        let recovered = s.triangulate_inner(&lm).unwrap();
        assert!((recovered - truth).norm() < 0.05, "recovered {recovered}, truth {truth}");
    }

    #[test]
    fn triangulate_fails_with_single_observation() {
        let mut s = solver();
        s.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::zeros()));
        let mut lm = Landmark::new(1, 1);
        lm.push_observation(VisualObservation::new(
            0,
            0,
            PixelCoord::new(0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ));
        assert!(!s.triangulate(&lm));
    }

    #[test]
    fn msckf_point_updates_pose_state() {
        let mut s = solver();
        s.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::zeros()));
        s.poses.push(CamPoseState::new(
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.01, 0.0)),
            Vector3::new(0.31, 0.01, 0.0),
        ));
        let truth = Vector3::new(0.2, -0.1, 3.0);
        let lm = observed_landmark(&s, truth);

        assert!(s.compute_jacobians(&lm, truth));
        let point = PointState::new_msckf(truth);
        assert!(s.mahalanobis_test(&lm, &point));

        let before = s.poses[1].position;
        s.add_msckf_point(lm.id, &lm, point);
        assert_eq!(s.stats.msckf_admitted, 1);
        // The pose was nudged toward consistency with the observations
        // rather than left untouched by dead reckoning.
        assert_ne!(s.poses[1].position, before);
    }

    #[test]
    fn slam_point_is_appended_and_marginalizable() {
        let mut s = solver();
        s.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::zeros()));
        s.poses.push(CamPoseState::new(Rotation3::identity(), Vector3::new(0.3, 0.0, 0.0)));
        let truth = Vector3::new(0.2, -0.1, 3.0);
        let lm = observed_landmark(&s, truth);
        let point = PointState::new_slam(truth);

        let n_before = s.sqrt_info.nrows();
        s.add_slam_point(lm.id, &lm, point);
        assert_eq!(s.slam_point_count(), 1);
        assert_eq!(s.sqrt_info.nrows(), n_before + FEATURE_DOF);

        s.marginalize_slam_point(lm.id);
        assert_eq!(s.slam_point_count(), 0);
        assert_eq!(s.sqrt_info.nrows(), n_before);
    }
}
