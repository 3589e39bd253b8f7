//! Data-association orchestrator: classifies tracked landmarks, enforces
//! spatial coverage via the grid selector, triangulates/gates candidates,
//! and splits survivors into SLAM vs MSCKF point admissions.

use std::collections::HashMap;

use crate::config::VioConfig;
use crate::types::LandmarkId;
use crate::vio::camera::CameraModel;
use crate::vio::grid::{self, GridCandidate};
use crate::vio::landmark::{Landmark, PointState};
use crate::vio::solver::Solver;

/// Max SLAM points retained in the filter state at any time.
pub const MAX_SLAM_POINTS: usize = 16;

/// Central slab of landmarks, indexed by id. Per-subsystem handles are
/// copyable `LandmarkId`s rather than shared-ownership pointers.
#[derive(Default)]
pub struct LandmarkSlab {
    landmarks: HashMap<LandmarkId, Landmark>,
    next_id: LandmarkId,
}

impl LandmarkSlab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, num_cameras: usize) -> LandmarkId {
        let id = self.next_id;
        self.next_id += 1;
        self.landmarks.insert(id, Landmark::new(id, num_cameras));
        id
    }

    pub fn get(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn get_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    /// Discard a landmark, unlinking it from every pose it referenced
    /// (resource bounds: after discard, no pose references any of its
    /// observations).
    pub fn discard<C: CameraModel>(&mut self, id: LandmarkId, solver: &mut crate::vio::solver::EkfSolver<C>) {
        if let Some(lm) = self.landmarks.remove(&id) {
            for list in &lm.observations {
                for obs in list {
                    if let Some(pose) = solver.poses.get_mut(obs.pose_slot) {
                        pose.ref_count = pose.ref_count.saturating_sub(1);
                    }
                }
            }
        }
    }
}

/// Per-frame observability counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssociationStats {
    pub triangulated: u64,
    pub gated_out: u64,
    pub admitted_msckf: u64,
    pub admitted_slam: u64,
    pub stereo_fallback_admitted: u64,
}

/// Driver for the per-frame classify/select/budget/update sequence.
pub struct DataAssociation {
    next_frame_buffer: Vec<LandmarkId>,
    /// SLAM points currently attributed to each spatial quadrant, kept as
    /// membership lists (rather than bare counts) so the over-budget branch
    /// below can name which point to mark for marginalization.
    slam_quadrant_members: [Vec<LandmarkId>; 4],
}

impl DataAssociation {
    pub fn new() -> Self {
        Self {
            next_frame_buffer: Vec::new(),
            slam_quadrant_members: Default::default(),
        }
    }

    /// Run one frame's association pass against `tracked` (landmarks the
    /// tracker currently reports as live) plus any landmarks already known
    /// to be SLAM points, dispatching triangulated/gated candidates into
    /// `solver`.
    pub fn process_frame<C: CameraModel>(
        &mut self,
        frame_id: u64,
        tracked: &[LandmarkId],
        slab: &mut LandmarkSlab,
        solver: &mut crate::vio::solver::EkfSolver<C>,
        config: &VioConfig,
    ) -> AssociationStats {
        let mut stats = AssociationStats::default();

        // Step 1: absorb buffered points from a previous frame.
        let buffered = std::mem::take(&mut self.next_frame_buffer);
        let mut dead_set: Vec<LandmarkId> = Vec::new();
        for id in buffered {
            if let Some(lm) = slab.get(id) {
                if lm.qualifies_after_buffering() {
                    dead_set.push(id);
                }
                // else: released, simply dropped from bookkeeping here;
                // the tracker owns actual storage lifetime.
            }
        }

        // Step 2: classify tracked landmarks.
        for &id in tracked {
            let Some(lm) = slab.get(id) else { continue };
            if lm.point.as_ref().is_some_and(|p| p.flag_slam_point) {
                // A SLAM point marked last frame by the over-budget branch
                // in step 5 below is retired from the persistent state now,
                // before this frame's admissions might want its slot back.
                if lm.point.as_ref().is_some_and(|p| p.flag_to_next_marginalize) {
                    solver.marginalize_slam_point(id);
                    self.slam_quadrant_members.iter_mut().for_each(|q| q.retain(|&m| m != id));
                    if let Some(lm) = slab.get_mut(id) {
                        lm.point = None;
                    }
                    continue;
                }
                continue; // SLAM points are handled separately, stay live.
            }
            if lm.qualifies_for_dead_set() {
                dead_set.push(id);
            }
        }

        // Step 3: grid selection over the dead set.
        let candidates: Vec<GridCandidate> = dead_set
            .iter()
            .filter_map(|&id| slab.get(id).and_then(GridCandidate::from_landmark))
            .collect();
        let selection = grid::select(candidates, solver.camera.width(), solver.camera.height());

        for dropped in &selection.dropped {
            if let Some(lm) = slab.get(dropped.id) {
                if lm.flag_dead_all {
                    self.next_frame_buffer.push(dropped.id);
                }
            }
        }

        // Step 4: MSCKF point budget, split into 4 equal quarters.
        let n_slam = solver.slam_point_count();
        let total_budget = config.msckf_budget(n_slam).max(0) as usize;
        let mut quadrant_budget = [total_budget / 4; 4];

        // Step 5: SLAM bookkeeping — deficits toward MAX_SLAM_POINTS,
        // assigned to the quadrant currently holding the fewest; once the
        // cap is reached, the 3rd point in whichever quadrant is currently
        // over-full (more than its fair share) is marked for
        // marginalization on the next frame's classification pass instead.
        let mut slam_slots = [0usize; 4];
        if n_slam < MAX_SLAM_POINTS {
            let mut remaining = MAX_SLAM_POINTS - n_slam;
            while remaining > 0 {
                let min_quadrant = (0..4)
                    .min_by_key(|&q| self.slam_quadrant_members[q].len() + slam_slots[q])
                    .unwrap();
                slam_slots[min_quadrant] += 1;
                remaining -= 1;
            }
        } else {
            let fair_share = MAX_SLAM_POINTS / 4;
            for q in 0..4 {
                if self.slam_quadrant_members[q].len() > fair_share {
                    if let Some(&third) = self.slam_quadrant_members[q].get(2) {
                        if let Some(lm) = slab.get_mut(third) {
                            if let Some(point) = lm.point.as_mut() {
                                point.flag_to_next_marginalize = true;
                            }
                        }
                    }
                }
            }
        }

        let mut queues = selection.quadrants;

        // Step 6: selection loop, pop back (highest priority) of each
        // quadrant while budget remains.
        self.run_selection_pass(
            &mut queues,
            &mut quadrant_budget,
            &mut slam_slots,
            slab,
            solver,
            &mut stats,
            &mut dead_set,
        );

        // Step 7: budget reflow — redistribute leftover among exhausted
        // quadrants and repeat once.
        let leftover: usize = quadrant_budget.iter().sum();
        if leftover > 0 {
            let exhausted: Vec<usize> = (0..4).filter(|&q| queues[q].is_empty()).collect();
            if !exhausted.is_empty() {
                let share = leftover / exhausted.len().max(1);
                for &q in &exhausted {
                    quadrant_budget[q] += share;
                }
            }
            self.run_selection_pass(
                &mut queues,
                &mut quadrant_budget,
                &mut slam_slots,
                slab,
                solver,
                &mut stats,
                &mut dead_set,
            );
        }

        // Step 8: stereo fallback if nothing admitted this frame.
        if stats.admitted_msckf + stats.admitted_slam == 0 && solver.camera.is_stereo() {
            stats.stereo_fallback_admitted = self.stereo_fallback(&dead_set, slab, solver, config);
        }

        stats
    }

    #[allow(clippy::too_many_arguments)]
    fn run_selection_pass<C: CameraModel>(
        &mut self,
        queues: &mut [Vec<GridCandidate>; 4],
        quadrant_budget: &mut [usize; 4],
        slam_slots: &mut [usize; 4],
        slab: &mut LandmarkSlab,
        solver: &mut crate::vio::solver::EkfSolver<C>,
        stats: &mut AssociationStats,
        dead_set: &mut Vec<LandmarkId>,
    ) {
        for q in 0..4 {
            while quadrant_budget[q] > 0 {
                let Some(candidate) = queues[q].pop() else { break };
                quadrant_budget[q] -= 1;

                let Some(lm) = slab.get(candidate.id) else { continue };
                if !solver.triangulate(lm) {
                    continue;
                }
                stats.triangulated += 1;

                let Some(position) = candidate_position(lm, solver) else { continue };
                if !solver.compute_jacobians(lm, position) {
                    continue;
                }

                let point = PointState::new_msckf(position);
                if !solver.mahalanobis_test(lm, &point) {
                    stats.gated_out += 1;
                    continue;
                }

                let dead_all = slab.get(candidate.id).map(|l| l.flag_dead_all).unwrap_or(false);
                let slam_candidate = slab.get(candidate.id).map(|l| l.slam_candidate).unwrap_or(false);

                if !dead_all && slam_candidate && slam_slots[q] > 0 {
                    slam_slots[q] -= 1;
                    let slam_point = PointState::new_slam(position);
                    if let Some(lm) = slab.get(candidate.id) {
                        solver.add_slam_point(candidate.id, lm, slam_point);
                    }
                    if let Some(lm) = slab.get_mut(candidate.id) {
                        lm.point = Some(slam_point);
                    }
                    self.slam_quadrant_members[q].push(candidate.id);
                    stats.admitted_slam += 1;
                } else {
                    if let Some(lm) = slab.get(candidate.id) {
                        solver.add_msckf_point(candidate.id, lm, point);
                    }
                    // One-shot: the fold-in above is the landmark's only
                    // contribution to the filter, so its state is released.
                    slab.discard(candidate.id, solver);
                    stats.admitted_msckf += 1;
                    dead_set.retain(|&id| id != candidate.id);
                }
            }
        }
    }

    fn stereo_fallback<C: CameraModel>(
        &mut self,
        dead_set: &[LandmarkId],
        slab: &mut LandmarkSlab,
        solver: &mut crate::vio::solver::EkfSolver<C>,
        config: &VioConfig,
    ) -> u64 {
        let mut bins: Vec<Vec<LandmarkId>> = vec![Vec::new(); 16];
        for &id in dead_set {
            let Some(lm) = slab.get(id) else { continue };
            // Left-camera pixel with right-camera fallback, preserved
            // as-is: an acknowledged improvement opportunity upstream,
            // not addressed here.
            let px = lm
                .observations
                .first()
                .and_then(|l| l.last())
                .or_else(|| lm.observations.get(1).and_then(|l| l.last()))
                .map(|o| o.px);
            let Some(px) = px else { continue };
            let step_x = solver.camera.width() as f64 / 4.0;
            let step_y = solver.camera.height() as f64 / 4.0;
            let col = ((px.x / step_x).floor() as i64).clamp(0, 3) as usize;
            let row = ((px.y / step_y).floor() as i64).clamp(0, 3) as usize;
            bins[row * 4 + col].push(id);
        }

        for bin in &mut bins {
            bin.sort_by(|&a, &b| {
                let pa = slab.get(a).map(|l| l.stereo_parallax).unwrap_or(0.0);
                let pb = slab.get(b).map(|l| l.stereo_parallax).unwrap_or(0.0);
                pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let mut bin_order: Vec<usize> = (0..16).collect();
        bin_order.sort_by_key(|&b| bins[b].len());

        let mut admitted = 0u64;
        let mut remaining_bins = bin_order.len();
        let mut budget = config.max_point_size;
        for &b in &bin_order {
            if remaining_bins == 0 || budget == 0 {
                break;
            }
            let share = (budget / remaining_bins).max(1);
            let mut taken = 0;
            for &id in &bins[b] {
                if taken >= share || budget == 0 {
                    break;
                }
                let Some(lm) = slab.get(id) else { continue };
                let mut just_admitted = false;
                if solver.triangulate(lm) {
                    if let Some(position) = candidate_position(lm, solver) {
                        if solver.compute_jacobians(lm, position) {
                            solver.add_msckf_point(id, lm, PointState::new_msckf(position));
                            just_admitted = true;
                        }
                    }
                }
                if just_admitted {
                    slab.discard(id, solver);
                    admitted += 1;
                    taken += 1;
                    budget -= 1;
                }
            }
            remaining_bins -= 1;
        }
        admitted
    }
}

impl Default for DataAssociation {
    fn default() -> Self {
        Self::new()
    }
}

fn candidate_position<C: CameraModel>(
    lm: &Landmark,
    solver: &crate::vio::solver::EkfSolver<C>,
) -> Option<nalgebra::Vector3<f64>> {
    solver.triangulate_position(lm)
}
