//! 4x4 -> 2x2 coarsening grid selector enforcing spatial coverage across
//! the image when choosing landmarks to update.

use crate::types::{LandmarkId, PixelCoord};
use crate::vio::landmark::Landmark;

/// 4x4 bin index -> 2x2 quadrant index, row-major.
const BIN_TO_QUADRANT: [usize; 16] = [0, 0, 1, 1, 0, 0, 1, 1, 2, 2, 3, 3, 2, 2, 3, 3];

/// A landmark entry queued for grid selection, carrying just what the
/// comparator and bin assignment need.
#[derive(Clone, Copy, Debug)]
pub struct GridCandidate {
    pub id: LandmarkId,
    pub px: PixelCoord,
    pub ray_angle: f64,
    pub alive: bool,
}

impl GridCandidate {
    pub fn from_landmark(lm: &Landmark) -> Option<Self> {
        let px = lm.last_obs()?.px;
        Some(Self {
            id: lm.id,
            px,
            ray_angle: lm.ray_angle(),
            alive: !lm.flag_dead_all,
        })
    }
}

fn comparator(a: &GridCandidate, b: &GridCandidate) -> std::cmp::Ordering {
    b.ray_angle
        .partial_cmp(&a.ray_angle)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.alive.cmp(&a.alive))
}

/// Result of grid selection: per-quadrant priority queues (sorted, back of
/// each vec = next to pop) and the candidates dropped at the coarsening
/// step.
pub struct GridSelection {
    pub quadrants: [Vec<GridCandidate>; 4],
    pub dropped: Vec<GridCandidate>,
}

/// 4x4 bin assignment followed by top-2-per-bin coarsening into 2x2
/// quadrants. `width`/`height` are the image dimensions used to
/// compute bin boundaries.
pub fn select(candidates: Vec<GridCandidate>, width: u32, height: u32) -> GridSelection {
    let step_x = width as f64 / 4.0;
    let step_y = height as f64 / 4.0;

    let mut bins: [Vec<GridCandidate>; 16] = Default::default();
    for c in candidates {
        let bin = bin_index(c.px, step_x, step_y);
        bins[bin].push(c);
    }

    let mut quadrants: [Vec<GridCandidate>; 4] = Default::default();
    let mut dropped = Vec::new();

    for (bin_idx, mut bin) in bins.into_iter().enumerate() {
        bin.sort_by(comparator);
        let quadrant = BIN_TO_QUADRANT[bin_idx];
        for (rank, cand) in bin.into_iter().enumerate() {
            if rank < 2 {
                quadrants[quadrant].push(cand);
            } else {
                dropped.push(cand);
            }
        }
    }

    for q in quadrants.iter_mut() {
        q.sort_by(comparator);
        // Pop from the back for priority order (highest priority first).
        q.reverse();
    }

    GridSelection { quadrants, dropped }
}

fn bin_index(px: PixelCoord, step_x: f64, step_y: f64) -> usize {
    let col = ((px.x / step_x).floor() as i64).clamp(0, 3) as usize;
    let row = ((px.y / step_y).floor() as i64).clamp(0, 3) as usize;
    row * 4 + col
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, x: f64, y: f64, ray_angle: f64) -> GridCandidate {
        GridCandidate {
            id,
            px: PixelCoord::new(x, y),
            ray_angle,
            alive: true,
        }
    }

    #[test]
    fn uniform_grid_keeps_top_two_per_bin_one_per_quadrant_at_budget() {
        // 100 landmarks on a uniform 10x10 grid over a 640x480 image, equal
        // ray_angle (ties broken by insertion order via a stable sort).
        let width = 640u32;
        let height = 480u32;
        let mut candidates = Vec::new();
        let mut id = 0u64;
        for gy in 0..10 {
            for gx in 0..10 {
                let x = (gx as f64 + 0.5) * width as f64 / 10.0;
                let y = (gy as f64 + 0.5) * height as f64 / 10.0;
                candidates.push(candidate(id, x, y, 1.0));
                id += 1;
            }
        }

        let selection = select(candidates, width, height);
        let total_selected: usize = selection.quadrants.iter().map(|q| q.len()).sum();
        // Each of 16 4x4 bins contributes at most 2 -> at most 32 total,
        // and at least 2 per bin since ray_angle is uniform (ties keep the
        // first two encountered).
        assert!(total_selected <= 32);
        assert!(total_selected >= 16);

        // At budget=4 (one per quadrant), each quadrant must be able to
        // supply at least one candidate.
        for q in &selection.quadrants {
            assert!(!q.is_empty());
        }
    }

    #[test]
    fn permutation_invariant_admitted_set() {
        let width = 640u32;
        let height = 480u32;
        let mut candidates = Vec::new();
        for i in 0..40u64 {
            let x = (i % 8) as f64 * 80.0 + 10.0;
            let y = (i / 8) as f64 * 100.0 + 10.0;
            candidates.push(candidate(i, x, y, (i as f64) * 0.01));
        }

        let mut shuffled = candidates.clone();
        shuffled.reverse();

        let a = select(candidates, width, height);
        let b = select(shuffled, width, height);

        let mut ids_a: Vec<u64> = a.quadrants.iter().flatten().map(|c| c.id).collect();
        let mut ids_b: Vec<u64> = b.quadrants.iter().flatten().map(|c| c.id).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn bin_index_clamps_at_image_edge() {
        assert_eq!(bin_index(PixelCoord::new(639.0, 479.0), 160.0, 120.0), 15);
        assert_eq!(bin_index(PixelCoord::new(0.0, 0.0), 160.0, 120.0), 0);
    }
}
