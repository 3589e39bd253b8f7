//! Per-landmark state: observation history, liveness bookkeeping, and the
//! optional `PointState` once a landmark is admitted into the filter.

use nalgebra::Vector3;

use crate::types::{CameraId, LandmarkId, PixelCoord, PoseSlot};

/// A single camera observation of a landmark, linked to the pose slot it
/// was taken from.
#[derive(Clone, Copy, Debug)]
pub struct VisualObservation {
    pub camera_id: CameraId,
    pub pose_slot: PoseSlot,
    pub px: PixelCoord,
    pub bearing: Vector3<f64>,
    /// Filled by the solver's `Reproject` step once a position estimate
    /// exists; `None` until then.
    pub px_reprj: Option<PixelCoord>,
}

impl VisualObservation {
    pub fn new(camera_id: CameraId, pose_slot: PoseSlot, px: PixelCoord, bearing: Vector3<f64>) -> Self {
        Self {
            camera_id,
            pose_slot,
            px,
            bearing,
            px_reprj: None,
        }
    }
}

/// State attached to a landmark once it has been promoted into the filter,
/// either as a one-shot MSCKF observation or a persistent SLAM point.
#[derive(Clone, Copy, Debug)]
pub struct PointState {
    pub position: Vector3<f64>,
    pub flag_slam_point: bool,
    pub flag_to_next_marginalize: bool,
}

impl PointState {
    pub fn new_msckf(position: Vector3<f64>) -> Self {
        Self {
            position,
            flag_slam_point: false,
            flag_to_next_marginalize: false,
        }
    }

    pub fn new_slam(position: Vector3<f64>) -> Self {
        Self {
            position,
            flag_slam_point: true,
            flag_to_next_marginalize: false,
        }
    }
}

/// Minimum obs count a dead-but-tracked-long-enough landmark needs to
/// qualify for filter consumption.
pub const MIN_OBS_ALIVE: usize = 6;
pub const MIN_OBS_VALID: usize = 4;
pub const MIN_OBS_TRACKED: usize = 6;
pub const MAX_BUFFER_OBS: usize = 5;

/// A tracked landmark: per-camera observation history and liveness state.
#[derive(Clone, Debug)]
pub struct Landmark {
    pub id: LandmarkId,
    /// Observation lists, one per camera (index 0 = left/primary).
    pub observations: Vec<Vec<VisualObservation>>,
    pub flag_dead: Vec<bool>,
    pub flag_dead_all: bool,
    pub valid_obs_num: usize,
    pub num_obs_tracked: usize,
    pub slam_candidate: bool,
    pub stereo_parallax: f64,
    pub point: Option<PointState>,
    /// Frame id at which this landmark was last dropped off a camera's
    /// observation list, set by RANSAC rejection.
    pub flag_dead_frame_id: Option<u64>,
}

impl Landmark {
    pub fn new(id: LandmarkId, num_cameras: usize) -> Self {
        Self {
            id,
            observations: vec![Vec::new(); num_cameras],
            flag_dead: vec![false; num_cameras],
            flag_dead_all: false,
            valid_obs_num: 0,
            num_obs_tracked: 0,
            slam_candidate: false,
            stereo_parallax: 0.0,
            point: None,
            flag_dead_frame_id: None,
        }
    }

    pub fn push_observation(&mut self, obs: VisualObservation) {
        let cam = obs.camera_id as usize;
        self.observations[cam].push(obs);
        self.valid_obs_num += 1;
        self.num_obs_tracked += 1;
    }

    /// Most recent observation across any camera, preferring the primary
    /// (camera 0), falling back to the next camera with one — used by the
    /// grid selector's bin assignment.
    pub fn last_obs(&self) -> Option<&VisualObservation> {
        self.observations
            .iter()
            .find_map(|list| list.last())
            .or_else(|| self.observations.iter().rev().find_map(|l| l.last()))
    }

    /// Second-most-recent observation on the same camera as `last_obs`, used
    /// as the `ray_angle` baseline.
    pub fn last_last_obs(&self) -> Option<&VisualObservation> {
        self.observations
            .iter()
            .find(|list| !list.is_empty())
            .and_then(|list| list.iter().rev().nth(1))
    }

    /// Parallax proxy: angle in radians between the bearing rays of the
    /// first and most recent observation on the primary camera track.
    pub fn ray_angle(&self) -> f64 {
        let track = self
            .observations
            .iter()
            .find(|list| list.len() >= 2)
            .map(|list| list.as_slice());
        match track {
            Some(list) => {
                let first = list.first().unwrap().bearing;
                let last = list.last().unwrap().bearing;
                let cos_angle = (first.dot(&last) / (first.norm() * last.norm())).clamp(-1.0, 1.0);
                cos_angle.acos()
            }
            None => 0.0,
        }
    }

    /// Drop the latest observation on `camera_id`, marking the frame it was
    /// dropped at, by RANSAC rejection. Marks the camera dead
    /// if that was its only observation.
    pub fn pop_last_observation(&mut self, camera_id: CameraId, frame_id: u64) {
        let cam = camera_id as usize;
        if self.observations[cam].pop().is_some() {
            self.flag_dead_frame_id = Some(frame_id);
            if self.observations[cam].is_empty() {
                self.flag_dead[cam] = true;
                self.flag_dead_all = self.flag_dead.iter().all(|&d| d);
            }
        }
    }

    /// Should this (non-SLAM) landmark be
    /// promoted to the dead set this frame?
    pub fn qualifies_for_dead_set(&self) -> bool {
        if self.flag_dead_all {
            self.num_obs_tracked >= MIN_OBS_TRACKED && self.valid_obs_num >= MIN_OBS_VALID
        } else {
            self.num_obs_tracked > MIN_OBS_TRACKED && self.valid_obs_num >= MIN_OBS_ALIVE
        }
    }

    /// A landmark deferred from a previous frame's selection
    /// joins the dead set only if it accumulated enough valid observations
    /// while buffered.
    pub fn qualifies_after_buffering(&self) -> bool {
        self.valid_obs_num > MAX_BUFFER_OBS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(bearing: Vector3<f64>) -> VisualObservation {
        VisualObservation::new(0, 0, PixelCoord::new(0.0, 0.0), bearing)
    }

    #[test]
    fn ray_angle_is_zero_with_single_observation() {
        let mut lm = Landmark::new(1, 1);
        lm.push_observation(obs(Vector3::new(0.0, 0.0, 1.0)));
        assert_eq!(lm.ray_angle(), 0.0);
    }

    #[test]
    fn ray_angle_grows_with_parallax() {
        let mut lm = Landmark::new(1, 1);
        lm.push_observation(obs(Vector3::new(0.0, 0.0, 1.0)));
        lm.push_observation(obs(Vector3::new(0.1, 0.0, 1.0).normalize()));
        assert!(lm.ray_angle() > 0.0);
    }

    #[test]
    fn pop_last_observation_marks_camera_dead_when_empty() {
        let mut lm = Landmark::new(1, 2);
        lm.push_observation(obs(Vector3::new(0.0, 0.0, 1.0)));
        lm.pop_last_observation(0, 42);
        assert!(lm.flag_dead[0]);
        assert!(!lm.flag_dead_all); // camera 1 never had an observation but isn't flagged by pop
        assert_eq!(lm.flag_dead_frame_id, Some(42));
    }

    #[test]
    fn qualifies_for_dead_set_thresholds() {
        let mut lm = Landmark::new(1, 1);
        for _ in 0..7 {
            lm.push_observation(obs(Vector3::new(0.0, 0.0, 1.0)));
        }
        assert!(lm.qualifies_for_dead_set());

        lm.flag_dead_all = true;
        lm.valid_obs_num = 3;
        assert!(!lm.qualifies_for_dead_set());
    }
}
