pub mod linalg;

pub use linalg::*;

use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Nanosecond-resolution monotonic timestamp, as emitted by the sensor
/// drivers external to this crate.
pub type TimestampNs = i64;

/// Stable identifier for a landmark, indexing into the landmark slab.
pub type LandmarkId = u64;

/// Which physical camera an observation came from (0 = left/primary).
pub type CameraId = u32;

/// Index into the sliding window of cloned camera poses held by the solver.
pub type PoseSlot = usize;

/// A single pixel observation in an image, `(col, row)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: f64,
    pub y: f64,
}

impl PixelCoord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pose emitted once per processed frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseOutput {
    pub t_ns: TimestampNs,
    pub rotation: Rotation3<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

/// Tag distinguishing why a world point is being published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointCovarianceTag {
    /// A one-shot MSCKF point, consumed and retired this frame.
    Msckf,
    /// A persistent SLAM point, expected to recur in future frames.
    Slam,
}

/// World point emitted alongside a pose.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldPointOutput {
    pub landmark_id: u64,
    pub position: Vector3<f64>,
    pub tag: PointCovarianceTag,
}

/// A single camera frame pushed by the image producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    pub t_ns: TimestampNs,
    pub pixel_buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub camera_id: CameraId,
}
