//! Output traits the frame orchestrator calls into once per processed
//! frame, plus a logging-only default implementation for the demo binary.

use crate::types::{PoseOutput, WorldPointOutput};

/// Consumer of per-frame pose output. Implemented by callers; the core
/// never implements one itself beyond the logging default below.
pub trait FrameAdapter: Send {
    fn on_pose(&mut self, pose: &PoseOutput);
}

/// Consumer of per-frame world-point output.
pub trait WorldPointAdapter: Send {
    fn on_world_points(&mut self, points: &[WorldPointOutput]);
}

/// Logs each pose/point batch at `info!`, one line per frame. Used by the
/// demo binary when no downstream transport is wired up.
#[derive(Default)]
pub struct LoggingAdapter;

impl FrameAdapter for LoggingAdapter {
    fn on_pose(&mut self, pose: &PoseOutput) {
        log::info!(
            "pose t={} p=({:.3},{:.3},{:.3}) v=({:.3},{:.3},{:.3})",
            pose.t_ns,
            pose.position.x,
            pose.position.y,
            pose.position.z,
            pose.velocity.x,
            pose.velocity.y,
            pose.velocity.z,
        );
    }
}

impl WorldPointAdapter for LoggingAdapter {
    fn on_world_points(&mut self, points: &[WorldPointOutput]) {
        if !points.is_empty() {
            log::info!("world points: {} published this frame", points.len());
        }
    }
}
