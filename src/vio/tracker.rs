//! Feature tracker interface consumed by the frame orchestrator.
//!
//! The tracker itself (detection, matching, track maintenance) is external
//! to this crate; only the interface it must satisfy is fixed here.

use crate::types::{Image, LandmarkId};
use crate::vio::association::LandmarkSlab;

/// Reports which landmarks are currently live for a given image and pushes
/// fresh observations into the shared landmark slab.
pub trait Tracker {
    /// Process one image, updating `slab` in place, and return the ids of
    /// landmarks the tracker currently considers live (tracked this frame).
    fn track(&mut self, image: &Image, pose_slot: crate::types::PoseSlot, slab: &mut LandmarkSlab) -> Vec<LandmarkId>;
}

/// A tracker stub that reports no landmarks. Useful for exercising the
/// orchestrator's scheduling/lifecycle path without a real feature tracker
/// wired in.
#[derive(Default)]
pub struct NullTracker;

impl Tracker for NullTracker {
    fn track(&mut self, _image: &Image, _pose_slot: crate::types::PoseSlot, _slab: &mut LandmarkSlab) -> Vec<LandmarkId> {
        Vec::new()
    }
}
