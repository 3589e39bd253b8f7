//! Frame orchestrator: owns the image queue and the single VIO worker
//! thread, sequencing preintegration, tracking, data association and the
//! solver update once per incoming image.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nalgebra::{Rotation3, Vector3};

use crate::config::VioConfig;
use crate::error::{Result, VioError};
use crate::imu::{imu_noise_covariance, preintegrate, InertialRingBuffer, InertialSample};
use crate::types::{Image, PointCovarianceTag, PoseOutput, TimestampNs, WorldPointOutput};
use crate::vio::adapter::{FrameAdapter, WorldPointAdapter};
use crate::vio::association::{AssociationStats, DataAssociation, LandmarkSlab};
use crate::vio::camera::CameraModel;
use crate::vio::ransac::{two_point_ransac, RansacParams};
use crate::vio::solver::{EkfSolver, Solver};
use crate::vio::tracker::Tracker;

const IMU_WAIT_RETRY_MS: u64 = 10;
const IMU_WAIT_MAX_RETRIES: u32 = 20;
/// Earth gravity, subtracted from the world-frame velocity/position
/// integration below since preintegration itself integrates raw specific
/// force only (see `imu::preintegration`'s free-fall scenario).
const GRAVITY: f64 = 9.81;

/// Per-run observability counters, logged at `debug!` every frame and
/// `info!` every 100 frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub frames_processed: u64,
    pub frame_drops: u64,
    pub triangulated: u64,
    pub gated_out: u64,
    pub admitted_msckf: u64,
    pub admitted_slam: u64,
    pub stereo_fallback_admitted: u64,
}

impl Stats {
    fn accumulate(&mut self, assoc: &crate::vio::association::AssociationStats) {
        self.triangulated += assoc.triangulated;
        self.gated_out += assoc.gated_out;
        self.admitted_msckf += assoc.admitted_msckf;
        self.admitted_slam += assoc.admitted_slam;
        self.stereo_fallback_admitted += assoc.stereo_fallback_admitted;
    }

    fn log(&self, frame_id: u64) {
        log::debug!(
            "frame {frame_id}: triangulated={} gated_out={} msckf={} slam={} stereo_fallback={}",
            self.triangulated,
            self.gated_out,
            self.admitted_msckf,
            self.admitted_slam,
            self.stereo_fallback_admitted,
        );
        if self.frames_processed % 100 == 0 {
            log::info!(
                "{} frames processed, {} drops, {} triangulated, {} admitted (msckf={} slam={})",
                self.frames_processed,
                self.frame_drops,
                self.triangulated,
                self.admitted_msckf + self.admitted_slam,
                self.admitted_msckf,
                self.admitted_slam,
            );
        }
    }
}

/// Wait for IMU samples to catch up to `t1`, retrying with a bounded sleep.
/// In serial-run mode the call fails on the first gap instead of sleeping,
/// matching the deterministic single-thread interleave the caller expects.
fn wait_and_preintegrate(
    buffer: &Mutex<InertialRingBuffer>,
    t0: TimestampNs,
    t1: TimestampNs,
    frame_period_ns: i64,
    noise_cov: &crate::types::linalg::PreintNoiseCov,
    serial_run: bool,
    cancel: &AtomicBool,
) -> Result<crate::imu::InertialDelta> {
    let mut retries = 0u32;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(VioError::Cancelled);
        }

        let result = {
            let buf = buffer.lock().expect("imu buffer mutex poisoned");
            preintegrate(&buf, t0, t1, frame_period_ns, noise_cov)
        };

        match result {
            Ok(delta) => return Ok(delta),
            Err(VioError::ImuGap { t1: gap_t1, newest, .. }) => {
                if serial_run {
                    log::error!(
                        "IMU gap at t1={gap_t1} (newest={newest}), serial mode: failing immediately"
                    );
                    return Err(VioError::ImuGap {
                        t1: gap_t1,
                        newest,
                        retries,
                    });
                }
                retries += 1;
                if retries > IMU_WAIT_MAX_RETRIES {
                    log::error!(
                        "IMU gap at t1={gap_t1} (newest={newest}) persisted after {retries} retries, giving up"
                    );
                    return Err(VioError::ImuGap {
                        t1: gap_t1,
                        newest,
                        retries,
                    });
                }
                thread::sleep(Duration::from_millis(IMU_WAIT_RETRY_MS));
            }
            Err(other) => {
                log::error!("preintegration failed fatally: {other}");
                return Err(other);
            }
        }
    }
}

/// Producer-facing handle: push IMU/image data in, and shut the worker down
/// cleanly. Cloning is cheap; every clone shares the same buffer, queue and
/// cancellation flag.
#[derive(Clone)]
pub struct VioHandle {
    imu_buffer: Arc<Mutex<InertialRingBuffer>>,
    image_tx: crossbeam::channel::Sender<Image>,
    cancel: Arc<AtomicBool>,
    ack_rx: crossbeam::channel::Receiver<()>,
}

impl VioHandle {
    /// Single-producer call: push a new inertial sample.
    pub fn push_imu(&self, sample: InertialSample) {
        self.imu_buffer
            .lock()
            .expect("imu buffer mutex poisoned")
            .push(sample);
    }

    /// Push a new image onto the worker's queue. Blocks if the queue is
    /// full (bounded channel), providing natural backpressure.
    pub fn push_image(&self, image: Image) -> Result<()> {
        self.image_tx
            .send(image)
            .map_err(|_| VioError::Cancelled)
    }

    /// In serial-run mode, block until the worker has signalled that it
    /// finished the frame just pushed. A free-running producer never calls
    /// this.
    pub fn wait_for_frame_ack(&self) {
        let _ = self.ack_rx.recv();
    }

    /// Request shutdown; the worker drains its queue and exits.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Owns the image queue and the VIO worker thread.
pub struct FrameOrchestrator {
    handle: VioHandle,
    worker: Option<thread::JoinHandle<Stats>>,
}

impl FrameOrchestrator {
    /// Spawn the worker thread. `imu_capacity` sizes the ring buffer;
    /// `image_queue_capacity` bounds the image channel (backpressure on
    /// overflow per the configured policy).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<C, T, F, W>(
        config: VioConfig,
        camera: C,
        mut tracker: T,
        mut frame_adapter: F,
        mut point_adapter: W,
        imu_capacity: usize,
        image_queue_capacity: usize,
    ) -> Self
    where
        C: CameraModel + Send + 'static,
        T: Tracker + Send + 'static,
        F: FrameAdapter + 'static,
        W: WorldPointAdapter + 'static,
    {
        let imu_buffer = Arc::new(Mutex::new(InertialRingBuffer::new(imu_capacity)));
        let (image_tx, image_rx) = crossbeam::channel::bounded::<Image>(image_queue_capacity);
        let (ack_tx, ack_rx) = crossbeam::channel::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_buffer = Arc::clone(&imu_buffer);
        let worker_cancel = Arc::clone(&cancel);

        let worker = thread::Builder::new()
            .name("vio-worker".into())
            .spawn(move || {
                worker_loop(
                    config,
                    camera,
                    &mut tracker,
                    &mut frame_adapter,
                    &mut point_adapter,
                    worker_buffer,
                    image_rx,
                    ack_tx,
                    worker_cancel,
                )
            })
            .expect("failed to spawn vio worker thread");

        Self {
            handle: VioHandle {
                imu_buffer,
                image_tx,
                cancel,
                ack_rx,
            },
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> VioHandle {
        self.handle.clone()
    }

    /// Signal shutdown and join the worker, returning its final counters.
    pub fn shutdown(mut self) -> Stats {
        self.handle.cancel();
        drop(self.handle.image_tx.clone());
        self.worker
            .take()
            .map(|w| w.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        self.handle.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<C, T, F, W>(
    config: VioConfig,
    camera: C,
    tracker: &mut T,
    frame_adapter: &mut F,
    point_adapter: &mut W,
    imu_buffer: Arc<Mutex<InertialRingBuffer>>,
    image_rx: crossbeam::channel::Receiver<Image>,
    ack_tx: crossbeam::channel::Sender<()>,
    cancel: Arc<AtomicBool>,
) -> Stats
where
    C: CameraModel,
    T: Tracker,
    F: FrameAdapter,
    W: WorldPointAdapter,
{
    let mut solver = EkfSolver::new(camera, config.max_window_size, config.reproj_noise_std);
    let mut slab = LandmarkSlab::new();
    let mut association = DataAssociation::new();
    let noise_cov = imu_noise_covariance(config.imu_fps, config.gyro_noise_std, config.accel_noise_std);
    let frame_period_ns = config.nominal_frame_period_ns();
    let ransac_params = RansacParams::default();
    let num_cameras: u32 = if config.stereo { 2 } else { 1 };

    let mut stats = Stats::default();
    let mut last_image_t_ns: Option<TimestampNs> = None;
    let mut frame_id = 0u64;
    let mut velocity = Vector3::<f64>::zeros();

    loop {
        let image = match image_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(image) => image,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        if frame_id < config.image_start_idx {
            frame_id += 1;
            continue;
        }

        let t0 = last_image_t_ns.unwrap_or(image.t_ns - frame_period_ns);
        let t1 = image.t_ns;

        let delta = match wait_and_preintegrate(
            &imu_buffer,
            t0,
            t1,
            frame_period_ns,
            &noise_cov,
            config.serial_run,
            &cancel,
        ) {
            Ok(delta) => delta,
            Err(VioError::Cancelled) => break,
            Err(err) => {
                log::error!("worker exiting on fatal preintegration error: {err}");
                break;
            }
        };
        if delta.d_t_ns > config.frame_drop_threshold_ns() {
            stats.frame_drops += 1;
        }

        let (rotation, position) = {
            let last_pose = solver.poses.last();
            let prev_r = last_pose.map(|p| p.rotation).unwrap_or_else(Rotation3::identity);
            let prev_p = last_pose.map(|p| p.position).unwrap_or_else(Vector3::zeros);
            let dt = delta.d_t_ns as f64 * 1e-9;
            let gravity = Vector3::new(0.0, 0.0, GRAVITY);
            let r = prev_r * delta.delta_r;
            let p = prev_p + prev_r.matrix() * delta.delta_p + velocity * dt - gravity * (0.5 * dt * dt);
            velocity += prev_r.matrix() * delta.delta_v - gravity * dt;
            (r, p)
        };
        let pose_slot = solver.clone_pose(rotation, position);

        let is_static = {
            let buf = imu_buffer.lock().expect("imu buffer mutex poisoned");
            buf.detect_static()
        };
        if is_static {
            imu_buffer
                .lock()
                .expect("imu buffer mutex poisoned")
                .update_bias_by_static();
        }

        let tracked = tracker.track(&image, pose_slot, &mut slab);

        let assoc_stats = if is_static {
            // With no motion the epipolar geometry RANSAC relies on is
            // degenerate (zero baseline), and there is nothing fresh for
            // the solver to fuse; skip straight to dead reckoning.
            AssociationStats::default()
        } else {
            reject_outliers(
                &tracked,
                &mut slab,
                pose_slot,
                frame_id,
                num_cameras,
                &delta.delta_r,
                &ransac_params,
            );
            association.process_frame(frame_id, &tracked, &mut slab, &mut solver, &config)
        };
        stats.accumulate(&assoc_stats);

        stats.frames_processed += 1;
        stats.log(frame_id);

        let (out_rotation, out_position) = solver
            .poses
            .get(pose_slot)
            .map(|p| (p.rotation, p.position))
            .unwrap_or((rotation, position));

        frame_adapter.on_pose(&PoseOutput {
            t_ns: image.t_ns,
            rotation: out_rotation,
            position: out_position,
            velocity,
        });
        let points: Vec<WorldPointOutput> = slab_points(&slab, &tracked);
        point_adapter.on_world_points(&points);

        if config.serial_run {
            let _ = ack_tx.send(());
        }

        last_image_t_ns = Some(image.t_ns);
        frame_id += 1;
    }

    stats
}

/// Per-camera gyro-aided two-point RANSAC over this frame's freshly tracked
/// correspondences, dropping the ones that are inconsistent with the
/// integrated inter-frame rotation.
fn reject_outliers(
    tracked: &[crate::types::LandmarkId],
    slab: &mut LandmarkSlab,
    pose_slot: crate::types::PoseSlot,
    frame_id: u64,
    num_cameras: u32,
    delta_r: &Rotation3<f64>,
    params: &RansacParams,
) {
    for camera_id in 0..num_cameras {
        let mut ids = Vec::new();
        let mut rays0 = Vec::new();
        let mut rays1 = Vec::new();

        for &id in tracked {
            let Some(lm) = slab.get(id) else { continue };
            let Some(list) = lm.observations.get(camera_id as usize) else { continue };
            if list.len() < 2 {
                continue;
            }
            let last = list[list.len() - 1];
            if last.pose_slot != pose_slot {
                continue; // no fresh observation on this camera this frame
            }
            let prev = list[list.len() - 2];
            ids.push(id);
            rays0.push(prev.bearing);
            rays1.push(last.bearing);
        }

        if ids.len() < 2 {
            continue;
        }
        let inliers = two_point_ransac(&rays0, &rays1, delta_r, params);
        for (i, &keep) in inliers.iter().enumerate() {
            if !keep {
                if let Some(lm) = slab.get_mut(ids[i]) {
                    lm.pop_last_observation(camera_id, frame_id);
                }
            }
        }
    }
}

fn slab_points(slab: &LandmarkSlab, tracked: &[crate::types::LandmarkId]) -> Vec<WorldPointOutput> {
    tracked
        .iter()
        .filter_map(|&id| slab.get(id))
        .filter_map(|lm| {
            lm.point.map(|p| WorldPointOutput {
                landmark_id: lm.id,
                position: p.position,
                tag: if p.flag_slam_point {
                    PointCovarianceTag::Slam
                } else {
                    PointCovarianceTag::Msckf
                },
            })
        })
        .collect()
}
