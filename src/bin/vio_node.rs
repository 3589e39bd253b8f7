//! Demo driver: wires the estimation core's four subsystems into a
//! runnable pipeline, feeding it either a recorded session or a synthetic
//! IMU+image generator, and logging poses as they're produced.

use std::time::Duration;

use clap::Parser;
use nalgebra::Vector3;

use vio_msckf::config::CliArgs;
use vio_msckf::imu::InertialSample;
use vio_msckf::types::Image;
use vio_msckf::vio::{CameraModel, FrameOrchestrator, LoggingAdapter, NullTracker, PinholeCamera};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = CliArgs::parse();
    let config = args.load_config()?;

    let camera = PinholeCamera::new(640, 480, 400.0, 400.0, 320.0, 240.0).with_stereo(config.stereo);
    let width = camera.width();
    let height = camera.height();

    let orchestrator = FrameOrchestrator::spawn(
        config.clone(),
        camera,
        NullTracker,
        LoggingAdapter,
        LoggingAdapter,
        4096,
        64,
    );
    let handle = orchestrator.handle();

    match &args.replay {
        Some(path) => replay_session(&handle, path)?,
        None => run_synthetic(&handle, &config, args.frames, width, height),
    }

    handle.cancel();
    let stats = orchestrator.shutdown();
    log::info!(
        "run complete: {} frames, {} drops, {} triangulated, {} admitted",
        stats.frames_processed,
        stats.frame_drops,
        stats.triangulated,
        stats.admitted_msckf + stats.admitted_slam,
    );
    Ok(())
}

/// Replay a recorded session: one JSON value per line, each either an
/// `InertialSample` or an `Image`, tagged by a `"kind"` field.
fn replay_session(handle: &vio_msckf::vio::VioHandle, path: &std::path::Path) -> anyhow::Result<()> {
    use std::io::BufRead;

    #[derive(serde::Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    enum Event {
        Imu(InertialSample),
        Image(Image),
    }

    let file = std::fs::File::open(path)?;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line)? {
            Event::Imu(sample) => handle.push_imu(sample),
            Event::Image(image) => {
                handle.push_image(image)?;
            }
        }
    }
    Ok(())
}

/// Synthetic IMU+image generator: a slowly rotating, slightly accelerating
/// body, producing IMU samples at `config.imu_fps` and blank images at
/// `config.camera_fps`, for `frame_count` frames.
fn run_synthetic(
    handle: &vio_msckf::vio::VioHandle,
    config: &vio_msckf::config::VioConfig,
    frame_count: u64,
    width: u32,
    height: u32,
) {
    let imu_dt_ns = (1.0e9 / config.imu_fps) as i64;
    let frame_period_ns = config.nominal_frame_period_ns();
    let imu_per_frame = (frame_period_ns / imu_dt_ns).max(1);

    let mut t_ns = 0i64;
    for frame in 0..frame_count {
        for _ in 0..imu_per_frame {
            let sample = InertialSample::new(
                t_ns,
                Vector3::new(0.0, 0.0, 0.05),
                Vector3::new(0.0, 0.0, 9.81),
                0,
            );
            handle.push_imu(sample);
            t_ns += imu_dt_ns;
        }

        let image = Image {
            t_ns,
            pixel_buffer: Vec::new(),
            width,
            height,
            stride: width,
            camera_id: 0,
        };
        if handle.push_image(image).is_err() {
            break;
        }

        if config.serial_run {
            handle.wait_for_frame_ack();
        } else if config.max_run_fps > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(1.0 / config.max_run_fps));
        }

        log::trace!("synthetic frame {frame} pushed");
    }
}
