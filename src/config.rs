//! Configuration values consumed by the estimation core.
//!
//! `VioConfig` is the structured form, deserializable from a JSON session
//! file; `CliArgs` is the subset a caller commonly wants to flip from the
//! command line, layered on top via `clap::Parser`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VioConfig {
    /// Sliding window length (number of cloned camera poses kept live).
    pub max_window_size: usize,

    /// Max SLAM + MSCKF points considered in a single budgeted pass.
    pub max_point_size: usize,

    /// Max rows in the solver's stacked observation Jacobian.
    pub max_obs_size: usize,

    /// Headroom reserved per MSCKF point beyond the window itself.
    pub max_additional_msckf_point: usize,

    /// Gyro measurement noise density (rad/s/√Hz).
    pub gyro_noise_std: f64,

    /// Accelerometer measurement noise density (m/s²/√Hz).
    pub accel_noise_std: f64,

    /// Nominal IMU sample rate (Hz), used to scale discrete noise covariance.
    pub imu_fps: f64,

    /// Nominal camera frame rate (Hz), used for the frame-drop threshold.
    pub camera_fps: f64,

    /// Reprojection noise standard deviation, in pixels, used to whiten the
    /// solver's measurement Jacobian/residual before folding it into the
    /// information filter and for Mahalanobis gating.
    pub reproj_noise_std: f64,

    /// Whether a second (stereo) camera is active.
    pub stereo: bool,

    /// Deterministic single-thread interleave: worker signals producer
    /// after every frame and never sleeps on the IMU wait.
    pub serial_run: bool,

    /// Soft cap on processed frames per second (0 = uncapped).
    pub max_run_fps: f64,

    /// Number of leading frames to discard before admitting images.
    pub image_start_idx: u64,

    /// Disables any drawing/inspection surfaces (core never draws regardless;
    /// kept for parity with the external config knob callers may forward).
    pub no_gui: bool,
}

impl Default for VioConfig {
    fn default() -> Self {
        Self {
            max_window_size: 20,
            max_point_size: 50,
            max_obs_size: 2000,
            max_additional_msckf_point: 5,
            gyro_noise_std: 0.004,
            accel_noise_std: 0.04,
            imu_fps: 200.0,
            camera_fps: 20.0,
            reproj_noise_std: 1.0,
            stereo: false,
            serial_run: false,
            max_run_fps: 0.0,
            image_start_idx: 0,
            no_gui: true,
        }
    }
}

impl VioConfig {
    /// Nominal inter-frame period in nanoseconds, used by the frame-drop
    /// detector (warns when dT exceeds 1.5x this value).
    pub fn nominal_frame_period_ns(&self) -> i64 {
        (1.0e9 / self.camera_fps) as i64
    }

    pub fn frame_drop_threshold_ns(&self) -> i64 {
        (1.5 * self.nominal_frame_period_ns() as f64) as i64
    }

    /// MSCKF point budget for the current SLAM point count.
    pub fn msckf_budget(&self, n_slam: usize) -> i64 {
        let numerator = self.max_obs_size as i64
            - (self.max_additional_msckf_point * self.max_window_size * 2) as i64
            - (n_slam * 5) as i64;
        numerator / (self.max_window_size as i64 * 2)
    }
}

/// Command-line overrides for the demo binary, layered on top of a
/// `VioConfig` loaded from file (or the built-in default).
#[derive(Clone, Debug, clap::Parser)]
#[command(name = "vio-node")]
#[command(about = "VIO estimation core demo driver", long_about = None)]
pub struct CliArgs {
    /// Optional path to a JSON `VioConfig` file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Optional path to a recorded session (JSON lines of IMU/image events)
    /// to replay instead of the synthetic generator.
    #[arg(long)]
    pub replay: Option<std::path::PathBuf>,

    /// Force serial (deterministic) run mode regardless of the config file.
    #[arg(long)]
    pub serial: bool,

    /// Number of synthetic frames to run when no `--replay` file is given.
    #[arg(long, default_value = "50")]
    pub frames: u64,
}

impl CliArgs {
    pub fn load_config(&self) -> anyhow::Result<VioConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => VioConfig::default(),
        };
        if self.serial {
            cfg.serial_run = true;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msckf_budget_matches_formula() {
        let cfg = VioConfig {
            max_obs_size: 2000,
            max_additional_msckf_point: 5,
            max_window_size: 20,
            ..VioConfig::default()
        };
        // (2000 - 5*20*2 - n_slam*5) / (20*2)
        assert_eq!(cfg.msckf_budget(0), (2000 - 200) / 40);
        assert_eq!(cfg.msckf_budget(16), (2000 - 200 - 80) / 40);
    }

    #[test]
    fn frame_drop_threshold_is_1_5x_nominal() {
        let cfg = VioConfig {
            camera_fps: 20.0,
            ..VioConfig::default()
        };
        let nominal = cfg.nominal_frame_period_ns();
        assert_eq!(cfg.frame_drop_threshold_ns(), (1.5 * nominal as f64) as i64);
    }
}
