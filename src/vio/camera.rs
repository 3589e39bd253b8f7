//! Camera model interface consumed by triangulation and Jacobian assembly.

use nalgebra::{Matrix2x3, Vector2, Vector3};

use crate::types::PixelCoord;

/// Pinhole-family camera model: intrinsics, bearing/projection, and the
/// projection Jacobian needed to linearize a reprojection residual.
pub trait CameraModel {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn is_stereo(&self) -> bool;

    /// Unit bearing ray in the camera frame for a pixel observation.
    fn bearing(&self, px: PixelCoord) -> Vector3<f64>;

    /// Project a 3-D point in the camera frame to a pixel coordinate.
    fn project(&self, point_cam: &Vector3<f64>) -> PixelCoord;

    /// Jacobian of `project` with respect to the camera-frame point,
    /// evaluated at `point_cam`.
    fn projection_jacobian(&self, point_cam: &Vector3<f64>) -> Matrix2x3<f64>;
}

/// Undistorted pinhole camera: `px = (fx*X/Z + cx, fy*Y/Z + cy)`. Reference
/// implementation for tests and the demo binary; production distortion
/// models are external to this crate.
#[derive(Clone, Copy, Debug)]
pub struct PinholeCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub stereo: bool,
}

impl PinholeCamera {
    pub fn new(width: u32, height: u32, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            width,
            height,
            fx,
            fy,
            cx,
            cy,
            stereo: false,
        }
    }

    pub fn with_stereo(mut self, stereo: bool) -> Self {
        self.stereo = stereo;
        self
    }
}

impl CameraModel for PinholeCamera {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn is_stereo(&self) -> bool {
        self.stereo
    }

    fn bearing(&self, px: PixelCoord) -> Vector3<f64> {
        let x = (px.x - self.cx) / self.fx;
        let y = (px.y - self.cy) / self.fy;
        Vector3::new(x, y, 1.0).normalize()
    }

    fn project(&self, point_cam: &Vector3<f64>) -> PixelCoord {
        let z = point_cam.z;
        PixelCoord::new(
            self.fx * point_cam.x / z + self.cx,
            self.fy * point_cam.y / z + self.cy,
        )
    }

    fn projection_jacobian(&self, point_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let z = point_cam.z;
        let z2 = z * z;
        Matrix2x3::new(
            self.fx / z,
            0.0,
            -self.fx * point_cam.x / z2,
            0.0,
            self.fy / z,
            -self.fy * point_cam.y / z2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn project_and_bearing_roundtrip_direction() {
        let cam = PinholeCamera::new(640, 480, 400.0, 400.0, 320.0, 240.0);
        let point = Vector3::new(0.3, -0.2, 2.0);
        let px = cam.project(&point);
        let ray = cam.bearing(px);
        let expected_dir = point.normalize();
        assert_relative_eq!(ray.x, expected_dir.x, epsilon = 1e-9);
        assert_relative_eq!(ray.y, expected_dir.y, epsilon = 1e-9);
        assert_relative_eq!(ray.z, expected_dir.z, epsilon = 1e-9);
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let cam = PinholeCamera::new(640, 480, 400.0, 400.0, 320.0, 240.0);
        let point = Vector3::new(0.3, -0.2, 2.0);
        let analytic = cam.projection_jacobian(&point);

        let h = 1e-6;
        for col in 0..3 {
            let mut plus = point;
            plus[col] += h;
            let mut minus = point;
            minus[col] -= h;
            let px_plus = cam.project(&plus);
            let px_minus = cam.project(&minus);
            let dx = (px_plus.x - px_minus.x) / (2.0 * h);
            let dy = (px_plus.y - px_minus.y) / (2.0 * h);
            assert_relative_eq!(analytic[(0, col)], dx, epsilon = 1e-3);
            assert_relative_eq!(analytic[(1, col)], dy, epsilon = 1e-3);
        }
    }
}
