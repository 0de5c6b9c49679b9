//! Pinhole camera model shared by every projective factor.

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Rectified pinhole intrinsics with an optional stereo baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters (0 for monocular use).
    pub baseline: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, baseline: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            baseline,
        }
    }

    pub fn from_k_and_baseline(k: Matrix3<f64>, baseline: f64) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            baseline,
        }
    }

    /// Baseline times focal length, the stereo disparity numerator.
    pub fn bf(&self) -> f64 {
        self.baseline * self.fx
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point to pixels.
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p.z;
        Vector2::new(
            self.fx * p.x * inv_z + self.cx,
            self.fy * p.y * inv_z + self.cy,
        )
    }

    /// Project to `(u, v, u_right)` where `u_right = u - bf / z`.
    pub fn project_stereo(&self, p: &Vector3<f64>) -> Vector3<f64> {
        let uv = self.project(p);
        Vector3::new(uv.x, uv.y, uv.x - self.bf() / p.z)
    }

    /// Back-project a pixel at the given depth into the camera frame.
    pub fn unproject(&self, uv: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (uv.x - self.cx) * depth / self.fx,
            (uv.y - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// d(u, v)/d(x, y, z).
    pub fn projection_jacobian(&self, p: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z, 0.0, -self.fx * p.x * inv_z2,
            0.0, self.fy * inv_z, -self.fy * p.y * inv_z2,
        )
    }

    /// d(u, v, u_right)/d(x, y, z).
    pub fn stereo_projection_jacobian(&self, p: &Vector3<f64>) -> Matrix3<f64> {
        let inv_z = 1.0 / p.z;
        let inv_z2 = inv_z * inv_z;
        Matrix3::new(
            self.fx * inv_z, 0.0, -self.fx * p.x * inv_z2,
            0.0, self.fy * inv_z, -self.fy * p.y * inv_z2,
            self.fx * inv_z, 0.0, (self.bf() - self.fx * p.x) * inv_z2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 480.0, 320.0, 240.0, 0.1)
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let cam = camera();
        let uv = Vector2::new(100.0, 300.0);
        let p = cam.unproject(&uv, 4.0);

        assert_relative_eq!(p.z, 4.0, epsilon = 1e-12);
        assert_relative_eq!(cam.project(&p), uv, epsilon = 1e-10);
    }

    #[test]
    fn test_stereo_disparity() {
        let cam = camera();
        let p = Vector3::new(0.0, 0.0, 5.0);
        let stereo = cam.project_stereo(&p);

        // bf / z = 500 * 0.1 / 5
        assert_relative_eq!(stereo.x - stereo.z, 10.0, epsilon = 1e-10);
    }

    #[test]
    fn test_projection_jacobian_matches_finite_difference() {
        let cam = camera();
        let p = Vector3::new(0.3, -0.2, 3.0);
        let jac = cam.stereo_projection_jacobian(&p);
        let eps = 1e-6;

        for k in 0..3 {
            let mut plus = p;
            let mut minus = p;
            plus[k] += eps;
            minus[k] -= eps;
            let column = (cam.project_stereo(&plus) - cam.project_stereo(&minus)) / (2.0 * eps);
            assert_relative_eq!(jac.column(k).into_owned(), column, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_from_k_and_baseline() {
        let cam = CameraModel::from_k_and_baseline(camera().k_matrix(), 0.1);
        assert_eq!(cam, camera());
    }
}
