//! SE3: rigid-body transformation (rotation + translation).
//!
//! Tangent vectors are ordered `[ω, υ]` (rotation first). `exp`/`log` are the
//! true group maps, so `exp(-v)` is exactly the inverse of `exp(v)`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use super::so3::{left_jacobian_so3, left_jacobian_so3_inv};

/// Rigid transformation. Transforms points as `p' = R * p + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from the upper 3x4 block of a homogeneous matrix.
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let rotation = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(rotation, translation)
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self ∘ other`: applies `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4x4 matrix `[R | t; 0 | 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    /// Exponential map from `[ω, υ]`.
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let omega = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let upsilon = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: left_jacobian_so3(&omega) * upsilon,
        }
    }

    /// Logarithm map to `[ω, υ]`.
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        let upsilon = left_jacobian_so3_inv(&omega) * self.translation;
        Vector6::new(omega.x, omega.y, omega.z, upsilon.x, upsilon.y, upsilon.z)
    }

    /// Left retraction: `exp(δ) ∘ self`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        Self::exp(delta).compose(self)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, -0.4, 0.25)),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_compose_is_identity() {
        let pose = sample_pose();
        let composed = pose.compose(&pose.inverse());

        assert_relative_eq!(composed.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(composed.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = sample_pose();
        let back = SE3::exp(&pose.log());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-10);
        assert_relative_eq!(back.rotation.coords, pose.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_retract_zero_is_noop() {
        let pose = sample_pose();
        let same = pose.retract(&Vector6::zeros());

        assert_relative_eq!(same.translation, pose.translation, epsilon = 1e-15);
        assert_relative_eq!(same.rotation.coords, pose.rotation.coords, epsilon = 1e-15);
    }

    #[test]
    fn test_retract_forward_then_backward() {
        let pose = sample_pose();
        let v = Vector6::new(0.01, -0.02, 0.005, 0.03, 0.01, -0.02);
        let back = pose.retract(&v).retract(&(-v));

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-10);
        assert_relative_eq!(back.rotation.coords, pose.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = sample_pose();
        let back = SE3::from_matrix(&pose.to_matrix());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-10);
        assert_relative_eq!(
            back.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-10
        );
    }
}
