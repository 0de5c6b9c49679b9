//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Used by the essential-graph corrector and two-view registration. For
//! stereo/RGB-D input the scale is held at 1.0 through the `fix_scale` flag of
//! the optimization variable rather than by a separate type.

use nalgebra::{Matrix3, Matrix4, Rotation3, SVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::so3::skew;
use super::SE3;

/// Tangent vector `[ω(3), υ(3), σ]` where the scale is `e^σ`.
pub type Vector7 = SVector<f64, 7>;

const SIM3_EPS: f64 = 1e-5;

/// 7-DOF similarity transformation. Transforms points as `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Rigid part with the scale folded into the translation: `[R | t/s]`.
    ///
    /// This is how a corrected keyframe pose is recovered from its Sim3.
    pub fn to_se3_unscaled(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Convert to homogeneous 4x4 matrix of form [s*R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.scaled_rotation_matrix());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    /// Inverse: `[(1/s)Rᵀ | -(1/s)Rᵀt]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// `self ∘ other`: `[s1*s2*R1*R2 | s1*R1*t2 + t1]`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn scaled_rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation_matrix() * self.scale
    }

    /// Exponential map from `[ω, υ, σ]`.
    pub fn exp(tangent: &Vector7) -> Self {
        let omega = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let upsilon = Vector3::new(tangent[3], tangent[4], tangent[5]);
        let sigma = tangent[6];

        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: w_matrix(&omega, sigma) * upsilon,
            scale: sigma.exp(),
        }
    }

    /// Logarithm map to `[ω, υ, σ]`.
    pub fn log(&self) -> Vector7 {
        let omega = self.rotation.scaled_axis();
        let sigma = self.scale.ln();
        let w_inv = w_matrix(&omega, sigma)
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);
        let upsilon = w_inv * self.translation;

        Vector7::from_column_slice(&[
            omega.x, omega.y, omega.z, upsilon.x, upsilon.y, upsilon.z, sigma,
        ])
    }

    /// Left retraction: `exp(δ) ∘ self`.
    pub fn retract(&self, delta: &Vector7) -> Self {
        Self::exp(delta).compose(self)
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Translation coupling matrix `W = A[ω]× + B[ω]×² + C·I` of the Sim3 exponential.
fn w_matrix(omega: &Vector3<f64>, sigma: f64) -> Matrix3<f64> {
    let theta = omega.norm();
    let omega_hat = skew(omega);
    let omega_hat_sq = omega_hat * omega_hat;
    let scale = sigma.exp();

    let (a, b, c) = if sigma.abs() < SIM3_EPS {
        if theta < SIM3_EPS {
            (0.5, 1.0 / 6.0, 1.0)
        } else {
            let theta_sq = theta * theta;
            (
                (1.0 - theta.cos()) / theta_sq,
                (theta - theta.sin()) / (theta_sq * theta),
                1.0,
            )
        }
    } else {
        let c = (scale - 1.0) / sigma;
        if theta < SIM3_EPS {
            let sigma_sq = sigma * sigma;
            (
                ((sigma - 1.0) * scale + 1.0) / sigma_sq,
                ((0.5 * sigma_sq - sigma + 1.0) * scale - 1.0) / (sigma_sq * sigma),
                c,
            )
        } else {
            let s_sin = scale * theta.sin();
            let s_cos = scale * theta.cos();
            let denom = theta * theta + sigma * sigma;
            let a = (s_sin * sigma + (1.0 - s_cos) * theta) / (theta * denom);
            let b = (c - ((s_cos - 1.0) * sigma + s_sin * theta) / denom) / (theta * theta);
            (a, b, c)
        }
    };

    a * omega_hat + b * omega_hat_sq + c * Matrix3::identity()
}
