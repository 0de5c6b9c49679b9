//! Optimization variables and their manifold retractions.
//!
//! Every estimate is an immutable value; `retract` returns a new one. Rigid
//! and similarity poses update on the left (`exp(δ) ∘ T`), all Euclidean
//! quantities by plain addition.

use nalgebra::{DVector, Vector2, Vector3, Vector6};

use crate::geometry::{Sim3, Vector7, SE3};

/// Index of a variable inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub usize);

impl std::fmt::Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Kind tag used to validate factor bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Pose,
    Sim3,
    Point,
    Flow,
    Depth,
    FlowDepth,
}

/// Current value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Estimate {
    /// Rigid transform, world-to-camera for camera poses.
    Pose(SE3),
    Sim3(Sim3),
    Point(Vector3<f64>),
    /// Planar optical flow `(dx, dy)` in pixels.
    Flow(Vector2<f64>),
    Depth(f64),
    /// `(dx, dy, depth)`.
    FlowDepth(Vector3<f64>),
}

impl Estimate {
    pub fn kind(&self) -> VariableKind {
        match self {
            Estimate::Pose(_) => VariableKind::Pose,
            Estimate::Sim3(_) => VariableKind::Sim3,
            Estimate::Point(_) => VariableKind::Point,
            Estimate::Flow(_) => VariableKind::Flow,
            Estimate::Depth(_) => VariableKind::Depth,
            Estimate::FlowDepth(_) => VariableKind::FlowDepth,
        }
    }

    /// Tangent-space dimension.
    pub fn dim(&self) -> usize {
        match self {
            Estimate::Pose(_) => 6,
            Estimate::Sim3(_) => 7,
            Estimate::Point(_) | Estimate::FlowDepth(_) => 3,
            Estimate::Flow(_) => 2,
            Estimate::Depth(_) => 1,
        }
    }

    /// Apply a tangent increment; `delta.len()` must equal `dim()`.
    pub fn retract(&self, delta: &DVector<f64>) -> Estimate {
        match self {
            Estimate::Pose(pose) => {
                Estimate::Pose(pose.retract(&Vector6::from_iterator(delta.iter().copied())))
            }
            Estimate::Sim3(sim3) => {
                Estimate::Sim3(sim3.retract(&Vector7::from_iterator(delta.iter().copied())))
            }
            Estimate::Point(p) => Estimate::Point(p + Vector3::from_iterator(delta.iter().copied())),
            Estimate::Flow(f) => Estimate::Flow(f + Vector2::from_iterator(delta.iter().copied())),
            Estimate::Depth(d) => Estimate::Depth(d + delta.get(0).copied().unwrap_or(0.0)),
            Estimate::FlowDepth(v) => {
                Estimate::FlowDepth(v + Vector3::from_iterator(delta.iter().copied()))
            }
        }
    }

    pub fn as_pose(&self) -> Option<&SE3> {
        match self {
            Estimate::Pose(pose) => Some(pose),
            _ => None,
        }
    }

    pub fn as_sim3(&self) -> Option<&Sim3> {
        match self {
            Estimate::Sim3(sim3) => Some(sim3),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<&Vector3<f64>> {
        match self {
            Estimate::Point(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_flow(&self) -> Option<&Vector2<f64>> {
        match self {
            Estimate::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_depth(&self) -> Option<f64> {
        match self {
            Estimate::Depth(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_flow_depth(&self) -> Option<&Vector3<f64>> {
        match self {
            Estimate::FlowDepth(v) => Some(v),
            _ => None,
        }
    }
}

/// A graph participant: estimate plus solver flags.
#[derive(Debug, Clone)]
pub struct Variable {
    pub estimate: Estimate,

    /// Value restored by `Graph::reset_estimates`.
    initial: Estimate,

    /// Fixed variables feed residuals but never move.
    pub fixed: bool,

    /// Eliminated through the Schur complement.
    pub marginalized: bool,

    /// Sim3 only: hold the scale at its current value.
    pub fix_scale: bool,

    /// Restore the initial estimate before every robust round.
    pub reset_each_round: bool,
}

impl Variable {
    pub fn new(estimate: Estimate) -> Self {
        Self {
            initial: estimate.clone(),
            estimate,
            fixed: false,
            marginalized: false,
            fix_scale: false,
            reset_each_round: false,
        }
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn marginalized(mut self, marginalized: bool) -> Self {
        self.marginalized = marginalized;
        self
    }

    pub fn with_fix_scale(mut self, fix_scale: bool) -> Self {
        self.fix_scale = fix_scale;
        self
    }

    pub fn reset_each_round(mut self, reset: bool) -> Self {
        self.reset_each_round = reset;
        self
    }

    pub fn dim(&self) -> usize {
        self.estimate.dim()
    }

    pub fn kind(&self) -> VariableKind {
        self.estimate.kind()
    }

    pub fn initial(&self) -> &Estimate {
        &self.initial
    }

    /// Tangent directions frozen by flags (the Sim3 scale under `fix_scale`).
    pub fn is_frozen_direction(&self, k: usize) -> bool {
        self.fix_scale && self.kind() == VariableKind::Sim3 && k == 6
    }

    /// Retract in place, honoring frozen directions.
    pub fn apply_increment(&mut self, delta: &DVector<f64>) {
        let mut delta = delta.clone();
        for k in 0..delta.len() {
            if self.is_frozen_direction(k) {
                delta[k] = 0.0;
            }
        }
        self.estimate = self.estimate.retract(&delta);
    }

    pub fn reset(&mut self) {
        self.estimate = self.initial.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_retract_zero_returns_same_pose() {
        let pose = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.2, 0.1, -0.3)),
            Vector3::new(0.5, 1.0, -2.0),
        );
        let est = Estimate::Pose(pose.clone());
        let same = est.retract(&DVector::zeros(6));

        let same = same.as_pose().unwrap();
        assert_relative_eq!(same.translation, pose.translation, epsilon = 1e-15);
        assert_relative_eq!(same.rotation.coords, pose.rotation.coords, epsilon = 1e-15);
    }

    #[test]
    fn test_retract_plus_minus_sim3() {
        let sim3 = Sim3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.4, 0.1)),
            Vector3::new(1.0, 0.0, 2.0),
            1.3,
        );
        let est = Estimate::Sim3(sim3.clone());
        let v = DVector::from_vec(vec![0.01, -0.02, 0.03, 0.1, 0.0, -0.05, 0.02]);
        let back = est.retract(&v).retract(&(-v));

        let back = back.as_sim3().unwrap();
        assert_relative_eq!(back.scale, sim3.scale, epsilon = 1e-10);
        assert_relative_eq!(back.translation, sim3.translation, epsilon = 1e-10);
    }

    #[test]
    fn test_fix_scale_freezes_sigma() {
        let mut var = Variable::new(Estimate::Sim3(Sim3::identity())).with_fix_scale(true);
        var.apply_increment(&DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.5]));

        let sim3 = var.estimate.as_sim3().unwrap();
        assert_relative_eq!(sim3.scale, 1.0, epsilon = 1e-12);
        assert_relative_eq!(sim3.translation.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_euclidean_retract_and_reset() {
        let mut var = Variable::new(Estimate::FlowDepth(Vector3::new(1.0, 2.0, 3.0)));
        var.apply_increment(&DVector::from_vec(vec![0.5, -0.5, 1.0]));
        assert_eq!(var.estimate, Estimate::FlowDepth(Vector3::new(1.5, 1.5, 4.0)));

        var.reset();
        assert_eq!(var.estimate, Estimate::FlowDepth(Vector3::new(1.0, 2.0, 3.0)));
        assert_eq!(Estimate::Depth(1.0).dim(), 1);
    }
}
