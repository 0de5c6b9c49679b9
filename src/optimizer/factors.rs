//! Factor catalogue: residuals, Jacobians and validity checks.
//!
//! Every residual is `measured - predicted`, except the Sim3 relative edge
//! (a log-map error) and the priors (`estimate - measurement`). Jacobians
//! are taken with respect to each variable's tangent space. The reprojection
//! families have closed forms; the rest use central differences through the
//! retraction.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x6, Vector2, Vector3};

use crate::frame::CameraModel;
use crate::geometry::{skew, Sim3, SE3};

use super::variables::{Estimate, Variable, VariableKind};
use super::VariableId;

const NUMERIC_EPS: f64 = 1e-6;

/// Huber kernel on the chi-square statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Huber {
    pub delta: f64,
}

impl Huber {
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }

    /// IRLS weight ρ'(chi2).
    pub fn weight(&self, chi2: f64) -> f64 {
        let delta_sq = self.delta * self.delta;
        if chi2 <= delta_sq {
            1.0
        } else {
            self.delta / chi2.sqrt()
        }
    }

    /// Robustified cost ρ(chi2).
    pub fn cost(&self, chi2: f64) -> f64 {
        let delta_sq = self.delta * self.delta;
        if chi2 <= delta_sq {
            chi2
        } else {
            2.0 * self.delta * chi2.sqrt() - delta_sq
        }
    }
}

/// Which chi-square threshold classifies a factor, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Never classified (priors, pose-graph edges).
    None,
    /// Two-dimensional image residual.
    Mono,
    /// Three-dimensional stereo residual.
    Stereo,
}

/// Residual family plus its fixed measurement data.
#[derive(Debug, Clone)]
pub enum FactorKind {
    /// (pose T_cw, point X_w): uv − π(T·X).
    MonoReprojection {
        measurement: Vector2<f64>,
        camera: CameraModel,
    },
    /// (pose, point): (u, v, u_r) − (π(T·X), u − bf/z).
    StereoReprojection {
        measurement: Vector3<f64>,
        camera: CameraModel,
    },
    /// (pose): uv − π(T·X) with X fixed.
    PoseOnlyMono {
        measurement: Vector2<f64>,
        point: Vector3<f64>,
        camera: CameraModel,
    },
    /// (pose): stereo residual with X fixed.
    PoseOnlyStereo {
        measurement: Vector3<f64>,
        point: Vector3<f64>,
        camera: CameraModel,
    },
    /// (pose): uv_previous − π(T⁻¹·X) with X fixed.
    PoseOnlyBackward {
        measurement: Vector2<f64>,
        point: Vector3<f64>,
        camera: CameraModel,
    },
    /// (motion H): uv − π(T_cw·H·X) with T_cw and X fixed.
    ObjectMotion {
        measurement: Vector2<f64>,
        point: Vector3<f64>,
        camera_pose: SE3,
        camera: CameraModel,
    },
    /// (motion H, point X): uv − π(T_cw·H·X) with T_cw fixed.
    ObjectMotionPoint {
        measurement: Vector2<f64>,
        camera_pose: SE3,
        camera: CameraModel,
    },
    /// (S12): uv₁ − π₁(S12·X2) with X2 fixed in camera 2.
    Sim3Forward {
        measurement: Vector2<f64>,
        point: Vector3<f64>,
        camera: CameraModel,
    },
    /// (S12): uv₂ − π₂(S12⁻¹·X1) with X1 fixed in camera 1.
    Sim3Inverse {
        measurement: Vector2<f64>,
        point: Vector3<f64>,
        camera: CameraModel,
    },
    /// (S_iw, S_jw): log(S_ji · S_iw · S_jw⁻¹).
    Sim3Relative { measurement: Sim3 },
    /// (flow, pose): (x + f) − π(T·T_wl·π⁻¹(x, d)) with depth fixed.
    FlowReprojection {
        anchor: Vector2<f64>,
        depth: f64,
        t_wl: SE3,
        camera: CameraModel,
    },
    /// (depth, pose): as above with flow fixed.
    DepthReprojection {
        anchor: Vector2<f64>,
        flow: Vector2<f64>,
        t_wl: SE3,
        camera: CameraModel,
    },
    /// (flow-depth, pose).
    FlowDepthReprojection {
        anchor: Vector2<f64>,
        t_wl: SE3,
        camera: CameraModel,
    },
    /// (flow, depth, pose).
    SplitFlowDepthReprojection {
        anchor: Vector2<f64>,
        t_wl: SE3,
        camera: CameraModel,
    },
    FlowPrior { measurement: Vector2<f64> },
    DepthPrior { measurement: f64 },
    FlowDepthPrior { measurement: Vector3<f64> },
    PointPrior { measurement: Vector3<f64> },
}

impl FactorKind {
    pub fn name(&self) -> &'static str {
        match self {
            FactorKind::MonoReprojection { .. } => "MonoReprojection",
            FactorKind::StereoReprojection { .. } => "StereoReprojection",
            FactorKind::PoseOnlyMono { .. } => "PoseOnlyMono",
            FactorKind::PoseOnlyStereo { .. } => "PoseOnlyStereo",
            FactorKind::PoseOnlyBackward { .. } => "PoseOnlyBackward",
            FactorKind::ObjectMotion { .. } => "ObjectMotion",
            FactorKind::ObjectMotionPoint { .. } => "ObjectMotionPoint",
            FactorKind::Sim3Forward { .. } => "Sim3Forward",
            FactorKind::Sim3Inverse { .. } => "Sim3Inverse",
            FactorKind::Sim3Relative { .. } => "Sim3Relative",
            FactorKind::FlowReprojection { .. } => "FlowReprojection",
            FactorKind::DepthReprojection { .. } => "DepthReprojection",
            FactorKind::FlowDepthReprojection { .. } => "FlowDepthReprojection",
            FactorKind::SplitFlowDepthReprojection { .. } => "SplitFlowDepthReprojection",
            FactorKind::FlowPrior { .. } => "FlowPrior",
            FactorKind::DepthPrior { .. } => "DepthPrior",
            FactorKind::FlowDepthPrior { .. } => "FlowDepthPrior",
            FactorKind::PointPrior { .. } => "PointPrior",
        }
    }

    /// Variable kinds this factor binds, in order.
    pub fn expected_variables(&self) -> &'static [VariableKind] {
        use VariableKind as K;
        match self {
            FactorKind::MonoReprojection { .. } | FactorKind::StereoReprojection { .. } => {
                &[K::Pose, K::Point]
            }
            FactorKind::PoseOnlyMono { .. }
            | FactorKind::PoseOnlyStereo { .. }
            | FactorKind::PoseOnlyBackward { .. }
            | FactorKind::ObjectMotion { .. } => &[K::Pose],
            FactorKind::ObjectMotionPoint { .. } => &[K::Pose, K::Point],
            FactorKind::Sim3Forward { .. } | FactorKind::Sim3Inverse { .. } => &[K::Sim3],
            FactorKind::Sim3Relative { .. } => &[K::Sim3, K::Sim3],
            FactorKind::FlowReprojection { .. } => &[K::Flow, K::Pose],
            FactorKind::DepthReprojection { .. } => &[K::Depth, K::Pose],
            FactorKind::FlowDepthReprojection { .. } => &[K::FlowDepth, K::Pose],
            FactorKind::SplitFlowDepthReprojection { .. } => &[K::Flow, K::Depth, K::Pose],
            FactorKind::FlowPrior { .. } => &[K::Flow],
            FactorKind::DepthPrior { .. } => &[K::Depth],
            FactorKind::FlowDepthPrior { .. } => &[K::FlowDepth],
            FactorKind::PointPrior { .. } => &[K::Point],
        }
    }

    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::StereoReprojection { .. }
            | FactorKind::PoseOnlyStereo { .. }
            | FactorKind::FlowDepthPrior { .. }
            | FactorKind::PointPrior { .. } => 3,
            FactorKind::Sim3Relative { .. } => 7,
            FactorKind::DepthPrior { .. } => 1,
            _ => 2,
        }
    }

    fn default_gate(&self) -> Gate {
        match self {
            FactorKind::StereoReprojection { .. } | FactorKind::PoseOnlyStereo { .. } => {
                Gate::Stereo
            }
            FactorKind::Sim3Relative { .. }
            | FactorKind::FlowPrior { .. }
            | FactorKind::DepthPrior { .. }
            | FactorKind::FlowDepthPrior { .. }
            | FactorKind::PointPrior { .. } => Gate::None,
            _ => Gate::Mono,
        }
    }
}

/// Residual and per-variable Jacobians at the current estimate.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub residual: DVector<f64>,
    /// `None` for fixed variables.
    pub jacobians: Vec<Option<DMatrix<f64>>>,
}

/// A factor bound to graph variables.
#[derive(Debug, Clone)]
pub struct Factor {
    pub kind: FactorKind,
    pub variables: Vec<VariableId>,
    pub information: DMatrix<f64>,
    pub robust: Option<Huber>,
    pub gate: Gate,

    /// Inactive factors are skipped by the solver (outliers).
    pub active: bool,
}

impl Factor {
    /// Factor with identity information, no kernel and the kind's default gate.
    pub fn new(kind: FactorKind, variables: Vec<VariableId>) -> Self {
        let dim = kind.residual_dim();
        let gate = kind.default_gate();
        Self {
            kind,
            variables,
            information: DMatrix::identity(dim, dim),
            robust: None,
            gate,
            active: true,
        }
    }

    pub fn with_information(mut self, information: DMatrix<f64>) -> Self {
        self.information = information;
        self
    }

    /// Diagonal information; a single value is broadcast to every dimension.
    pub fn with_diagonal_information(mut self, diagonal: &[f64]) -> Self {
        let dim = self.kind.residual_dim();
        let values: Vec<f64> = (0..dim)
            .map(|k| diagonal.get(k).or(diagonal.last()).copied().unwrap_or(1.0))
            .collect();
        self.information = DMatrix::from_diagonal(&DVector::from_vec(values));
        self
    }

    pub fn with_robust(mut self, robust: Option<Huber>) -> Self {
        self.robust = robust;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn residual_dim(&self) -> usize {
        self.kind.residual_dim()
    }

    /// Residual at the given estimates, `None` if they do not match the kind.
    pub fn residual(&self, est: &[&Estimate]) -> Option<DVector<f64>> {
        use Estimate as E;
        let r = match (&self.kind, est) {
            (FactorKind::MonoReprojection { measurement, camera }, [E::Pose(t), E::Point(x)]) => {
                dvec(&(measurement - camera.project(&t.transform_point(x))))
            }
            (FactorKind::StereoReprojection { measurement, camera }, [E::Pose(t), E::Point(x)]) => {
                dvec(&(measurement - camera.project_stereo(&t.transform_point(x))))
            }
            (FactorKind::PoseOnlyMono { measurement, point, camera }, [E::Pose(t)]) => {
                dvec(&(measurement - camera.project(&t.transform_point(point))))
            }
            (FactorKind::PoseOnlyStereo { measurement, point, camera }, [E::Pose(t)]) => {
                dvec(&(measurement - camera.project_stereo(&t.transform_point(point))))
            }
            (FactorKind::PoseOnlyBackward { measurement, point, camera }, [E::Pose(t)]) => {
                dvec(&(measurement - camera.project(&t.inverse().transform_point(point))))
            }
            (
                FactorKind::ObjectMotion { measurement, point, camera_pose, camera },
                [E::Pose(h)],
            ) => {
                let p = camera_pose.transform_point(&h.transform_point(point));
                dvec(&(measurement - camera.project(&p)))
            }
            (
                FactorKind::ObjectMotionPoint { measurement, camera_pose, camera },
                [E::Pose(h), E::Point(x)],
            ) => {
                let p = camera_pose.transform_point(&h.transform_point(x));
                dvec(&(measurement - camera.project(&p)))
            }
            (FactorKind::Sim3Forward { measurement, point, camera }, [E::Sim3(s12)]) => {
                dvec(&(measurement - camera.project(&s12.transform_point(point))))
            }
            (FactorKind::Sim3Inverse { measurement, point, camera }, [E::Sim3(s12)]) => {
                dvec(&(measurement - camera.project(&s12.inverse().transform_point(point))))
            }
            (FactorKind::Sim3Relative { measurement }, [E::Sim3(s_iw), E::Sim3(s_jw)]) => {
                let error = measurement.compose(s_iw).compose(&s_jw.inverse()).log();
                DVector::from_column_slice(error.as_slice())
            }
            (
                FactorKind::FlowReprojection { anchor, depth, t_wl, camera },
                [E::Flow(f), E::Pose(t)],
            ) => dvec(&flow_residual(anchor, f, *depth, t_wl, camera, t).0),
            (
                FactorKind::DepthReprojection { anchor, flow, t_wl, camera },
                [E::Depth(d), E::Pose(t)],
            ) => dvec(&flow_residual(anchor, flow, *d, t_wl, camera, t).0),
            (
                FactorKind::FlowDepthReprojection { anchor, t_wl, camera },
                [E::FlowDepth(fd), E::Pose(t)],
            ) => {
                let flow = Vector2::new(fd.x, fd.y);
                dvec(&flow_residual(anchor, &flow, fd.z, t_wl, camera, t).0)
            }
            (
                FactorKind::SplitFlowDepthReprojection { anchor, t_wl, camera },
                [E::Flow(f), E::Depth(d), E::Pose(t)],
            ) => dvec(&flow_residual(anchor, f, *d, t_wl, camera, t).0),
            (FactorKind::FlowPrior { measurement }, [E::Flow(f)]) => dvec(&(f - measurement)),
            (FactorKind::DepthPrior { measurement }, [E::Depth(d)]) => {
                DVector::from_element(1, d - measurement)
            }
            (FactorKind::FlowDepthPrior { measurement }, [E::FlowDepth(v)]) => {
                dvec(&(v - measurement))
            }
            (FactorKind::PointPrior { measurement }, [E::Point(x)]) => dvec(&(x - measurement)),
            _ => return None,
        };
        Some(r)
    }

    /// Squared Mahalanobis norm `eᵀ Ω e`.
    pub fn chi2_of(&self, residual: &DVector<f64>) -> f64 {
        (residual.transpose() * &self.information * residual)[(0, 0)]
    }

    pub fn chi2(&self, est: &[&Estimate]) -> Option<f64> {
        self.residual(est).map(|r| self.chi2_of(&r))
    }

    /// Camera-frame depth of the predicted point for projective factors.
    pub fn projected_depth(&self, est: &[&Estimate]) -> Option<f64> {
        use Estimate as E;
        let z = match (&self.kind, est) {
            (
                FactorKind::MonoReprojection { .. } | FactorKind::StereoReprojection { .. },
                [E::Pose(t), E::Point(x)],
            ) => t.transform_point(x).z,
            (
                FactorKind::PoseOnlyMono { point, .. } | FactorKind::PoseOnlyStereo { point, .. },
                [E::Pose(t)],
            ) => t.transform_point(point).z,
            (FactorKind::PoseOnlyBackward { point, .. }, [E::Pose(t)]) => {
                t.inverse().transform_point(point).z
            }
            (FactorKind::ObjectMotion { point, camera_pose, .. }, [E::Pose(h)]) => {
                camera_pose.transform_point(&h.transform_point(point)).z
            }
            (FactorKind::ObjectMotionPoint { camera_pose, .. }, [E::Pose(h), E::Point(x)]) => {
                camera_pose.transform_point(&h.transform_point(x)).z
            }
            (FactorKind::Sim3Forward { point, .. }, [E::Sim3(s12)]) => {
                s12.transform_point(point).z
            }
            (FactorKind::Sim3Inverse { point, .. }, [E::Sim3(s12)]) => {
                s12.inverse().transform_point(point).z
            }
            (
                FactorKind::FlowReprojection { anchor, depth, t_wl, camera },
                [E::Flow(f), E::Pose(t)],
            ) => flow_residual(anchor, f, *depth, t_wl, camera, t).1,
            (
                FactorKind::DepthReprojection { anchor, flow, t_wl, camera },
                [E::Depth(d), E::Pose(t)],
            ) => flow_residual(anchor, flow, *d, t_wl, camera, t).1,
            (
                FactorKind::FlowDepthReprojection { anchor, t_wl, camera },
                [E::FlowDepth(fd), E::Pose(t)],
            ) => {
                let flow = Vector2::new(fd.x, fd.y);
                flow_residual(anchor, &flow, fd.z, t_wl, camera, t).1
            }
            (
                FactorKind::SplitFlowDepthReprojection { anchor, t_wl, camera },
                [E::Flow(f), E::Depth(d), E::Pose(t)],
            ) => flow_residual(anchor, f, *d, t_wl, camera, t).1,
            _ => return None,
        };
        Some(z)
    }

    /// False when a projective factor's point lies on or behind the camera.
    pub fn is_depth_positive(&self, est: &[&Estimate]) -> bool {
        self.projected_depth(est).map_or(true, |z| z > 0.0)
    }

    /// Residual and Jacobians for the given (ordered) variables.
    pub fn linearize(&self, variables: &[&Variable]) -> Option<Linearization> {
        let est: Vec<&Estimate> = variables.iter().map(|v| &v.estimate).collect();
        let residual = self.residual(&est)?;
        let analytic = self.analytic_jacobians(&est);

        let mut jacobians = Vec::with_capacity(variables.len());
        for (k, var) in variables.iter().enumerate() {
            if var.fixed {
                jacobians.push(None);
                continue;
            }
            let mut jac = match analytic.as_ref().and_then(|all| all.get(k)) {
                Some(jac) => jac.clone(),
                None => self.numeric_jacobian(&est, k)?,
            };
            for c in 0..jac.ncols() {
                if var.is_frozen_direction(c) {
                    jac.column_mut(c).fill(0.0);
                }
            }
            jacobians.push(Some(jac));
        }

        Some(Linearization {
            residual,
            jacobians,
        })
    }

    /// Closed-form Jacobians of the reprojection families.
    fn analytic_jacobians(&self, est: &[&Estimate]) -> Option<Vec<DMatrix<f64>>> {
        use Estimate as E;
        match (&self.kind, est) {
            (FactorKind::MonoReprojection { camera, .. }, [E::Pose(t), E::Point(x)]) => {
                let p = t.transform_point(x);
                let de_dp = -dmat(&camera.projection_jacobian(&p));
                Some(vec![
                    &de_dp * dmat(&left_point_jacobian(&p)),
                    &de_dp * dmat(&t.rotation_matrix()),
                ])
            }
            (FactorKind::StereoReprojection { camera, .. }, [E::Pose(t), E::Point(x)]) => {
                let p = t.transform_point(x);
                let de_dp = -dmat(&camera.stereo_projection_jacobian(&p));
                Some(vec![
                    &de_dp * dmat(&left_point_jacobian(&p)),
                    &de_dp * dmat(&t.rotation_matrix()),
                ])
            }
            (FactorKind::PoseOnlyMono { point, camera, .. }, [E::Pose(t)]) => {
                let p = t.transform_point(point);
                let de_dp = -dmat(&camera.projection_jacobian(&p));
                Some(vec![de_dp * dmat(&left_point_jacobian(&p))])
            }
            (FactorKind::PoseOnlyStereo { point, camera, .. }, [E::Pose(t)]) => {
                let p = t.transform_point(point);
                let de_dp = -dmat(&camera.stereo_projection_jacobian(&p));
                Some(vec![de_dp * dmat(&left_point_jacobian(&p))])
            }
            (FactorKind::PoseOnlyBackward { point, camera, .. }, [E::Pose(t)]) => {
                // p = T⁻¹·exp(-δ)·X, so dp/dδ = Rᵀ [[X]× | -I]
                let p = t.inverse().transform_point(point);
                let mut dq = Matrix3x6::zeros();
                dq.fixed_view_mut::<3, 3>(0, 0).copy_from(&skew(point));
                dq.fixed_view_mut::<3, 3>(0, 3)
                    .copy_from(&(-Matrix3::identity()));
                let dp = t.rotation_matrix().transpose() * dq;
                Some(vec![-dmat(&camera.projection_jacobian(&p)) * dmat(&dp)])
            }
            (FactorKind::ObjectMotion { point, camera_pose, camera, .. }, [E::Pose(h)]) => {
                let q = h.transform_point(point);
                let p = camera_pose.transform_point(&q);
                let dp = camera_pose.rotation_matrix() * left_point_jacobian(&q);
                Some(vec![-dmat(&camera.projection_jacobian(&p)) * dmat(&dp)])
            }
            (
                FactorKind::ObjectMotionPoint { camera_pose, camera, .. },
                [E::Pose(h), E::Point(x)],
            ) => {
                let q = h.transform_point(x);
                let p = camera_pose.transform_point(&q);
                let r_c = camera_pose.rotation_matrix();
                let de_dp = -dmat(&camera.projection_jacobian(&p));
                Some(vec![
                    &de_dp * dmat(&(r_c * left_point_jacobian(&q))),
                    &de_dp * dmat(&(r_c * h.rotation_matrix())),
                ])
            }
            _ => None,
        }
    }

    fn numeric_jacobian(&self, est: &[&Estimate], k: usize) -> Option<DMatrix<f64>> {
        let target = est.get(k)?;
        let dim = target.dim();
        let mut jac = DMatrix::zeros(self.residual_dim(), dim);

        for c in 0..dim {
            let mut delta = DVector::zeros(dim);
            delta[c] = NUMERIC_EPS;
            let plus = target.retract(&delta);
            let minus = target.retract(&(-&delta));

            let mut perturbed: Vec<&Estimate> = est.to_vec();
            perturbed[k] = &plus;
            let r_plus = self.residual(&perturbed)?;
            perturbed[k] = &minus;
            let r_minus = self.residual(&perturbed)?;

            jac.set_column(c, &((r_plus - r_minus) / (2.0 * NUMERIC_EPS)));
        }
        Some(jac)
    }
}

/// Flow-chain residual and the camera-frame depth of the prediction.
///
/// The anchor pixel `x` is back-projected with depth `d` in the previous
/// camera, moved to world by `T_wl`, mapped by `T` and projected; the
/// measurement is the anchor displaced by the flow.
fn flow_residual(
    anchor: &Vector2<f64>,
    flow: &Vector2<f64>,
    depth: f64,
    t_wl: &SE3,
    camera: &CameraModel,
    t: &SE3,
) -> (Vector2<f64>, f64) {
    let x_world = t_wl.transform_point(&camera.unproject(anchor, depth));
    let p = t.transform_point(&x_world);
    ((anchor + flow) - camera.project(&p), p.z)
}

/// d(exp(δ)·p)/dδ at δ = 0 for the `[ω, υ]` ordering: `[-[p]× | I]`.
fn left_point_jacobian(p: &Vector3<f64>) -> Matrix3x6<f64> {
    let mut jac = Matrix3x6::zeros();
    jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(p)));
    jac.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&Matrix3::identity());
    jac
}

fn dvec<const D: usize>(v: &nalgebra::SVector<f64, D>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

fn dmat<const R: usize, const C: usize>(m: &nalgebra::SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}
