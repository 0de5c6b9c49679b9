//! Two-frame motion drivers.
//!
//! Every variant refines one rigid transform from correspondences between a
//! previous and a current [`Frame`]. What differs is the transform's meaning
//! (camera pose, object motion), which per-point unknowns are estimated
//! jointly (flow, depth, 3D point), the information weights and the robust
//! schedule. All of that lives in a [`MotionDriverSpec`]; the named presets
//! keep each variant's numbers, round counts included.
//!
//! Conventions:
//! - `X_prev` is the previous frame's keypoint back-projected to world.
//! - Camera-pose kinds solve `T` such that `π(T · X_prev)` lands on the
//!   current keypoint, i.e. `T` maps world to the current camera.
//! - Object-motion kinds solve `H` (world frame) with the current camera pose
//!   fixed: `π(T_cw · H · X_prev)`.
//! - Flow kinds rebuild `X_prev` from the anchor pixel, depth and the
//!   previous pose, and compare against the anchor displaced by the flow.
//! - Forward/backward solves the previous-to-current camera transform `R`
//!   from camera-frame points: `π(R · x_prev)` against the current keypoint
//!   and `π(R⁻¹ · x_cur)` against the previous one. The result is still the
//!   world-to-current-camera `T = R · T_cw(previous)`, and a correspondence is
//!   an inlier only if both of its factors are.

use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OptimError, OptimResult};
use crate::frame::{CameraModel, Correspondence, Frame};
use crate::geometry::SE3;

use super::factors::{Factor, FactorKind, Huber};
use super::graph::{FactorId, Graph};
use super::robust::{run_robust, RobustSchedule};
use super::solver::{LevenbergMarquardt, SolverConfig};
use super::variables::{Estimate, Variable, VariableId};

/// Minimum number of usable correspondences for any motion driver.
pub const MIN_CORRESPONDENCES: usize = 3;

/// Which transform is solved and which per-point unknowns come with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionModelKind {
    /// World-to-current-camera transform against fixed points.
    CameraPose,
    /// Object motion with fixed points and fixed camera pose.
    ObjectMotion,
    /// Object motion with the points refined under a prior.
    ObjectMotionWithPoints,
    /// Transform plus per-point flow; depth fixed.
    Flow,
    /// Transform plus per-point depth; flow fixed.
    Depth,
    /// Transform plus a joint (flow, depth) variable per point.
    FlowDepth,
    /// Transform plus separate flow and depth variables per point.
    SplitFlowDepth,
    /// Transform constrained forward and backward for each point.
    ForwardBackward,
}

/// Information weight of a prior, possibly depending on the measured depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriorWeight {
    Constant(f64),
    /// `scale * depth^power`.
    DepthScaled { scale: f64, power: i32 },
}

impl PriorWeight {
    pub fn weight(&self, depth: f64) -> f64 {
        match *self {
            PriorWeight::Constant(w) => w,
            PriorWeight::DepthScaled { scale, power } => scale * depth.powi(power),
        }
    }
}

/// Graph recipe for one motion driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionDriverSpec {
    pub kind: MotionModelKind,
    pub schedule: RobustSchedule,

    /// Huber delta on the reprojection factors; `None` disables the kernel.
    pub huber_delta: Option<f64>,
    pub huber_delta_stereo: Option<f64>,

    /// Diagonal information of the 2D reprojection residual.
    pub reprojection_information: [f64; 2],

    pub flow_prior: f64,
    pub depth_prior: PriorWeight,
    pub point_prior: f64,

    /// Shift the origin to the point centroid while solving.
    pub centroid_preconditioning: bool,

    /// Use the stereo residual where the current frame has a right match.
    pub use_stereo: bool,

    /// Restart the transform from the initial value before every round.
    pub reset_each_round: bool,

    pub solver: SolverConfig,
}

impl Default for MotionDriverSpec {
    fn default() -> Self {
        Self::camera_tracking()
    }
}

fn single_round(iterations: usize, chi2: f64) -> RobustSchedule {
    RobustSchedule::single(iterations, chi2)
}

fn four_rounds(iterations: usize, chi2: f64, min_active: usize) -> RobustSchedule {
    RobustSchedule::uniform(4, iterations, chi2, chi2).with_min_active(min_active)
}

impl MotionDriverSpec {
    fn base(kind: MotionModelKind, schedule: RobustSchedule, huber_sq: Option<f64>) -> Self {
        Self {
            kind,
            schedule,
            huber_delta: huber_sq.map(f64::sqrt),
            huber_delta_stereo: None,
            reprojection_information: [1.0, 1.0],
            flow_prior: 1.0,
            depth_prior: PriorWeight::Constant(1.0),
            point_prior: 1.0,
            centroid_preconditioning: false,
            use_stereo: false,
            reset_each_round: true,
            solver: SolverConfig::default(),
        }
    }

    /// Camera pose from previous-frame points, one tight round.
    pub fn camera_tracking() -> Self {
        Self::base(MotionModelKind::CameraPose, single_round(100, 0.25), Some(0.25))
    }

    /// Camera pose jointly with the flow of each point.
    pub fn camera_flow_tracking() -> Self {
        Self {
            reprojection_information: [0.1, 0.1],
            flow_prior: 0.3,
            ..Self::base(MotionModelKind::Flow, single_round(100, 0.04), Some(0.04))
        }
    }

    /// Classic four-round pose-only optimization with mono/stereo gates.
    pub fn frame_pose() -> Self {
        Self {
            schedule: RobustSchedule::uniform(4, 10, 5.991, 7.815).with_min_active(10),
            huber_delta_stereo: Some(7.815_f64.sqrt()),
            use_stereo: true,
            ..Self::base(MotionModelKind::CameraPose, RobustSchedule::default(), Some(5.991))
        }
    }

    /// Object pose (camera-relative) over four rounds.
    pub fn object_pose() -> Self {
        Self::base(MotionModelKind::CameraPose, four_rounds(10, 5.991, 10), Some(5.991))
    }

    /// Object pose with centroid preconditioning.
    pub fn object_pose_centered() -> Self {
        Self {
            centroid_preconditioning: true,
            ..Self::base(MotionModelKind::CameraPose, four_rounds(10, 4.0, 5), Some(4.0))
        }
    }

    /// Object motion against a fixed camera projection, no kernel.
    pub fn object_motion() -> Self {
        Self::base(MotionModelKind::ObjectMotion, single_round(100, 0.09), None)
    }

    /// Object motion jointly with its 3D points.
    pub fn object_motion_with_points() -> Self {
        Self {
            reprojection_information: [17.6, 80.5],
            point_prior: 531.3777,
            ..Self::base(MotionModelKind::ObjectMotionWithPoints, single_round(500, 5.991), None)
        }
    }

    pub fn flow() -> Self {
        Self {
            reprojection_information: [0.02, 0.02],
            ..Self::base(MotionModelKind::Flow, single_round(1000, 4.0), Some(4.0))
        }
    }

    pub fn flow_refined() -> Self {
        Self {
            reprojection_information: [0.1, 0.1],
            flow_prior: 0.5,
            ..Self::base(MotionModelKind::Flow, single_round(200, 0.01), Some(0.01))
        }
    }

    /// Depth refinement; the prior tightens with depth.
    pub fn depth() -> Self {
        Self {
            depth_prior: PriorWeight::DepthScaled {
                scale: 0.15 / 362.5,
                power: 2,
            },
            ..Self::base(MotionModelKind::Depth, single_round(500, 4.0), Some(4.0))
        }
    }

    pub fn flow_depth() -> Self {
        Self::base(MotionModelKind::FlowDepth, four_rounds(100, 4.0, 5), Some(4.0))
    }

    pub fn flow_depth_weighted() -> Self {
        Self {
            reprojection_information: [12.0, 196.0],
            depth_prior: PriorWeight::DepthScaled {
                scale: 0.01,
                power: 1,
            },
            ..Self::base(MotionModelKind::FlowDepth, single_round(200, 4.0), None)
        }
    }

    pub fn split_flow_depth() -> Self {
        Self {
            reprojection_information: [12.0, 196.0],
            depth_prior: PriorWeight::Constant(10.0),
            ..Self::base(MotionModelKind::SplitFlowDepth, single_round(200, 5.991), None)
        }
    }

    pub fn forward_backward() -> Self {
        Self::base(MotionModelKind::ForwardBackward, four_rounds(100, 4.0, 10), Some(4.0))
    }

    fn huber(&self) -> Option<Huber> {
        self.huber_delta.map(Huber::new)
    }

    fn huber_stereo(&self) -> Option<Huber> {
        self.huber_delta_stereo.or(self.huber_delta).map(Huber::new)
    }

    fn is_object_motion(&self) -> bool {
        matches!(
            self.kind,
            MotionModelKind::ObjectMotion | MotionModelKind::ObjectMotionWithPoints
        )
    }
}

/// Result of a motion driver.
#[derive(Debug, Clone)]
pub struct MotionResult {
    /// Refined transform (T for camera-pose and flow kinds, H for object motion).
    pub transform: SE3,
    /// Per correspondence; unusable correspondences are outliers.
    pub inliers: Vec<bool>,
    pub inlier_count: usize,
    /// Refined flow per correspondence, for kinds that estimate it.
    pub flows: Vec<Option<Vector2<f64>>>,
    /// Refined depth per correspondence, for kinds that estimate it.
    pub depths: Vec<Option<f64>>,
    /// Refined world points, for object motion with points.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Mean sqrt(chi2) over inliers after the last round.
    pub reprojection_error: f64,
    pub rounds_run: usize,
}

impl MotionResult {
    /// Nothing could be estimated: the initial transform, no inliers.
    pub fn no_solution(initial: &SE3, n: usize) -> Self {
        Self {
            transform: initial.clone(),
            inliers: vec![false; n],
            inlier_count: 0,
            flows: vec![None; n],
            depths: vec![None; n],
            points: vec![None; n],
            reprojection_error: 0.0,
            rounds_run: 0,
        }
    }

    pub fn is_solution(&self) -> bool {
        self.rounds_run > 0
    }
}

/// One usable correspondence, copied out of the frames.
#[derive(Debug, Clone)]
pub(crate) struct MotionMeasurement {
    pub corr_idx: usize,
    /// Previous keypoint.
    pub anchor: Vector2<f64>,
    /// Current keypoint.
    pub observed: Vector2<f64>,
    pub depth: f64,
    pub flow: Vector2<f64>,
    pub x_prev_world: Vector3<f64>,
    pub x_cur_world: Option<Vector3<f64>>,
    pub x_prev_camera: Vector3<f64>,
    pub x_cur_camera: Option<Vector3<f64>>,
    pub u_right: Option<f64>,
}

/// Snapshot the usable correspondences. Indices outside either frame are a
/// caller bug; missing depth just drops the pair.
pub(crate) fn gather_measurements(
    previous: &Frame,
    current: &Frame,
    correspondences: &[Correspondence],
) -> OptimResult<Vec<MotionMeasurement>> {
    let mut measurements = Vec::with_capacity(correspondences.len());
    for (corr_idx, corr) in correspondences.iter().enumerate() {
        if corr.previous >= previous.num_keypoints() || corr.current >= current.num_keypoints() {
            return Err(OptimError::InvalidInput(format!(
                "correspondence {} -> {} outside frames of {} / {} keypoints",
                corr.previous,
                corr.current,
                previous.num_keypoints(),
                current.num_keypoints()
            )));
        }
        let (Some(depth), Some(x_prev_world), Some(x_prev_camera)) = (
            previous.depth(corr.previous),
            previous.unproject_world(corr.previous),
            previous.unproject_camera(corr.previous),
        ) else {
            continue;
        };
        let anchor = previous.keypoints[corr.previous];
        let observed = current.keypoints[corr.current];
        measurements.push(MotionMeasurement {
            corr_idx,
            anchor,
            observed,
            depth,
            flow: previous.flow(corr.previous).unwrap_or(observed - anchor),
            x_prev_world,
            x_cur_world: current.unproject_world(corr.current),
            x_prev_camera,
            x_cur_camera: current.unproject_camera(corr.current),
            u_right: current.stereo_u(corr.current),
        });
    }
    Ok(measurements)
}

/// Translation to the centroid of both frames' points.
fn centroid_shift(measurements: &[MotionMeasurement]) -> SE3 {
    let mut sum = Vector3::zeros();
    let mut count: f64 = 0.0;
    for m in measurements {
        sum += m.x_prev_world;
        count += 1.0;
        if let Some(x) = m.x_cur_world {
            sum += x;
            count += 1.0;
        }
    }
    SE3::from_translation(sum / count.max(1.0))
}

struct MotionGraph {
    graph: Graph,
    transform: VariableId,
    /// Gated factor of each measurement (forward one for forward/backward).
    primary: Vec<FactorId>,
    /// Backward factor of each measurement, forward/backward only.
    secondary: Vec<Option<FactorId>>,
    flow_vars: Vec<Option<VariableId>>,
    depth_vars: Vec<Option<VariableId>>,
    flow_depth_vars: Vec<Option<VariableId>>,
    point_vars: Vec<Option<VariableId>>,
}

fn diagonal(values: &[f64]) -> DMatrix<f64> {
    DMatrix::from_diagonal(&DVector::from_column_slice(values))
}

fn build_motion_graph(
    spec: &MotionDriverSpec,
    previous: &Frame,
    current: &Frame,
    measurements: &[MotionMeasurement],
    initial: &SE3,
    shift: &SE3,
) -> OptimResult<MotionGraph> {
    let shift_inv = shift.inverse();
    let start = if spec.is_object_motion() {
        shift_inv.compose(initial).compose(shift)
    } else if spec.kind == MotionModelKind::ForwardBackward {
        initial.compose(&previous.pose)
    } else {
        initial.compose(shift)
    };

    let mut graph = Graph::new();
    let transform = graph.add_variable(
        Variable::new(Estimate::Pose(start)).reset_each_round(spec.reset_each_round),
    );

    let camera: CameraModel = current.camera;
    let camera_pose = current.pose_cw().compose(shift);
    let t_wl = shift_inv.compose(&previous.pose);
    let reproj_info = diagonal(&spec.reprojection_information);

    let n = measurements.len();
    let mut mg = MotionGraph {
        graph,
        transform,
        primary: Vec::with_capacity(n),
        secondary: vec![None; n],
        flow_vars: vec![None; n],
        depth_vars: vec![None; n],
        flow_depth_vars: vec![None; n],
        point_vars: vec![None; n],
    };

    for (k, m) in measurements.iter().enumerate() {
        let x_prev = shift_inv.transform_point(&m.x_prev_world);
        let graph = &mut mg.graph;

        let primary = match spec.kind {
            MotionModelKind::CameraPose => match m.u_right.filter(|_| spec.use_stereo) {
                Some(u_right) => Factor::new(
                    FactorKind::PoseOnlyStereo {
                        measurement: Vector3::new(m.observed.x, m.observed.y, u_right),
                        point: x_prev,
                        camera,
                    },
                    vec![transform],
                )
                .with_diagonal_information(&[spec.reprojection_information[0]])
                .with_robust(spec.huber_stereo()),
                None => Factor::new(
                    FactorKind::PoseOnlyMono {
                        measurement: m.observed,
                        point: x_prev,
                        camera,
                    },
                    vec![transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber()),
            },
            MotionModelKind::ObjectMotion => Factor::new(
                FactorKind::ObjectMotion {
                    measurement: m.observed,
                    point: x_prev,
                    camera_pose: camera_pose.clone(),
                    camera,
                },
                vec![transform],
            )
            .with_information(reproj_info.clone())
            .with_robust(spec.huber()),
            MotionModelKind::ObjectMotionWithPoints => {
                let point = graph.add_variable(Variable::new(Estimate::Point(x_prev)).marginalized(true));
                graph.add_factor(
                    Factor::new(FactorKind::PointPrior { measurement: x_prev }, vec![point])
                        .with_diagonal_information(&[spec.point_prior]),
                )?;
                mg.point_vars[k] = Some(point);
                Factor::new(
                    FactorKind::ObjectMotionPoint {
                        measurement: m.observed,
                        camera_pose: camera_pose.clone(),
                        camera,
                    },
                    vec![transform, point],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
            MotionModelKind::Flow => {
                let flow = add_flow(graph, m.flow, spec.flow_prior)?;
                mg.flow_vars[k] = Some(flow);
                Factor::new(
                    FactorKind::FlowReprojection {
                        anchor: m.anchor,
                        depth: m.depth,
                        t_wl: t_wl.clone(),
                        camera,
                    },
                    vec![flow, transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
            MotionModelKind::Depth => {
                let depth = add_depth(graph, m.depth, spec.depth_prior.weight(m.depth))?;
                mg.depth_vars[k] = Some(depth);
                Factor::new(
                    FactorKind::DepthReprojection {
                        anchor: m.anchor,
                        flow: m.flow,
                        t_wl: t_wl.clone(),
                        camera,
                    },
                    vec![depth, transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
            MotionModelKind::FlowDepth => {
                let value = Vector3::new(m.flow.x, m.flow.y, m.depth);
                let var = graph.add_variable(Variable::new(Estimate::FlowDepth(value)).marginalized(true));
                graph.add_factor(
                    Factor::new(FactorKind::FlowDepthPrior { measurement: value }, vec![var])
                        .with_diagonal_information(&[
                            spec.flow_prior,
                            spec.flow_prior,
                            spec.depth_prior.weight(m.depth),
                        ]),
                )?;
                mg.flow_depth_vars[k] = Some(var);
                Factor::new(
                    FactorKind::FlowDepthReprojection {
                        anchor: m.anchor,
                        t_wl: t_wl.clone(),
                        camera,
                    },
                    vec![var, transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
            MotionModelKind::SplitFlowDepth => {
                let flow = add_flow(graph, m.flow, spec.flow_prior)?;
                let depth = add_depth(graph, m.depth, spec.depth_prior.weight(m.depth))?;
                mg.flow_vars[k] = Some(flow);
                mg.depth_vars[k] = Some(depth);
                Factor::new(
                    FactorKind::SplitFlowDepthReprojection {
                        anchor: m.anchor,
                        t_wl: t_wl.clone(),
                        camera,
                    },
                    vec![flow, depth, transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
            MotionModelKind::ForwardBackward => {
                if let Some(x_cur) = m.x_cur_camera {
                    let backward = graph.add_factor(
                        Factor::new(
                            FactorKind::PoseOnlyBackward {
                                measurement: m.anchor,
                                point: x_cur,
                                camera: previous.camera,
                            },
                            vec![transform],
                        )
                        .with_information(reproj_info.clone())
                        .with_robust(spec.huber()),
                    )?;
                    mg.secondary[k] = Some(backward);
                }
                Factor::new(
                    FactorKind::PoseOnlyMono {
                        measurement: m.observed,
                        point: m.x_prev_camera,
                        camera,
                    },
                    vec![transform],
                )
                .with_information(reproj_info.clone())
                .with_robust(spec.huber())
            }
        };
        let id = graph.add_factor(primary)?;
        mg.primary.push(id);
    }

    Ok(mg)
}

fn add_flow(graph: &mut Graph, flow: Vector2<f64>, weight: f64) -> OptimResult<VariableId> {
    let var = graph.add_variable(Variable::new(Estimate::Flow(flow)).marginalized(true));
    graph.add_factor(
        Factor::new(FactorKind::FlowPrior { measurement: flow }, vec![var])
            .with_diagonal_information(&[weight]),
    )?;
    Ok(var)
}

fn add_depth(graph: &mut Graph, depth: f64, weight: f64) -> OptimResult<VariableId> {
    let var = graph.add_variable(Variable::new(Estimate::Depth(depth)).marginalized(true));
    graph.add_factor(
        Factor::new(FactorKind::DepthPrior { measurement: depth }, vec![var])
            .with_diagonal_information(&[weight]),
    )?;
    Ok(var)
}

/// Run the driver described by `spec`.
///
/// `initial` is the starting transform (camera T_cw guess, or object motion
/// H). With fewer than [`MIN_CORRESPONDENCES`] usable pairs the result is
/// [`MotionResult::no_solution`].
pub fn optimize_motion(
    spec: &MotionDriverSpec,
    previous: &Frame,
    current: &Frame,
    correspondences: &[Correspondence],
    initial: &SE3,
) -> OptimResult<MotionResult> {
    let n = correspondences.len();
    let measurements = gather_measurements(previous, current, correspondences)?;
    if measurements.len() < MIN_CORRESPONDENCES {
        debug!(
            "{}",
            OptimError::InsufficientCorrespondences {
                found: measurements.len(),
                required: MIN_CORRESPONDENCES,
            }
        );
        return Ok(MotionResult::no_solution(initial, n));
    }

    let result = solve_motion(spec, previous, current, &measurements, initial, n)?;
    info!(
        "{:?} motion: {}/{} inliers, reprojection error {:.4}",
        spec.kind,
        result.inlier_count,
        measurements.len(),
        result.reprojection_error
    );
    Ok(result)
}

/// Build and solve the graph for already gathered measurements. Result
/// vectors have `n` slots indexed by `corr_idx`.
pub(crate) fn solve_motion(
    spec: &MotionDriverSpec,
    previous: &Frame,
    current: &Frame,
    measurements: &[MotionMeasurement],
    initial: &SE3,
    n: usize,
) -> OptimResult<MotionResult> {
    let precondition = spec.centroid_preconditioning && spec.kind != MotionModelKind::ForwardBackward;
    if spec.centroid_preconditioning && !precondition {
        debug!("centroid preconditioning ignored for forward/backward motion");
    }
    let shift = if precondition {
        centroid_shift(measurements)
    } else {
        SE3::identity()
    };

    let mut mg = build_motion_graph(spec, previous, current, measurements, initial, &shift)?;
    let solver = LevenbergMarquardt::new(spec.solver.clone());
    let outcome = run_robust(&mut mg.graph, &solver, &spec.schedule, &|| false);

    let solved = mg
        .graph
        .estimate(mg.transform)
        .and_then(Estimate::as_pose)
        .cloned()
        .unwrap_or_else(|| initial.clone());
    let shift_inv = shift.inverse();
    let transform = if spec.is_object_motion() {
        shift.compose(&solved).compose(&shift_inv)
    } else if spec.kind == MotionModelKind::ForwardBackward {
        solved.compose(&previous.pose_cw())
    } else {
        solved.compose(&shift_inv)
    };

    let mut result = MotionResult::no_solution(&transform, n);
    result.rounds_run = outcome.rounds_run;

    let mut error_sum = 0.0;
    for (k, m) in measurements.iter().enumerate() {
        let factor_id = mg.primary[k];
        let active = |id: FactorId| outcome.inliers.get(id.0).copied().unwrap_or(false);
        let inlier = active(factor_id) && mg.secondary[k].map_or(true, active);
        result.inliers[m.corr_idx] = inlier;
        if inlier {
            result.inlier_count += 1;
            error_sum += mg.graph.factor_chi2(factor_id).unwrap_or(0.0).sqrt();
        }

        let estimate = |var: Option<VariableId>| var.and_then(|id| mg.graph.estimate(id));
        if let Some(est) = estimate(mg.flow_depth_vars[k]).and_then(Estimate::as_flow_depth) {
            result.flows[m.corr_idx] = Some(Vector2::new(est.x, est.y));
            result.depths[m.corr_idx] = Some(est.z);
        }
        if let Some(flow) = estimate(mg.flow_vars[k]).and_then(Estimate::as_flow) {
            result.flows[m.corr_idx] = Some(*flow);
        }
        if let Some(depth) = estimate(mg.depth_vars[k]).and_then(Estimate::as_depth) {
            result.depths[m.corr_idx] = Some(depth);
        }
        if let Some(point) = estimate(mg.point_vars[k]).and_then(Estimate::as_point) {
            result.points[m.corr_idx] = Some(shift.transform_point(point));
        }
    }
    if result.inlier_count > 0 {
        result.reprojection_error = error_sum / result.inlier_count as f64;
    }

    Ok(result)
}

#[cfg(test)]
pub(crate) mod test_scene {
    //! Two synthetic frames observing a rigid point cloud.

    use nalgebra::{UnitQuaternion, Vector2, Vector3};

    use crate::frame::{CameraModel, Correspondence, Frame};
    use crate::geometry::SE3;

    pub fn camera() -> CameraModel {
        CameraModel::new(520.0, 520.0, 320.0, 240.0, 0.12)
    }

    /// Points in the previous camera frame.
    pub fn points(n: usize, base_depth: f64) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|k| {
                let u = (k % 5) as f64 - 2.0;
                let v = (k / 5) as f64 - 2.0;
                Vector3::new(0.35 * u, 0.3 * v, base_depth + 0.4 * ((k * 7) % 5) as f64)
            })
            .collect()
    }

    pub fn small_motion() -> SE3 {
        SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.01, -0.02, 0.015)),
            Vector3::new(0.08, -0.03, 0.05),
        )
    }

    /// Frames where `previous` sits at `prev_pose` (T_wc), `current` at
    /// `cur_pose`, and world points move by `motion` in between.
    pub struct Scene {
        pub previous: Frame,
        pub current: Frame,
        pub correspondences: Vec<Correspondence>,
        /// World-to-current-camera transform of the previous points.
        pub t_true: SE3,
    }

    pub fn scene(prev_pose: SE3, cur_pose: SE3, motion: SE3, cam_points: &[Vector3<f64>]) -> Scene {
        let cam = camera();
        let mut prev_kps = Vec::new();
        let mut prev_depths = Vec::new();
        let mut cur_kps = Vec::new();
        let mut cur_depths = Vec::new();
        let t_true = cur_pose.inverse().compose(&motion);

        for x_c in cam_points {
            let x_w = prev_pose.transform_point(x_c);
            let x_cur = t_true.transform_point(&x_w);
            prev_kps.push(cam.project(x_c));
            prev_depths.push(x_c.z);
            cur_kps.push(cam.project(&x_cur));
            cur_depths.push(x_cur.z);
        }
        let flows: Vec<Vector2<f64>> = prev_kps.iter().zip(&cur_kps).map(|(p, c)| c - p).collect();
        let n = cam_points.len();

        Scene {
            previous: Frame::new(cam, prev_pose, prev_kps, prev_depths, flows),
            current: Frame::new(cam, cur_pose, cur_kps, cur_depths, vec![Vector2::zeros(); n]),
            correspondences: (0..n).map(|k| Correspondence::new(k, k)).collect(),
            t_true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_scene::*;
    use super::*;
    use approx::assert_relative_eq;

    fn assert_pose_close(a: &SE3, b: &SE3, eps: f64) {
        assert_relative_eq!(a.translation, b.translation, epsilon = eps);
        assert!(a.rotation.angle_to(&b.rotation) < eps);
    }

    fn perturbed(t: &SE3) -> SE3 {
        SE3::from_translation(Vector3::new(0.03, -0.02, 0.04)).compose(t)
    }

    #[test]
    fn test_camera_tracking_converges() {
        let s = scene(SE3::identity(), small_motion().inverse(), SE3::identity(), &points(20, 4.0));
        let result = optimize_motion(
            &MotionDriverSpec::camera_tracking(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &perturbed(&s.t_true),
        )
        .unwrap();

        assert_eq!(result.inlier_count, 20);
        assert!(result.reprojection_error < 1e-4);
        assert_pose_close(&result.transform, &s.t_true, 1e-6);
    }

    #[test]
    fn test_too_few_correspondences_returns_initial() {
        let s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(10, 4.0));
        let initial = SE3::from_translation(Vector3::new(1.0, 2.0, 3.0));
        let result = optimize_motion(
            &MotionDriverSpec::object_pose(),
            &s.previous,
            &s.current,
            &s.correspondences[..2],
            &initial,
        )
        .unwrap();

        assert_eq!(result.transform, initial);
        assert_eq!(result.inlier_count, 0);
        assert!(!result.is_solution());
    }

    #[test]
    fn test_out_of_range_index_is_an_error() {
        let s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(5, 4.0));
        let bad = vec![Correspondence::new(0, 0), Correspondence::new(9, 1)];
        let result = optimize_motion(
            &MotionDriverSpec::default(),
            &s.previous,
            &s.current,
            &bad,
            &SE3::identity(),
        );
        assert!(matches!(result, Err(OptimError::InvalidInput(_))));
    }

    #[test]
    fn test_object_pose_rejects_injected_outliers() {
        let mut s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(25, 4.0));
        let outliers = [2, 9, 13, 21];
        for &k in &outliers {
            s.current.keypoints[k] += Vector2::new(50.0, -50.0);
        }

        let result = optimize_motion(
            &MotionDriverSpec::object_pose(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &SE3::identity(),
        )
        .unwrap();

        assert_eq!(result.inlier_count, 21);
        for (k, inlier) in result.inliers.iter().enumerate() {
            assert_eq!(*inlier, !outliers.contains(&k), "correspondence {}", k);
        }
        assert_pose_close(&result.transform, &s.t_true, 1e-6);
    }

    #[test]
    fn test_centroid_preconditioning_gives_same_transform() {
        let s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(20, 25.0));
        let result = optimize_motion(
            &MotionDriverSpec::object_pose_centered(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &SE3::identity(),
        )
        .unwrap();

        assert_eq!(result.inlier_count, 20);
        assert_pose_close(&result.transform, &s.t_true, 1e-5);
    }

    #[test]
    fn test_object_motion_recovers_h() {
        let prev_pose = SE3::from_translation(Vector3::new(0.0, 0.0, -1.0));
        let cur_pose = SE3::from_translation(Vector3::new(0.1, 0.0, -0.9));
        let motion = small_motion();
        let s = scene(prev_pose, cur_pose, motion.clone(), &points(20, 5.0));

        for spec in [
            MotionDriverSpec::object_motion(),
            MotionDriverSpec::object_motion_with_points(),
        ] {
            let result = optimize_motion(&spec, &s.previous, &s.current, &s.correspondences, &SE3::identity())
                .unwrap();
            assert_eq!(result.inlier_count, 20, "{:?}", spec.kind);
            assert_pose_close(&result.transform, &motion, 1e-4);
        }
    }

    #[test]
    fn test_flow_and_depth_variants_converge() {
        let s = scene(
            SE3::from_translation(Vector3::new(0.2, 0.0, 0.0)),
            small_motion().inverse(),
            SE3::identity(),
            &points(20, 4.0),
        );
        let specs = [
            MotionDriverSpec::camera_flow_tracking(),
            MotionDriverSpec::flow(),
            MotionDriverSpec::flow_refined(),
            MotionDriverSpec::depth(),
            MotionDriverSpec::flow_depth(),
            MotionDriverSpec::flow_depth_weighted(),
            MotionDriverSpec::split_flow_depth(),
        ];

        for spec in specs {
            let result = optimize_motion(
                &spec,
                &s.previous,
                &s.current,
                &s.correspondences,
                &perturbed(&s.t_true),
            )
            .unwrap();
            assert_eq!(result.inlier_count, 20, "{:?}", spec.kind);
            assert_pose_close(&result.transform, &s.t_true, 1e-4);
        }
    }

    #[test]
    fn test_flow_depth_reports_refined_values() {
        let s = scene(SE3::identity(), small_motion().inverse(), SE3::identity(), &points(15, 4.0));
        let result = optimize_motion(
            &MotionDriverSpec::flow_depth(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &s.t_true,
        )
        .unwrap();

        for k in 0..15 {
            let flow = result.flows[k].unwrap();
            assert_relative_eq!(flow, s.previous.flows[k], epsilon = 1e-6);
            assert_relative_eq!(result.depths[k].unwrap(), s.previous.depths[k], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_forward_backward_converges() {
        let s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(20, 4.0));
        let mut spec = MotionDriverSpec::forward_backward();
        spec.centroid_preconditioning = true;

        let result = optimize_motion(&spec, &s.previous, &s.current, &s.correspondences, &SE3::identity())
            .unwrap();
        assert_eq!(result.inlier_count, 20);
        assert_pose_close(&result.transform, &s.t_true, 1e-6);
    }

    #[test]
    fn test_forward_backward_with_moving_cameras() {
        let prev_pose = SE3::from_translation(Vector3::new(0.2, 0.0, 0.0));
        let cur_pose = small_motion().inverse();
        let s = scene(prev_pose, cur_pose, SE3::identity(), &points(20, 4.0));

        let result = optimize_motion(
            &MotionDriverSpec::forward_backward(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &SE3::identity(),
        )
        .unwrap();
        assert_eq!(result.inlier_count, 20);
        assert_pose_close(&result.transform, &s.t_true, 1e-6);
    }

    #[test]
    fn test_forward_backward_inlier_needs_both_directions() {
        let mut s = scene(SE3::identity(), SE3::identity(), small_motion(), &points(20, 4.0));
        // Only the backward factor sees the current depth.
        s.current.depths[6] *= 0.5;

        let result = optimize_motion(
            &MotionDriverSpec::forward_backward(),
            &s.previous,
            &s.current,
            &s.correspondences,
            &SE3::identity(),
        )
        .unwrap();
        assert!(!result.inliers[6]);
        assert_eq!(result.inlier_count, 19);
        assert_pose_close(&result.transform, &s.t_true, 1e-6);
    }

    #[test]
    fn test_prior_weight() {
        let w = PriorWeight::DepthScaled {
            scale: 0.5,
            power: 2,
        };
        assert_relative_eq!(w.weight(4.0), 8.0);
        assert_eq!(PriorWeight::Constant(3.0).weight(100.0), 3.0);
    }
}
