//! Sparse Levenberg-Marquardt with Schur elimination of marginalized blocks.
//!
//! Only free variables touched by at least one active factor enter the normal
//! equations. Marginalized variables are grouped by the active factors they
//! share (union-find); each group becomes one dense diagonal block that is
//! eliminated before solving the reduced system:
//!
//! ```text
//! S  = H_rr - Σ_g H_rg H_gg⁻¹ H_gr
//! S Δ_r = b_r - Σ_g H_rg H_gg⁻¹ b_g
//! Δ_g = H_gg⁻¹ (b_g - H_gr Δ_r)
//! ```
//!
//! Damping is added to every diagonal before elimination. The λ update follows
//! the gain-ratio rule of g2o, with the predicted reduction floored relative to
//! the current cost so the ratio stays meaningful near convergence. An
//! iteration in which no trial step lowers the cost ends the optimization.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::graph::Graph;
use super::variables::Estimate;

/// Solver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Fixed starting λ; otherwise `tau * max(diag(H))`.
    pub initial_lambda: Option<f64>,
    pub tau: f64,
    /// Damping trials per iteration before giving up.
    pub max_trials: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            initial_lambda: None,
            tau: 1e-5,
            max_trials: 10,
        }
    }
}

/// Outcome of one `optimize` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    /// Accepted iterations.
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// The stop flag was observed before the iteration budget ran out.
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy)]
enum Place {
    Skip,
    Reduced { offset: usize, dim: usize },
    Marginal { group: usize, offset: usize, dim: usize },
}

#[derive(Debug, Clone)]
struct Group {
    dim: usize,
}

#[derive(Debug, Clone)]
struct Layout {
    place: Vec<Place>,
    reduced: Vec<usize>,
    reduced_dim: usize,
    groups: Vec<Group>,
}

impl Layout {
    fn build(graph: &Graph) -> Self {
        let n = graph.num_variables();
        let mut touched = vec![false; n];
        for factor in graph.factors().iter().filter(|f| f.active) {
            for id in &factor.variables {
                if let Some(flag) = touched.get_mut(id.0) {
                    *flag = true;
                }
            }
        }

        let free = |idx: usize| touched[idx] && !graph.variables()[idx].fixed;
        let is_marginal = |idx: usize| free(idx) && graph.variables()[idx].marginalized;

        // Union-find over marginalized variables sharing an active factor.
        let mut parent: Vec<usize> = (0..n).collect();
        for factor in graph.factors().iter().filter(|f| f.active) {
            let mut first: Option<usize> = None;
            for id in factor.variables.iter().map(|id| id.0).filter(|&i| i < n) {
                if !is_marginal(id) {
                    continue;
                }
                match first {
                    None => first = Some(id),
                    Some(root) => {
                        let a = find(&mut parent, root);
                        let b = find(&mut parent, id);
                        if a != b {
                            parent[b] = a;
                        }
                    }
                }
            }
        }

        let mut place = vec![Place::Skip; n];
        let mut reduced = Vec::new();
        let mut reduced_dim = 0;
        let mut groups: Vec<Group> = Vec::new();
        let mut group_of_root: BTreeMap<usize, usize> = BTreeMap::new();

        for idx in 0..n {
            if !free(idx) {
                continue;
            }
            let dim = graph.variables()[idx].dim();
            if is_marginal(idx) {
                let root = find(&mut parent, idx);
                let group = *group_of_root.entry(root).or_insert_with(|| {
                    groups.push(Group { dim: 0 });
                    groups.len() - 1
                });
                let g = &mut groups[group];
                place[idx] = Place::Marginal {
                    group,
                    offset: g.dim,
                    dim,
                };
                g.dim += dim;
            } else {
                place[idx] = Place::Reduced {
                    offset: reduced_dim,
                    dim,
                };
                reduced.push(idx);
                reduced_dim += dim;
            }
        }

        Self {
            place,
            reduced,
            reduced_dim,
            groups,
        }
    }

    fn is_empty(&self) -> bool {
        self.reduced.is_empty() && self.groups.is_empty()
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Normal equations in Schur-ready form.
struct NormalEquations {
    h_rr: DMatrix<f64>,
    b_r: DVector<f64>,
    h_gg: Vec<DMatrix<f64>>,
    b_g: Vec<DVector<f64>>,
    /// Per group: reduced offset -> (reduced dim x group dim) coupling block.
    h_rg: Vec<BTreeMap<usize, DMatrix<f64>>>,
}

impl NormalEquations {
    fn zeros(layout: &Layout) -> Self {
        Self {
            h_rr: DMatrix::zeros(layout.reduced_dim, layout.reduced_dim),
            b_r: DVector::zeros(layout.reduced_dim),
            h_gg: layout
                .groups
                .iter()
                .map(|g| DMatrix::zeros(g.dim, g.dim))
                .collect(),
            b_g: layout.groups.iter().map(|g| DVector::zeros(g.dim)).collect(),
            h_rg: vec![BTreeMap::new(); layout.groups.len()],
        }
    }

    fn max_diagonal(&self) -> f64 {
        let reduced = self.h_rr.diagonal().iter().copied().fold(0.0, f64::max);
        self.h_gg
            .iter()
            .flat_map(|h| h.diagonal().iter().copied().collect::<Vec<_>>())
            .fold(reduced, f64::max)
    }
}

/// Levenberg-Marquardt over a [`Graph`].
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    pub config: SolverConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Run up to `iterations` LM iterations, polling `should_stop` before each.
    pub fn optimize(
        &self,
        graph: &mut Graph,
        iterations: usize,
        should_stop: &dyn Fn() -> bool,
    ) -> SolveSummary {
        let initial_cost = total_cost(graph);
        let mut summary = SolveSummary {
            iterations: 0,
            initial_cost,
            final_cost: initial_cost,
            stopped: false,
        };

        let layout = Layout::build(graph);
        if layout.is_empty() || iterations == 0 {
            return summary;
        }

        let mut current_cost = initial_cost;
        let mut lambda: Option<f64> = None;
        let mut nu = 2.0;

        for iter in 0..iterations {
            if should_stop() {
                summary.stopped = true;
                break;
            }

            let system = build_normal_equations(graph, &layout);
            let mut lam = lambda.unwrap_or_else(|| {
                self.config
                    .initial_lambda
                    .unwrap_or_else(|| (self.config.tau * system.max_diagonal()).max(f64::EPSILON))
            });

            let mut accepted = false;
            for _ in 0..self.config.max_trials {
                let Some((delta_r, delta_g)) = solve_damped(&system, &layout, lam) else {
                    lam *= nu;
                    nu *= 2.0;
                    continue;
                };

                let backup: Vec<Estimate> =
                    graph.variables().iter().map(|v| v.estimate.clone()).collect();
                apply_increments(graph, &layout, &delta_r, &delta_g);
                let new_cost = total_cost(graph);

                let mut scale = delta_r.dot(&(&delta_r * lam + &system.b_r));
                for (dg, bg) in delta_g.iter().zip(&system.b_g) {
                    scale += dg.dot(&(dg * lam + bg));
                }
                // Relative floor: a fixed one breaks down once the cost is tiny.
                let rho = (current_cost - new_cost) / (scale + 1e-3 * current_cost);

                if new_cost.is_finite() && rho > 0.0 {
                    let alpha = 1.0 - (2.0 * rho - 1.0).powi(3);
                    lam *= alpha.max(1.0 / 3.0);
                    nu = 2.0;
                    trace!(iter, cost = new_cost, lambda = lam, "LM step accepted");
                    current_cost = new_cost;
                    accepted = true;
                    break;
                }

                for (variable, estimate) in graph.variables_mut().iter_mut().zip(backup) {
                    variable.estimate = estimate;
                }
                lam *= nu;
                nu *= 2.0;
            }
            lambda = Some(lam);

            if !accepted {
                debug!(iter, cost = current_cost, "LM: no step reduced the cost");
                break;
            }
            summary.iterations += 1;
        }

        summary.final_cost = current_cost;
        summary
    }
}

/// Robust cost summed over active factors.
pub fn total_cost(graph: &Graph) -> f64 {
    graph
        .factors()
        .iter()
        .filter(|f| f.active)
        .filter_map(|factor| {
            let chi2 = factor.chi2(&graph.factor_estimates(factor)?)?;
            Some(match &factor.robust {
                Some(huber) => huber.cost(chi2),
                None => chi2,
            })
        })
        .sum()
}

fn build_normal_equations(graph: &Graph, layout: &Layout) -> NormalEquations {
    let mut system = NormalEquations::zeros(layout);

    for factor in graph.factors().iter().filter(|f| f.active) {
        let Some(variables) = graph.factor_variables(factor) else {
            continue;
        };
        let Some(lin) = factor.linearize(&variables) else {
            continue;
        };

        let chi2 = factor.chi2_of(&lin.residual);
        let weight = factor.robust.map_or(1.0, |h| h.weight(chi2));
        let omega = &factor.information * weight;
        let omega_e = &omega * &lin.residual;

        for (a, jac_a) in lin.jacobians.iter().enumerate() {
            let Some(jac_a) = jac_a else { continue };
            let place_a = layout.place[factor.variables[a].0];
            let jt_omega = jac_a.transpose() * &omega;
            let rhs = -(jac_a.transpose() * &omega_e);

            match place_a {
                Place::Skip => continue,
                Place::Reduced { offset, dim } => {
                    let mut rows = system.b_r.rows_mut(offset, dim);
                    rows += &rhs;
                }
                Place::Marginal { group, offset, dim } => {
                    let mut rows = system.b_g[group].rows_mut(offset, dim);
                    rows += &rhs;
                }
            }

            for (b, jac_b) in lin.jacobians.iter().enumerate() {
                let Some(jac_b) = jac_b else { continue };
                let place_b = layout.place[factor.variables[b].0];
                let block = &jt_omega * jac_b;

                match (place_a, place_b) {
                    (
                        Place::Reduced { offset: oa, dim: da },
                        Place::Reduced { offset: ob, dim: db },
                    ) => {
                        let mut view = system.h_rr.view_mut((oa, ob), (da, db));
                        view += &block;
                    }
                    (
                        Place::Marginal { group, offset: oa, dim: da },
                        Place::Marginal { offset: ob, dim: db, .. },
                    ) => {
                        let mut view = system.h_gg[group].view_mut((oa, ob), (da, db));
                        view += &block;
                    }
                    (
                        Place::Reduced { offset: oa, dim: da },
                        Place::Marginal { group, offset: ob, dim: db },
                    ) => {
                        let group_dim = layout.groups[group].dim;
                        let coupling = system.h_rg[group]
                            .entry(oa)
                            .or_insert_with(|| DMatrix::zeros(da, group_dim));
                        let mut view = coupling.view_mut((0, ob), (da, db));
                        view += &block;
                    }
                    _ => {}
                }
            }
        }
    }

    system
}

fn invert_spd(m: DMatrix<f64>) -> Option<DMatrix<f64>> {
    match m.clone().cholesky() {
        Some(chol) => Some(chol.inverse()),
        None => m.try_inverse(),
    }
}

fn solve_linear(m: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    match m.clone().cholesky() {
        Some(chol) => Some(chol.solve(rhs)),
        None => m.lu().solve(rhs),
    }
}

fn add_damping(m: &mut DMatrix<f64>, lambda: f64) {
    for k in 0..m.nrows() {
        m[(k, k)] += lambda;
    }
}

/// Solve the damped system; `None` on a singular block or non-finite step.
fn solve_damped(
    system: &NormalEquations,
    layout: &Layout,
    lambda: f64,
) -> Option<(DVector<f64>, Vec<DVector<f64>>)> {
    let mut s = system.h_rr.clone();
    add_damping(&mut s, lambda);
    let mut rhs = system.b_r.clone();

    let mut h_gg_inv = Vec::with_capacity(layout.groups.len());
    for (g, h_gg) in system.h_gg.iter().enumerate() {
        let mut damped = h_gg.clone();
        add_damping(&mut damped, lambda);
        let inv = invert_spd(damped)?;

        let couplings = &system.h_rg[g];
        for (&oi, h_ig) in couplings {
            let h_ig_inv = h_ig * &inv;
            {
                let mut rows = rhs.rows_mut(oi, h_ig.nrows());
                rows -= &h_ig_inv * &system.b_g[g];
            }
            for (&oj, h_jg) in couplings {
                let mut view = s.view_mut((oi, oj), (h_ig.nrows(), h_jg.nrows()));
                view -= &h_ig_inv * h_jg.transpose();
            }
        }
        h_gg_inv.push(inv);
    }

    let delta_r = if layout.reduced_dim > 0 {
        solve_linear(s, &rhs)?
    } else {
        DVector::zeros(0)
    };

    let mut delta_g = Vec::with_capacity(layout.groups.len());
    for (g, inv) in h_gg_inv.iter().enumerate() {
        let mut rhs_g = system.b_g[g].clone();
        for (&oi, h_ig) in &system.h_rg[g] {
            rhs_g -= h_ig.transpose() * delta_r.rows(oi, h_ig.nrows());
        }
        delta_g.push(inv * rhs_g);
    }

    let finite = delta_r.iter().all(|v| v.is_finite())
        && delta_g.iter().all(|d| d.iter().all(|v| v.is_finite()));
    finite.then_some((delta_r, delta_g))
}

fn apply_increments(
    graph: &mut Graph,
    layout: &Layout,
    delta_r: &DVector<f64>,
    delta_g: &[DVector<f64>],
) {
    for (idx, place) in layout.place.iter().enumerate() {
        let step = match *place {
            Place::Skip => continue,
            Place::Reduced { offset, dim } => delta_r.rows(offset, dim).into_owned(),
            Place::Marginal { group, offset, dim } => delta_g[group].rows(offset, dim).into_owned(),
        };
        graph.variables_mut()[idx].apply_increment(&step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CameraModel;
    use crate::geometry::SE3;
    use crate::optimizer::factors::{Factor, FactorKind, Huber};
    use crate::optimizer::variables::{Variable, VariableId};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector2, Vector3};

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 0.1)
    }

    fn never() -> bool {
        false
    }

    fn world_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                let z = 4.0 + 0.5 * ((i + j) % 3) as f64;
                points.push(Vector3::new(-1.5 + i as f64, -1.2 + 0.8 * j as f64, z));
            }
        }
        points
    }

    #[test]
    fn test_empty_graph_is_noop() {
        let mut graph = Graph::new();
        let pose = graph.add_variable(Variable::new(Estimate::Pose(SE3::identity())));
        let summary = LevenbergMarquardt::default().optimize(&mut graph, 10, &never);

        assert_eq!(summary.iterations, 0);
        assert_eq!(graph.estimate(pose), Some(&Estimate::Pose(SE3::identity())));
    }

    #[test]
    fn test_pose_only_converges() {
        let cam = camera();
        let truth = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.02, -0.03, 0.01)),
            Vector3::new(0.1, -0.05, 0.2),
        );
        let mut graph = Graph::new();
        let pose = graph.add_variable(Variable::new(Estimate::Pose(SE3::identity())));
        for x in world_points() {
            let measurement = cam.project(&truth.transform_point(&x));
            graph
                .add_factor(
                    Factor::new(
                        FactorKind::PoseOnlyMono { measurement, point: x, camera: cam },
                        vec![pose],
                    )
                    .with_robust(Some(Huber::new(5.991_f64.sqrt()))),
                )
                .unwrap();
        }

        let summary = LevenbergMarquardt::default().optimize(&mut graph, 50, &never);
        assert!(summary.final_cost < 1e-8);

        let estimate = graph.estimate(pose).unwrap().as_pose().unwrap();
        assert_relative_eq!(estimate.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_far_scene_reaches_tight_tolerance() {
        let cam = camera();
        let truth = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.01, -0.02, 0.015)),
            Vector3::new(0.08, -0.03, 0.05),
        );
        let mut graph = Graph::new();
        let pose = graph.add_variable(Variable::new(Estimate::Pose(SE3::identity())));
        for x in world_points() {
            let far = Vector3::new(x.x * 5.0, x.y * 5.0, x.z + 21.0);
            let measurement = cam.project(&truth.transform_point(&far));
            graph
                .add_factor(Factor::new(
                    FactorKind::PoseOnlyMono { measurement, point: far, camera: cam },
                    vec![pose],
                ))
                .unwrap();
        }

        LevenbergMarquardt::default().optimize(&mut graph, 10, &never);

        let estimate = graph.estimate(pose).unwrap().as_pose().unwrap();
        assert_relative_eq!(estimate.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_schur_with_marginalized_points() {
        let cam = camera();
        let anchor = SE3::identity();
        let truth = SE3::from_translation(Vector3::new(-0.3, 0.0, 0.0));
        let mut graph = Graph::new();
        let fixed = graph.add_variable(Variable::new(Estimate::Pose(anchor.clone())).fixed(true));
        let moving = graph.add_variable(Variable::new(Estimate::Pose(
            SE3::from_translation(Vector3::new(-0.25, 0.02, 0.01)),
        )));

        let mut point_ids: Vec<(VariableId, Vector3<f64>)> = Vec::new();
        for x in world_points() {
            let noisy = x + Vector3::new(0.01, -0.01, 0.02);
            let id = graph.add_variable(Variable::new(Estimate::Point(noisy)).marginalized(true));
            point_ids.push((id, x));
            for (pose_id, pose) in [(fixed, &anchor), (moving, &truth)] {
                let measurement: Vector2<f64> = cam.project(&pose.transform_point(&x));
                graph
                    .add_factor(Factor::new(
                        FactorKind::MonoReprojection { measurement, camera: cam },
                        vec![pose_id, id],
                    ))
                    .unwrap();
            }
        }

        let summary = LevenbergMarquardt::default().optimize(&mut graph, 30, &never);
        assert!(summary.final_cost < summary.initial_cost);
        assert!(summary.final_cost < 1e-6);
        assert_eq!(graph.estimate(fixed), Some(&Estimate::Pose(anchor)));
    }

    #[test]
    fn test_stop_flag_prevents_iterations() {
        let mut graph = Graph::new();
        let flow = graph.add_variable(Variable::new(Estimate::Flow(Vector2::new(3.0, 3.0))));
        graph
            .add_factor(Factor::new(
                FactorKind::FlowPrior { measurement: Vector2::zeros() },
                vec![flow],
            ))
            .unwrap();

        let summary = LevenbergMarquardt::default().optimize(&mut graph, 10, &|| true);
        assert!(summary.stopped);
        assert_eq!(summary.iterations, 0);
        assert_eq!(graph.estimate(flow), Some(&Estimate::Flow(Vector2::new(3.0, 3.0))));
    }
}
