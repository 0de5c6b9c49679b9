//! Robust iteration controller.
//!
//! Runs the solver in rounds. After each round every gated factor (inactive
//! ones included, so rejected measurements can come back) is classified
//! against the round's chi2 threshold; outliers are deactivated for the next
//! round. Kernels can be dropped once the inlier set has settled, and the loop
//! ends early when too few gated factors remain active.
//!
//! A chi2 that is not a number never passes a gate. With
//! `reject_worst_per_point`, a round newly rejects only the worst chi2 failure
//! among the active factors sharing a marginalized variable; the others stay
//! active so the refit can tell which observation was corrupted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::factors::Gate;
use super::graph::Graph;
use super::solver::LevenbergMarquardt;

/// One optimize-then-classify round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobustRound {
    pub iterations: usize,
    /// Threshold for 2D residuals.
    pub chi2_mono: f64,
    /// Threshold for 3D (stereo) residuals.
    pub chi2_stereo: f64,
}

impl RobustRound {
    pub fn new(iterations: usize, chi2_mono: f64, chi2_stereo: f64) -> Self {
        Self {
            iterations,
            chi2_mono,
            chi2_stereo,
        }
    }

    fn threshold(&self, gate: Gate) -> Option<f64> {
        match gate {
            Gate::None => None,
            Gate::Mono => Some(self.chi2_mono),
            Gate::Stereo => Some(self.chi2_stereo),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustSchedule {
    pub rounds: Vec<RobustRound>,
    /// Round index after which kernels are removed from gated factors.
    pub kernel_off_after: Option<usize>,
    /// Stop early when fewer gated factors than this remain active.
    pub min_active: usize,
    /// Per marginalized variable, reject at most one chi2 failure per round.
    #[serde(default)]
    pub reject_worst_per_point: bool,
}

impl RobustSchedule {
    /// `rounds` identical rounds; kernels come off before the last one.
    pub fn uniform(rounds: usize, iterations: usize, chi2_mono: f64, chi2_stereo: f64) -> Self {
        Self {
            rounds: vec![RobustRound::new(iterations, chi2_mono, chi2_stereo); rounds],
            kernel_off_after: rounds.checked_sub(2),
            min_active: 5,
            reject_worst_per_point: false,
        }
    }

    /// A single round with one threshold for every gate.
    pub fn single(iterations: usize, chi2: f64) -> Self {
        Self::uniform(1, iterations, chi2, chi2)
    }

    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active;
        self
    }

    pub fn with_kernel_off_after(mut self, round: Option<usize>) -> Self {
        self.kernel_off_after = round;
        self
    }

    pub fn with_worst_per_point(mut self, enabled: bool) -> Self {
        self.reject_worst_per_point = enabled;
        self
    }
}

impl Default for RobustSchedule {
    fn default() -> Self {
        Self::uniform(4, 10, 5.991, 7.815)
    }
}

/// Classification after the last round that ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustOutcome {
    /// Per factor: active after classification.
    pub inliers: Vec<bool>,
    /// Active gated factors.
    pub inlier_count: usize,
    pub rounds_run: usize,
    pub stopped: bool,
}

/// Run `schedule` on `graph`.
pub fn run_robust(
    graph: &mut Graph,
    solver: &LevenbergMarquardt,
    schedule: &RobustSchedule,
    should_stop: &dyn Fn() -> bool,
) -> RobustOutcome {
    let mut rounds_run = 0;
    let mut stopped = false;

    for (round_idx, round) in schedule.rounds.iter().enumerate() {
        graph.reset_flagged();

        let summary = solver.optimize(graph, round.iterations, should_stop);
        rounds_run += 1;
        if summary.stopped {
            stopped = true;
            break;
        }

        let active = classify(graph, round, schedule.reject_worst_per_point);
        debug!(
            round = round_idx,
            iterations = summary.iterations,
            cost = summary.final_cost,
            active,
            "robust round"
        );

        if schedule.kernel_off_after == Some(round_idx) {
            for factor in graph.factors_mut().iter_mut() {
                if factor.gate != Gate::None {
                    factor.robust = None;
                }
            }
        }

        if active < schedule.min_active {
            break;
        }
    }

    let inliers: Vec<bool> = graph.factors().iter().map(|f| f.active).collect();
    let inlier_count = gated_active(graph);
    RobustOutcome {
        inliers,
        inlier_count,
        rounds_run,
        stopped,
    }
}

/// Verdict for one gated factor.
struct Verdict {
    chi2: f64,
    chi2_ok: bool,
    depth_ok: bool,
    was_active: bool,
}

/// Re-classify every gated factor; returns the active gated count.
fn classify(graph: &mut Graph, round: &RobustRound, worst_per_point: bool) -> usize {
    let verdicts: Vec<Option<Verdict>> = graph
        .factors()
        .iter()
        .map(|factor| {
            let threshold = round.threshold(factor.gate)?;
            let estimates = graph.factor_estimates(factor)?;
            let chi2 = factor.chi2(&estimates)?;
            Some(Verdict {
                chi2,
                chi2_ok: chi2 <= threshold,
                depth_ok: factor.is_depth_positive(&estimates),
                was_active: factor.active,
            })
        })
        .collect();

    // Factors still active whose only failure is chi2 may be spared: per
    // marginalized variable, only the worst of them is rejected this round.
    let mut spared = vec![false; verdicts.len()];
    if worst_per_point {
        let mut groups: HashMap<usize, Vec<(usize, f64)>> = HashMap::new();
        for (idx, (factor, verdict)) in graph.factors().iter().zip(&verdicts).enumerate() {
            let Some(v) = verdict else {
                continue;
            };
            if v.chi2_ok || !v.depth_ok || !v.was_active {
                continue;
            }
            let anchor = factor
                .variables
                .iter()
                .find(|id| graph.variable(**id).is_some_and(|var| var.marginalized));
            if let Some(anchor) = anchor {
                let chi2 = if v.chi2.is_nan() { f64::INFINITY } else { v.chi2 };
                groups.entry(anchor.0).or_default().push((idx, chi2));
            }
        }
        for failures in groups.values() {
            let worst = failures
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|&(idx, _)| idx);
            for &(idx, _) in failures {
                spared[idx] = Some(idx) != worst;
            }
        }
    }

    for ((factor, verdict), spare) in graph.factors_mut().iter_mut().zip(verdicts).zip(spared) {
        if let Some(v) = verdict {
            factor.active = (v.chi2_ok && v.depth_ok) || spare;
        }
    }
    gated_active(graph)
}

fn gated_active(graph: &Graph) -> usize {
    graph
        .factors()
        .iter()
        .filter(|f| f.gate != Gate::None && f.active)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CameraModel;
    use crate::geometry::SE3;
    use crate::optimizer::factors::{Factor, FactorKind, Huber};
    use crate::optimizer::variables::{Estimate, Variable};
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};

    fn never() -> bool {
        false
    }

    fn pose_graph(outliers: &[usize]) -> (Graph, SE3) {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, 0.1);
        let truth = SE3::from_translation(Vector3::new(0.1, -0.1, 0.05));
        let mut graph = Graph::new();
        let pose = graph.add_variable(Variable::new(Estimate::Pose(SE3::identity())));
        for k in 0..20 {
            let x = Vector3::new(
                -1.0 + 0.1 * k as f64,
                0.5 - 0.07 * k as f64,
                4.0 + (k % 4) as f64,
            );
            let mut measurement = cam.project(&truth.transform_point(&x));
            if outliers.contains(&k) {
                measurement += Vector2::new(40.0, -35.0);
            }
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
        (graph, truth)
    }

    #[test]
    fn test_outliers_are_rejected() {
        let (mut graph, truth) = pose_graph(&[3, 11]);
        let outcome = run_robust(
            &mut graph,
            &LevenbergMarquardt::default(),
            &RobustSchedule::default().with_min_active(10),
            &never,
        );

        assert_eq!(outcome.inlier_count, 18);
        assert!(!outcome.inliers[3]);
        assert!(!outcome.inliers[11]);
        assert_eq!(outcome.rounds_run, 4);
        assert!(graph.factors().iter().all(|f| f.robust.is_none()));

        let pose = graph.variables()[0].estimate.as_pose().unwrap();
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_early_exit_below_min_active() {
        let (mut graph, _) = pose_graph(&[]);
        let schedule = RobustSchedule::default().with_min_active(50);
        let outcome = run_robust(&mut graph, &LevenbergMarquardt::default(), &schedule, &never);

        assert_eq!(outcome.rounds_run, 1);
        assert_eq!(outcome.inlier_count, 20);
    }

    #[test]
    fn test_nan_chi2_is_an_outlier() {
        let (mut graph, _) = pose_graph(&[]);
        if let FactorKind::PoseOnlyMono { measurement, .. } = &mut graph.factors_mut()[4].kind {
            measurement.x = f64::NAN;
        }
        let schedule = RobustSchedule::single(0, f64::MAX).with_min_active(0);
        let outcome = run_robust(&mut graph, &LevenbergMarquardt::default(), &schedule, &never);

        assert!(!outcome.inliers[4]);
        assert_eq!(outcome.inlier_count, 19);
    }

    #[test]
    fn test_worst_per_point_spares_shared_observations() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, 0.1);
        let poses = [
            SE3::identity(),
            SE3::from_translation(Vector3::new(-0.2, 0.0, 0.0)),
            SE3::from_translation(Vector3::new(-0.4, 0.0, 0.0)),
        ];
        let truth = Vector3::new(0.1, -0.2, 5.0);
        let mut graph = Graph::new();
        let pose_ids: Vec<_> = poses
            .iter()
            .map(|p| graph.add_variable(Variable::new(Estimate::Pose(p.clone())).fixed(true)))
            .collect();
        let point = graph.add_variable(Variable::new(Estimate::Point(truth)).marginalized(true));
        for (k, (pose, id)) in poses.iter().zip(&pose_ids).enumerate() {
            let mut measurement = cam.project(&pose.transform_point(&truth));
            if k == 2 {
                measurement += Vector2::new(30.0, 30.0);
            }
            graph
                .add_factor(Factor::new(
                    FactorKind::MonoReprojection { measurement, camera: cam },
                    vec![*id, point],
                ))
                .unwrap();
        }
        // Pull the point toward the corrupted ray so two observations fail.
        if let Some(v) = graph.variable_mut(point) {
            v.estimate = Estimate::Point(truth + Vector3::new(0.1, 0.1, 0.0));
        }

        let schedule = RobustSchedule::single(0, 5.991).with_min_active(0).with_worst_per_point(true);
        let outcome = run_robust(&mut graph, &LevenbergMarquardt::default(), &schedule, &never);

        assert_eq!(outcome.inliers, vec![true, true, false]);
    }

    #[test]
    fn test_single_round_keeps_kernels() {
        let schedule = RobustSchedule::single(100, 0.25);
        assert_eq!(schedule.kernel_off_after, None);
        assert_eq!(RobustSchedule::default().kernel_off_after, Some(2));
    }
}
