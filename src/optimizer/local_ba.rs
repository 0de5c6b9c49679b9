//! Local Bundle Adjustment.
//!
//! Optimizes the poses of a target keyframe and its covisible neighbours
//! together with the points they observe. Keyframes that see those points but
//! are outside the window anchor the solve as fixed poses.
//!
//! Two passes: a robust one, then outlier gating (chi2 or depth), kernel
//! removal and a refinement over the inliers only. Each gating step drops at
//! most one chi2 failure per point, so a single corrupted observation cannot
//! take its point's other observations down with it. Observations still
//! classified as outliers afterwards are unlinked from the map under the same
//! write guard that stores the new poses and points.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};

use super::bundle::{build_ba_graph, BAObservation, BAProblemData, ReprojectionKernels};
use super::robust::{run_robust, RobustRound, RobustSchedule};
use super::solver::{LevenbergMarquardt, SolverConfig};

/// Configuration for local BA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBAConfig {
    /// Iterations of the robust pass.
    pub first_iterations: usize,
    /// Iterations after outliers are removed.
    pub second_iterations: usize,
    pub huber_mono: f64,
    pub huber_stereo: f64,
    /// Chi-square gates (95%, 2 and 3 DOF).
    pub chi2_mono: f64,
    pub chi2_stereo: f64,
    pub solver: SolverConfig,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            first_iterations: 5,
            second_iterations: 10,
            huber_mono: 5.991_f64.sqrt(),
            huber_stereo: 7.815_f64.sqrt(),
            chi2_mono: 5.991,
            chi2_stereo: 7.815,
            solver: SolverConfig::default(),
        }
    }
}

impl LocalBAConfig {
    fn schedule(&self) -> RobustSchedule {
        let round = |iterations| RobustRound::new(iterations, self.chi2_mono, self.chi2_stereo);
        RobustSchedule {
            rounds: vec![round(self.first_iterations), round(self.second_iterations)],
            kernel_off_after: Some(0),
            min_active: 0,
            reject_worst_per_point: true,
        }
    }
}

/// Result of local bundle adjustment.
#[derive(Debug, Clone)]
pub struct LocalBAResult {
    /// Optimized poses (T_wc) of the free keyframes.
    pub optimized_poses: HashMap<KeyFrameId, SE3>,
    pub optimized_points: HashMap<MapPointId, Vector3<f64>>,
    /// Observations to unlink from the map.
    pub outliers: Vec<(KeyFrameId, MapPointId)>,
    pub num_keyframes: usize,
    pub num_fixed_keyframes: usize,
    pub num_map_points: usize,
    pub num_observations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: Collect the local window around `target_kf_id`.
pub fn collect_local_ba_data(map: &Map, target_kf_id: KeyFrameId) -> Option<BAProblemData> {
    let target = map.get_keyframe(target_kf_id).filter(|kf| !kf.is_bad)?;

    // Local keyframes: target + covisible neighbours.
    let mut local_kf_ids = vec![target_kf_id];
    for neighbor_id in target.ordered_covisibles() {
        if map.get_keyframe(neighbor_id).is_some_and(|kf| !kf.is_bad) {
            local_kf_ids.push(neighbor_id);
        }
    }
    let local_set: HashSet<KeyFrameId> = local_kf_ids.iter().copied().collect();

    // Local map points, in first-seen order.
    let mut local_mp_ids: Vec<MapPointId> = Vec::new();
    let mut seen: HashSet<MapPointId> = HashSet::new();
    for kf in local_kf_ids.iter().filter_map(|id| map.get_keyframe(*id)) {
        for (_, mp_id) in kf.get_map_point_indices() {
            if map.get_map_point(mp_id).is_some_and(|mp| !mp.is_bad) && seen.insert(mp_id) {
                local_mp_ids.push(mp_id);
            }
        }
    }
    if local_mp_ids.is_empty() {
        return None;
    }

    // Fixed keyframes: observers of local points outside the window.
    let mut fixed_kf_ids: Vec<KeyFrameId> = local_mp_ids
        .iter()
        .filter_map(|id| map.get_map_point(*id))
        .flat_map(|mp| mp.observers())
        .filter(|id| !local_set.contains(id))
        .filter(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    fixed_kf_ids.sort();

    let mut problem = BAProblemData::default();
    for &kf_id in &local_kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        // The map origin never moves.
        if kf_id == KeyFrameId::new(0) {
            problem.fixed_keyframes.push((kf_id, kf.pose_cw()));
        } else {
            problem.free_keyframes.push((kf_id, kf.pose_cw()));
        }
    }
    for &kf_id in &fixed_kf_ids {
        if let Some(kf) = map.get_keyframe(kf_id) {
            problem.fixed_keyframes.push((kf_id, kf.pose_cw()));
        }
    }

    for &mp_id in &local_mp_ids {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        problem.points.push((mp_id, mp.position));

        let mut observers: Vec<(&KeyFrameId, &usize)> = mp.observations.iter().collect();
        observers.sort();
        for (kf_id, &feature_idx) in observers {
            let Some(kf) = map.get_keyframe(*kf_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            if let Some(obs) = BAObservation::from_keyframe(kf, feature_idx, mp_id) {
                problem.observations.push(obs);
            }
        }
    }

    if problem.free_keyframes.is_empty() || problem.observations.is_empty() {
        return None;
    }
    Some(problem)
}

/// PHASE 2: Solve without holding any lock. `None` if stopped.
pub fn solve_local_ba(
    problem: &BAProblemData,
    config: &LocalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<LocalBAResult> {
    let kernels = ReprojectionKernels {
        mono: config.huber_mono,
        stereo: config.huber_stereo,
    };
    let mut ba = match build_ba_graph(problem, Some(kernels)) {
        Ok(ba) => ba,
        Err(err) => {
            warn!("Local BA: graph construction failed: {}", err);
            return None;
        }
    };

    let solver = LevenbergMarquardt::new(config.solver.clone());
    let initial_error = super::solver::total_cost(&ba.graph);
    let outcome = run_robust(&mut ba.graph, &solver, &config.schedule(), should_stop);
    if outcome.stopped {
        debug!("Local BA stopped after {} rounds", outcome.rounds_run);
        return None;
    }

    let outliers = ba.outlier_observations(&problem.observations, config.chi2_mono, config.chi2_stereo);
    let free: HashSet<KeyFrameId> = problem.free_keyframes.iter().map(|(id, _)| *id).collect();
    let optimized_poses = ba
        .poses_wc()
        .into_iter()
        .filter(|(id, _)| free.contains(id))
        .collect();

    Some(LocalBAResult {
        optimized_poses,
        optimized_points: ba.positions(),
        outliers,
        num_keyframes: problem.free_keyframes.len(),
        num_fixed_keyframes: problem.fixed_keyframes.len(),
        num_map_points: ba.mp_vars.len(),
        num_observations: ba.graph.num_factors(),
        initial_error,
        final_error: super::solver::total_cost(&ba.graph),
    })
}

/// PHASE 3: Erase outlier observations, then store poses and points.
/// Returns the number of erased observations.
pub fn apply_local_ba_results(map: &mut Map, results: &LocalBAResult) -> usize {
    let erased = results
        .outliers
        .iter()
        .filter(|(kf_id, mp_id)| map.erase_observation(*kf_id, *mp_id))
        .count();

    for (kf_id, pose) in &results.optimized_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.pose = pose.clone();
        }
    }
    for (mp_id, pos) in &results.optimized_points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            mp.position = *pos;
        }
    }

    erased
}

/// Run local BA around `target_kf_id` with the collect/solve/apply split.
pub fn run_local_ba(
    map: &RwLock<Map>,
    target_kf_id: KeyFrameId,
    config: &LocalBAConfig,
    stop_flag: &AtomicBool,
) -> Option<LocalBAResult> {
    let should_stop = || stop_flag.load(Ordering::SeqCst);
    if should_stop() {
        return None;
    }

    let problem = {
        let guard = map.read();
        collect_local_ba_data(&guard, target_kf_id)
    }?;

    let result = solve_local_ba(&problem, config, &should_stop)?;

    let erased = {
        let mut guard = map.write();
        apply_local_ba_results(&mut guard, &result)
    };

    info!(
        "Local BA: {} KFs ({} fixed), {} MPs, {} obs, error {:.4} -> {:.4}, {} outliers erased",
        result.num_keyframes,
        result.num_fixed_keyframes,
        result.num_map_points,
        result.num_observations,
        result.initial_error,
        result.final_error,
        erased
    );

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::bundle::test_scene::*;
    use crate::system::SharedMap;
    use nalgebra::Vector2;

    #[test]
    fn test_window_and_fixed_keyframes() {
        let (map, mp_ids) = build_map(4, 0.0, 0.0);
        let problem = collect_local_ba_data(&map, KeyFrameId::new(3)).unwrap();

        // Every keyframe is covisible; only the origin is fixed.
        assert_eq!(problem.free_keyframes.len(), 3);
        assert_eq!(problem.fixed_keyframes.len(), 1);
        assert_eq!(problem.fixed_keyframes[0].0, KeyFrameId::new(0));
        assert_eq!(problem.points.len(), mp_ids.len());
        assert_eq!(problem.observations.len(), 4 * mp_ids.len());
    }

    #[test]
    fn test_local_ba_erases_outlier_observation() {
        let (mut map, mp_ids) = build_map(3, 0.01, 0.01);
        corrupt_observation(&mut map, KeyFrameId::new(2), 5, Vector2::new(50.0, 50.0));
        let shared = SharedMap::new(map);

        let result = run_local_ba(
            &shared.map,
            KeyFrameId::new(2),
            &LocalBAConfig::default(),
            &shared.abort_ba,
        )
        .unwrap();

        assert_eq!(result.outliers, vec![(KeyFrameId::new(2), mp_ids[5])]);
        assert!(result.final_error < result.initial_error);

        let guard = shared.map.read();
        let kf2 = guard.get_keyframe(KeyFrameId::new(2)).unwrap();
        assert_eq!(kf2.get_map_point(5), None);
        assert_eq!(guard.get_map_point(mp_ids[5]).unwrap().num_observations(), 2);
        assert_eq!(kf2.get_covisibility_weight(KeyFrameId::new(0)), mp_ids.len() - 1);
    }

    #[test]
    fn test_missing_target_returns_none() {
        let (map, _) = build_map(2, 0.0, 0.0);
        assert!(collect_local_ba_data(&map, KeyFrameId::new(42)).is_none());
    }
}
