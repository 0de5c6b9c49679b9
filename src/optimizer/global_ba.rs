//! Global Bundle Adjustment.
//!
//! Refines every valid keyframe pose and map point of the map against all
//! their observations. The oldest keyframe is held fixed to remove the gauge
//! freedom. When launched after a loop closure the results are parked in
//! `pose_gba` / `position_gba` (tagged with the loop keyframe) for the loop
//! closer to merge, instead of overwriting the live map.
//!
//! Outlier observations are only reported; unlinking them is left to the
//! caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};

use super::bundle::{build_ba_graph, BAObservation, BAProblemData, ReprojectionKernels};
use super::solver::{LevenbergMarquardt, SolverConfig};

/// Configuration for Global Bundle Adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalBAConfig {
    /// LM iterations.
    pub iterations: usize,

    /// Attach Huber kernels to every reprojection factor.
    pub robust: bool,

    pub huber_mono: f64,
    pub huber_stereo: f64,

    /// Thresholds used to report outlier observations after solving.
    pub chi2_mono: f64,
    pub chi2_stereo: f64,

    pub solver: SolverConfig,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            robust: true,
            huber_mono: 5.991_f64.sqrt(),
            huber_stereo: 7.815_f64.sqrt(),
            chi2_mono: 5.991,
            chi2_stereo: 7.815,
            solver: SolverConfig::default(),
        }
    }
}

/// Snapshot for Global BA.
#[derive(Debug, Clone)]
pub struct GlobalBAProblemData {
    pub problem: BAProblemData,

    /// Fixed anchor keyframe (smallest id).
    pub fixed_kf_id: KeyFrameId,

    /// Loop keyframe when running on behalf of a loop closure.
    pub loop_kf: Option<KeyFrameId>,
}

/// Result of Global BA.
#[derive(Debug, Clone)]
pub struct GlobalBAResult {
    /// Optimized keyframe poses (T_wc), the fixed anchor included.
    pub optimized_poses: HashMap<KeyFrameId, SE3>,

    pub optimized_points: HashMap<MapPointId, Vector3<f64>>,

    /// Observations above the chi2 thresholds or behind the camera.
    pub outliers: Vec<(KeyFrameId, MapPointId)>,

    pub loop_kf: Option<KeyFrameId>,

    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: Collect data for Global BA.
pub fn collect_global_ba_data(map: &Map, loop_kf: Option<KeyFrameId>) -> Option<GlobalBAProblemData> {
    let mut kf_ids: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| kf.id)
        .collect();
    if kf_ids.is_empty() {
        return None;
    }
    kf_ids.sort();
    let fixed_kf_id = kf_ids[0];

    let kf_set: HashSet<KeyFrameId> = kf_ids.iter().copied().collect();
    let mut points: Vec<(MapPointId, Vector3<f64>)> = map
        .map_points()
        .filter(|mp| !mp.is_bad && mp.observations.keys().any(|id| kf_set.contains(id)))
        .map(|mp| (mp.id, mp.position))
        .collect();
    if points.is_empty() {
        return None;
    }
    points.sort_by_key(|(id, _)| *id);
    let mp_set: HashSet<MapPointId> = points.iter().map(|(id, _)| *id).collect();

    let mut problem = BAProblemData {
        points,
        ..Default::default()
    };
    for &kf_id in &kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        if kf_id == fixed_kf_id {
            problem.fixed_keyframes.push((kf_id, kf.pose_cw()));
        } else {
            problem.free_keyframes.push((kf_id, kf.pose_cw()));
        }
        for (feature_idx, mp_id) in kf.get_map_point_indices() {
            if mp_set.contains(&mp_id) {
                if let Some(obs) = BAObservation::from_keyframe(kf, feature_idx, mp_id) {
                    problem.observations.push(obs);
                }
            }
        }
    }

    if problem.observations.is_empty() {
        return None;
    }

    Some(GlobalBAProblemData {
        problem,
        fixed_kf_id,
        loop_kf,
    })
}

/// PHASE 2: Solve Global BA. Returns `None` when stopped or degenerate.
pub fn solve_global_ba(
    data: &GlobalBAProblemData,
    config: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<GlobalBAResult> {
    if data.problem.free_keyframes.is_empty() {
        return None;
    }

    let kernels = config.robust.then_some(ReprojectionKernels {
        mono: config.huber_mono,
        stereo: config.huber_stereo,
    });
    let mut ba = match build_ba_graph(&data.problem, kernels) {
        Ok(ba) => ba,
        Err(err) => {
            warn!("Global BA: graph construction failed: {}", err);
            return None;
        }
    };

    let solver = LevenbergMarquardt::new(config.solver.clone());
    let summary = solver.optimize(&mut ba.graph, config.iterations, should_stop);
    if summary.stopped {
        return None;
    }

    Some(GlobalBAResult {
        optimized_poses: ba.poses_wc(),
        optimized_points: ba.positions(),
        outliers: ba.outlier_observations(
            &data.problem.observations,
            config.chi2_mono,
            config.chi2_stereo,
        ),
        loop_kf: data.loop_kf,
        iterations: summary.iterations,
        initial_error: summary.initial_cost,
        final_error: summary.final_cost,
    })
}

/// PHASE 3: Apply Global BA results. Returns the number of updated entities.
pub fn apply_global_ba_results(map: &mut Map, results: &GlobalBAResult) -> usize {
    let mut updated = 0;

    for (kf_id, pose) in &results.optimized_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if kf.is_bad {
                continue;
            }
            match results.loop_kf {
                Some(loop_kf) => {
                    kf.pose_gba = Some(pose.clone());
                    kf.ba_global_for_kf = Some(loop_kf);
                }
                None => kf.pose = pose.clone(),
            }
            updated += 1;
        }
    }

    for (mp_id, pos) in &results.optimized_points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            if mp.is_bad {
                continue;
            }
            match results.loop_kf {
                Some(loop_kf) => {
                    mp.position_gba = Some(*pos);
                    mp.ba_global_for_kf = Some(loop_kf);
                }
                None => mp.position = *pos,
            }
            updated += 1;
        }
    }

    updated
}

/// Run Global BA: collect under the read lock, solve unlocked, apply under
/// the write lock. Nothing is written if `stop_flag` is raised.
pub fn run_global_ba(
    map: &RwLock<Map>,
    loop_kf: Option<KeyFrameId>,
    config: &GlobalBAConfig,
    stop_flag: &AtomicBool,
) -> Option<GlobalBAResult> {
    let should_stop = || stop_flag.load(Ordering::SeqCst);
    if should_stop() {
        return None;
    }

    // Phase 1: Collect
    let data = {
        let guard = map.read();
        collect_global_ba_data(&guard, loop_kf)
    }?;

    // Phase 2: Solve
    let result = solve_global_ba(&data, config, &should_stop)?;

    // Phase 3: Apply
    if should_stop() {
        return None;
    }
    {
        let mut guard = map.write();
        apply_global_ba_results(&mut guard, &result);
    }

    info!(
        "Global BA complete: {} iterations, error {:.4} -> {:.4}, {} outliers",
        result.iterations,
        result.initial_error,
        result.final_error,
        result.outliers.len()
    );

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::bundle::test_scene::*;
    use crate::system::SharedMap;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    #[test]
    fn test_global_ba_recovers_scene() {
        let (map, mp_ids) = build_map(3, 0.05, 0.03);
        let shared = SharedMap::new(map);

        let result = run_global_ba(&shared.map, None, &GlobalBAConfig::default(), &shared.abort_ba)
            .unwrap();
        assert!(result.final_error < 1e-2 * result.initial_error);
        assert!(result.outliers.is_empty());
        assert_eq!(result.optimized_points.len(), mp_ids.len());

        let guard = shared.map.read();
        let kf0 = guard.get_keyframe(KeyFrameId::new(0)).unwrap();
        assert_relative_eq!(kf0.pose.translation, true_pose_wc(0).translation, epsilon = 1e-12);
    }

    #[test]
    fn test_loop_mode_parks_results() {
        let (map, mp_ids) = build_map(2, 0.02, 0.0);
        let original = map.get_keyframe(KeyFrameId::new(1)).unwrap().pose.clone();
        let shared = SharedMap::new(map);
        let loop_kf = Some(KeyFrameId::new(1));

        run_global_ba(&shared.map, loop_kf, &GlobalBAConfig::default(), &shared.abort_ba).unwrap();

        let guard = shared.map.read();
        let kf1 = guard.get_keyframe(KeyFrameId::new(1)).unwrap();
        assert_eq!(kf1.pose, original);
        assert!(kf1.pose_gba.is_some());
        assert_eq!(kf1.ba_global_for_kf, loop_kf);
        assert!(guard.get_map_point(mp_ids[0]).unwrap().position_gba.is_some());
    }

    #[test]
    fn test_stop_flag_skips_write_back() {
        let (map, _) = build_map(3, 0.05, 0.0);
        let original = map.get_keyframe(KeyFrameId::new(2)).unwrap().pose.clone();
        let shared = SharedMap::new(map);
        shared.request_stop();

        let result = run_global_ba(&shared.map, None, &GlobalBAConfig::default(), &shared.abort_ba);
        assert!(result.is_none());
        assert_eq!(shared.map.read().get_keyframe(KeyFrameId::new(2)).unwrap().pose, original);
    }

    #[test]
    fn test_outliers_are_reported_not_erased() {
        let (mut map, mp_ids) = build_map(3, 0.0, 0.0);
        corrupt_observation(&mut map, KeyFrameId::new(2), 7, Vector2::new(60.0, -45.0));
        let data = collect_global_ba_data(&map, None).unwrap();

        let result = solve_global_ba(&data, &GlobalBAConfig::default(), &|| false).unwrap();
        assert!(result.outliers.contains(&(KeyFrameId::new(2), mp_ids[7])));
        assert_eq!(map.get_map_point(mp_ids[7]).unwrap().num_observations(), 3);
    }
}
