//! Two-view Sim3 refinement between a loop candidate and the current keyframe.
//!
//! Each matched pair contributes two projections: keyframe 2's point through
//! S12 into image 1, and keyframe 1's point through S12⁻¹ into image 2. Pairs
//! failing either side after the first pass are dropped from the match list,
//! even when too few survive for the registration to be accepted.

use nalgebra::{DMatrix, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OptimError, OptimResult};
use crate::frame::CameraModel;
use crate::geometry::Sim3;
use crate::map::{KeyFrameId, Map, MapPointId};

use super::factors::{Factor, FactorKind, Huber};
use super::graph::{FactorId, Graph};
use super::motion::MIN_CORRESPONDENCES;
use super::solver::{LevenbergMarquardt, SolverConfig};
use super::variables::{Estimate, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sim3RegistrationConfig {
    pub first_iterations: usize,
    /// Second pass when the first one pruned something.
    pub refine_iterations: usize,
    /// Second pass when nothing was pruned.
    pub settle_iterations: usize,
    /// Survivors needed after pruning.
    pub min_inliers: usize,
    pub solver: SolverConfig,
}

impl Default for Sim3RegistrationConfig {
    fn default() -> Self {
        Self {
            first_iterations: 5,
            refine_iterations: 10,
            settle_iterations: 5,
            min_inliers: 10,
            solver: SolverConfig::default(),
        }
    }
}

/// One matched point pair expressed in both camera frames.
#[derive(Debug, Clone)]
pub struct Sim3Pair {
    /// Index into the caller's match list.
    pub match_idx: usize,
    pub uv1: Vector2<f64>,
    pub inv_sigma2_1: f64,
    /// Keyframe 1's point in camera 1.
    pub point1: Vector3<f64>,
    pub uv2: Vector2<f64>,
    pub inv_sigma2_2: f64,
    /// Keyframe 2's point in camera 2.
    pub point2: Vector3<f64>,
}

/// Build pairs from `matches`, where `matches[i]` is the keyframe-2 map point
/// matched to feature `i` of keyframe 1.
pub fn collect_sim3_pairs(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    matches: &[Option<MapPointId>],
) -> OptimResult<(Vec<Sim3Pair>, CameraModel, CameraModel)> {
    let kf1 = map.get_keyframe(kf1_id).ok_or(OptimError::UnknownKeyFrame(kf1_id))?;
    let kf2 = map.get_keyframe(kf2_id).ok_or(OptimError::UnknownKeyFrame(kf2_id))?;
    let (t1w, t2w) = (kf1.pose_cw(), kf2.pose_cw());

    let mut pairs = Vec::new();
    for (i, matched) in matches.iter().enumerate() {
        let Some(mp2_id) = *matched else {
            continue;
        };
        let mp1 = kf1.get_map_point(i).and_then(|id| map.get_map_point(id));
        let mp2 = map.get_map_point(mp2_id);
        let (Some(mp1), Some(mp2)) = (mp1, mp2) else {
            continue;
        };
        if mp1.is_bad || mp2.is_bad {
            continue;
        }
        let Some(i2) = kf2.feature_of(mp2_id) else {
            continue;
        };
        let (Some(kp1), Some(kp2)) = (kf1.keypoints.get(i), kf2.keypoints.get(i2)) else {
            continue;
        };
        pairs.push(Sim3Pair {
            match_idx: i,
            uv1: kp1.pt,
            inv_sigma2_1: kf1.inv_sigma2(i),
            point1: t1w.transform_point(&mp1.position),
            uv2: kp2.pt,
            inv_sigma2_2: kf2.inv_sigma2(i2),
            point2: t2w.transform_point(&mp2.position),
        });
    }
    Ok((pairs, kf1.camera, kf2.camera))
}

/// Outcome of [`register_sim3`].
#[derive(Debug, Clone)]
pub struct Sim3Registration {
    /// Refined transform; the input one when not accepted.
    pub s12: Sim3,
    /// Per pair.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Enough pairs survived the first pass for the second one to run.
    pub accepted: bool,
}

/// Refine `s12` over `pairs`. Returns `None` when there are too few pairs to
/// optimize at all. When too few survive the first pass the registration is
/// not accepted; its inliers still say which pairs were rejected.
pub fn register_sim3(
    pairs: &[Sim3Pair],
    camera1: &CameraModel,
    camera2: &CameraModel,
    s12: &Sim3,
    th2: f64,
    fix_scale: bool,
    config: &Sim3RegistrationConfig,
) -> OptimResult<Option<Sim3Registration>> {
    if pairs.len() < MIN_CORRESPONDENCES {
        return Ok(None);
    }

    let mut graph = Graph::new();
    let sim3 = graph.add_variable(Variable::new(Estimate::Sim3(s12.clone())).with_fix_scale(fix_scale));
    let huber = Some(Huber::new(th2.sqrt()));

    let mut edges: Vec<(FactorId, FactorId)> = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let e12 = graph.add_factor(
            Factor::new(
                FactorKind::Sim3Forward {
                    measurement: pair.uv1,
                    point: pair.point2,
                    camera: *camera1,
                },
                vec![sim3],
            )
            .with_information(DMatrix::identity(2, 2) * pair.inv_sigma2_1)
            .with_robust(huber),
        )?;
        let e21 = graph.add_factor(
            Factor::new(
                FactorKind::Sim3Inverse {
                    measurement: pair.uv2,
                    point: pair.point1,
                    camera: *camera2,
                },
                vec![sim3],
            )
            .with_information(DMatrix::identity(2, 2) * pair.inv_sigma2_2)
            .with_robust(huber),
        )?;
        edges.push((e12, e21));
    }

    let solver = LevenbergMarquardt::new(config.solver.clone());
    solver.optimize(&mut graph, config.first_iterations, &|| false);

    let pair_fits = |graph: &Graph, (e12, e21): (FactorId, FactorId)| {
        let within = |id| graph.factor_chi2(id).is_some_and(|chi2| chi2 <= th2);
        within(e12) && within(e21)
    };

    let mut inliers = vec![true; pairs.len()];
    let mut bad = 0;
    for (k, &pair_edges) in edges.iter().enumerate() {
        if !pair_fits(&graph, pair_edges) {
            inliers[k] = false;
            bad += 1;
            for id in [pair_edges.0, pair_edges.1] {
                if let Some(factor) = graph.factor_mut(id) {
                    factor.active = false;
                }
            }
        }
    }

    if pairs.len() - bad < config.min_inliers {
        debug!("Sim3 registration: {} of {} pairs survive", pairs.len() - bad, pairs.len());
        return Ok(Some(Sim3Registration {
            s12: s12.clone(),
            inliers,
            num_inliers: pairs.len() - bad,
            accepted: false,
        }));
    }

    let more = if bad > 0 {
        config.refine_iterations
    } else {
        config.settle_iterations
    };
    solver.optimize(&mut graph, more, &|| false);

    for (k, &pair_edges) in edges.iter().enumerate() {
        if inliers[k] && !pair_fits(&graph, pair_edges) {
            inliers[k] = false;
        }
    }
    let num_inliers = inliers.iter().filter(|b| **b).count();
    let s12 = graph
        .estimate(sim3)
        .and_then(Estimate::as_sim3)
        .cloned()
        .unwrap_or_else(|| s12.clone());

    Ok(Some(Sim3Registration {
        s12,
        inliers,
        num_inliers,
        accepted: true,
    }))
}

/// Refine the similarity `s12` between two keyframes from the match list.
///
/// Rejected matches are set to `None` in `matches`, also when the
/// registration fails; `s12` is only updated on success. Returns the number
/// of inliers, 0 on failure.
#[allow(clippy::too_many_arguments)]
pub fn optimize_sim3(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    matches: &mut [Option<MapPointId>],
    s12: &mut Sim3,
    th2: f64,
    fix_scale: bool,
    config: &Sim3RegistrationConfig,
) -> OptimResult<usize> {
    let (pairs, camera1, camera2) = collect_sim3_pairs(map, kf1_id, kf2_id, matches)?;
    let Some(registration) = register_sim3(&pairs, &camera1, &camera2, s12, th2, fix_scale, config)?
    else {
        return Ok(0);
    };

    for (pair, inlier) in pairs.iter().zip(&registration.inliers) {
        if !inlier {
            if let Some(slot) = matches.get_mut(pair.match_idx) {
                *slot = None;
            }
        }
    }
    if !registration.accepted {
        return Ok(0);
    }
    *s12 = registration.s12;
    debug!(
        "Sim3 registration {} -> {}: {} inliers of {} pairs, scale {:.4}",
        kf1_id,
        kf2_id,
        registration.num_inliers,
        pairs.len(),
        s12.scale
    );
    Ok(registration.num_inliers)
}
