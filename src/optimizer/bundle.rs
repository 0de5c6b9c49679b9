//! Map snapshot and graph assembly shared by global and local BA.

use std::collections::HashMap;

use nalgebra::{DMatrix, Vector2, Vector3};

use crate::error::OptimResult;
use crate::frame::CameraModel;
use crate::geometry::SE3;
use crate::map::{KeyFrame, KeyFrameId, MapPointId};

use super::factors::{Factor, FactorKind, Huber};
use super::graph::{FactorId, Graph};
use super::variables::{Estimate, Variable, VariableId};

/// One keyframe observation of a map point.
#[derive(Debug, Clone)]
pub struct BAObservation {
    pub kf_id: KeyFrameId,
    pub mp_id: MapPointId,
    pub feature_idx: usize,
    pub uv: Vector2<f64>,
    /// Right-image u for stereo observations.
    pub u_right: Option<f64>,
    /// Inverse variance of the keypoint's pyramid level.
    pub inv_sigma2: f64,
    pub camera: CameraModel,
}

impl BAObservation {
    /// Snapshot feature `feature_idx` of `kf`.
    pub fn from_keyframe(kf: &KeyFrame, feature_idx: usize, mp_id: MapPointId) -> Option<Self> {
        let kp = kf.keypoints.get(feature_idx)?;
        Some(Self {
            kf_id: kf.id,
            mp_id,
            feature_idx,
            uv: kp.pt,
            u_right: kf.stereo_u(feature_idx),
            inv_sigma2: kf.inv_sigma2(feature_idx),
            camera: kf.camera,
        })
    }
}

/// Everything a bundle adjustment needs, copied out of the map.
#[derive(Debug, Clone, Default)]
pub struct BAProblemData {
    /// Optimized keyframes with their T_cw.
    pub free_keyframes: Vec<(KeyFrameId, SE3)>,
    /// Keyframes that only anchor the problem, T_cw.
    pub fixed_keyframes: Vec<(KeyFrameId, SE3)>,
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    pub observations: Vec<BAObservation>,
}

/// Graph built from a [`BAProblemData`] plus the id bookkeeping to read it back.
#[derive(Debug, Clone)]
pub struct BAGraph {
    pub graph: Graph,
    pub kf_vars: HashMap<KeyFrameId, VariableId>,
    pub mp_vars: HashMap<MapPointId, VariableId>,
    /// Factor of each entry in `observations`, `None` when skipped.
    pub obs_factors: Vec<Option<FactorId>>,
}

/// Huber deltas for mono and stereo reprojection factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectionKernels {
    pub mono: f64,
    pub stereo: f64,
}

/// Assemble poses, marginalized points and one reprojection factor per
/// observation. Points without a usable observation never enter the graph.
pub fn build_ba_graph(
    problem: &BAProblemData,
    kernels: Option<ReprojectionKernels>,
) -> OptimResult<BAGraph> {
    let mut graph = Graph::new();
    let mut kf_vars = HashMap::new();
    let mut mp_vars = HashMap::new();

    for (kf_id, pose_cw) in &problem.fixed_keyframes {
        let id = graph.add_variable(Variable::new(Estimate::Pose(pose_cw.clone())).fixed(true));
        kf_vars.insert(*kf_id, id);
    }
    for (kf_id, pose_cw) in &problem.free_keyframes {
        let id = graph.add_variable(Variable::new(Estimate::Pose(pose_cw.clone())));
        kf_vars.insert(*kf_id, id);
    }

    let positions: HashMap<MapPointId, Vector3<f64>> = problem.points.iter().copied().collect();
    let mut obs_factors = Vec::with_capacity(problem.observations.len());

    for obs in &problem.observations {
        let (Some(&pose_var), Some(position)) = (kf_vars.get(&obs.kf_id), positions.get(&obs.mp_id))
        else {
            obs_factors.push(None);
            continue;
        };
        let point_var = *mp_vars.entry(obs.mp_id).or_insert_with(|| {
            graph.add_variable(Variable::new(Estimate::Point(*position)).marginalized(true))
        });

        let factor = match obs.u_right {
            Some(u_right) => Factor::new(
                FactorKind::StereoReprojection {
                    measurement: Vector3::new(obs.uv.x, obs.uv.y, u_right),
                    camera: obs.camera,
                },
                vec![pose_var, point_var],
            )
            .with_information(DMatrix::identity(3, 3) * obs.inv_sigma2)
            .with_robust(kernels.map(|k| Huber::new(k.stereo))),
            None => Factor::new(
                FactorKind::MonoReprojection {
                    measurement: obs.uv,
                    camera: obs.camera,
                },
                vec![pose_var, point_var],
            )
            .with_information(DMatrix::identity(2, 2) * obs.inv_sigma2)
            .with_robust(kernels.map(|k| Huber::new(k.mono))),
        };
        obs_factors.push(Some(graph.add_factor(factor)?));
    }

    Ok(BAGraph {
        graph,
        kf_vars,
        mp_vars,
        obs_factors,
    })
}

impl BAGraph {
    /// Optimized T_wc of every keyframe in the graph.
    pub fn poses_wc(&self) -> HashMap<KeyFrameId, SE3> {
        self.kf_vars
            .iter()
            .filter_map(|(kf_id, var)| {
                let pose_cw = self.graph.estimate(*var)?.as_pose()?;
                Some((*kf_id, pose_cw.inverse()))
            })
            .collect()
    }

    /// Optimized position of every point that entered the graph.
    pub fn positions(&self) -> HashMap<MapPointId, Vector3<f64>> {
        self.mp_vars
            .iter()
            .filter_map(|(mp_id, var)| Some((*mp_id, *self.graph.estimate(*var)?.as_point()?)))
            .collect()
    }

    /// Observations whose factor exceeds its threshold or sees the point
    /// behind the camera at the current estimate.
    pub fn outlier_observations(
        &self,
        observations: &[BAObservation],
        chi2_mono: f64,
        chi2_stereo: f64,
    ) -> Vec<(KeyFrameId, MapPointId)> {
        observations
            .iter()
            .zip(&self.obs_factors)
            .filter_map(|(obs, factor_id)| {
                let factor = self.graph.factor((*factor_id)?)?;
                let estimates = self.graph.factor_estimates(factor)?;
                let chi2 = factor.chi2(&estimates)?;
                let threshold = if obs.u_right.is_some() {
                    chi2_stereo
                } else {
                    chi2_mono
                };
                let outlier =
                    chi2.is_nan() || chi2 > threshold || !factor.is_depth_positive(&estimates);
                outlier.then_some((obs.kf_id, obs.mp_id))
            })
            .collect()
    }
}
