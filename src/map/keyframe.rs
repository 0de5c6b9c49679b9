//! KeyFrame - a retained camera pose with its feature observations.
//!
//! Besides pose and keypoints, a keyframe carries the graph structure the
//! optimizer walks: covisibility weights, the spanning-tree parent/children
//! and the loop edges recorded by earlier loop closures.

use std::collections::{HashMap, HashSet};

use nalgebra::{Vector2, Vector3};

use crate::frame::CameraModel;
use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// A keypoint as the optimizer sees it: pixel position and pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Vector2<f64>,
    pub octave: usize,
}

impl KeyPoint {
    pub fn new(pt: Vector2<f64>, octave: usize) -> Self {
        Self { pt, octave }
    }
}

/// A KeyFrame in the map.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    pub camera: CameraModel,

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    /// Right-image u per keypoint; negative for monocular observations.
    pub u_right: Vec<f64>,

    /// Inverse variance (1/σ²) of each pyramid level, indexed by octave.
    pub inv_level_sigma2: Vec<f64>,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Graph structure
    // ─────────────────────────────────────────────────────────────────────────
    /// Covisibility weights: connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Parent in the spanning tree; None for the root.
    pub parent_id: Option<KeyFrameId>,

    pub children_ids: HashSet<KeyFrameId>,

    /// Keyframes connected to this one by an accepted loop closure.
    pub loop_edges: HashSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Loop-mode global BA results
    // ─────────────────────────────────────────────────────────────────────────
    /// Pose (T_wc) computed by a global BA launched for a loop closure.
    pub pose_gba: Option<SE3>,

    /// Loop keyframe whose global BA produced `pose_gba`.
    pub ba_global_for_kf: Option<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a keyframe whose features are all monocular at octave 0.
    pub fn new(id: KeyFrameId, pose: SE3, camera: CameraModel, keypoints: Vec<KeyPoint>) -> Self {
        let n = keypoints.len();
        Self {
            id,
            pose,
            camera,
            keypoints,
            u_right: vec![-1.0; n],
            inv_level_sigma2: vec![1.0],
            map_point_ids: vec![None; n],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            pose_gba: None,
            ba_global_for_kf: None,
            is_bad: false,
        }
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Information weight of feature `idx`, from its pyramid level.
    pub fn inv_sigma2(&self, idx: usize) -> f64 {
        self.keypoints
            .get(idx)
            .and_then(|kp| self.inv_level_sigma2.get(kp.octave))
            .copied()
            .unwrap_or(1.0)
    }

    /// Right-image abscissa if feature `idx` is a stereo observation.
    pub fn stereo_u(&self, idx: usize) -> Option<f64> {
        self.u_right.get(idx).copied().filter(|u| *u >= 0.0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previously associated point, if any.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Feature index of `mp_id` in this keyframe.
    pub fn feature_of(&self, mp_id: MapPointId) -> Option<usize> {
        self.map_point_ids.iter().position(|id| *id == Some(mp_id))
    }

    /// All associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Set the covisibility weight towards `kf_id`; a zero weight removes the edge.
    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        if weight == 0 {
            self.covisibility_weights.remove(&kf_id);
        } else {
            self.covisibility_weights.insert(kf_id, weight);
        }
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// Covisible keyframes, heaviest first (ties broken by id).
    pub fn ordered_covisibles(&self) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().map(|(id, _)| id).collect()
    }

    /// Covisible keyframes with at least `min_weight` shared points.
    pub fn covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self
            .covisibility_weights
            .iter()
            .filter(|(_, w)| **w >= min_weight)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_keyframe(id: u64, num_features: usize) -> KeyFrame {
        let keypoints = (0..num_features)
            .map(|i| KeyPoint::new(Vector2::new(i as f64, 0.0), i % 2))
            .collect();
        KeyFrame::new(
            KeyFrameId::new(id),
            SE3::identity(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0, 0.1),
            keypoints,
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_test_keyframe(1, 10);

        assert_eq!(kf.set_map_point(3, MapPointId::new(100)), None);
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.feature_of(MapPointId::new(100)), Some(3));

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.num_map_points(), 0);
        assert_eq!(kf.set_map_point(42, MapPointId::new(1)), None);
    }

    #[test]
    fn test_covisibility_ordering_and_threshold() {
        let mut kf = create_test_keyframe(1, 0);
        kf.set_covisibility(KeyFrameId::new(2), 50);
        kf.set_covisibility(KeyFrameId::new(3), 100);
        kf.set_covisibility(KeyFrameId::new(4), 25);
        kf.set_covisibility(KeyFrameId::new(1), 999);

        assert_eq!(
            kf.ordered_covisibles(),
            vec![KeyFrameId::new(3), KeyFrameId::new(2), KeyFrameId::new(4)]
        );
        assert_eq!(kf.covisibles_above_weight(30).len(), 2);

        kf.set_covisibility(KeyFrameId::new(3), 0);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(3)), 0);
    }

    #[test]
    fn test_inv_sigma2_by_octave() {
        let mut kf = create_test_keyframe(1, 2);
        kf.inv_level_sigma2 = vec![1.0, 1.0 / 1.44];

        assert_eq!(kf.inv_sigma2(0), 1.0);
        assert!((kf.inv_sigma2(1) - 1.0 / 1.44).abs() < 1e-12);
        assert_eq!(kf.inv_sigma2(5), 1.0);
    }
}
