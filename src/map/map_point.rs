//! MapPoint - A 3D landmark observed by KeyFrames.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// observation[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Keyframe whose pose anchors this point during pose-graph correction.
    pub reference_kf_id: KeyFrameId,

    /// Current keyframe of the loop closure that already corrected this point.
    pub corrected_by_kf: Option<KeyFrameId>,

    /// Keyframe whose corrected Sim3 was used for that correction.
    pub corrected_reference: Option<KeyFrameId>,

    /// Position computed by a loop-mode global BA.
    pub position_gba: Option<Vector3<f64>>,

    /// Loop keyframe whose global BA produced `position_gba`.
    pub ba_global_for_kf: Option<KeyFrameId>,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, reference_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            position,
            observations: HashMap::new(),
            reference_kf_id,
            corrected_by_kf: None,
            corrected_reference: None,
            position_gba: None,
            ba_global_for_kf: None,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Observing keyframes in ascending id order.
    pub fn observers(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.observations.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_observation() {
        let mut mp = MapPoint::new(MapPointId::new(1), Vector3::new(1.0, 2.0, 3.0), KeyFrameId::new(0));

        mp.add_observation(KeyFrameId::new(2), 10);
        mp.add_observation(KeyFrameId::new(1), 5);

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observers(), vec![KeyFrameId::new(1), KeyFrameId::new(2)]);

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
    }
}
