//! Map - Container for KeyFrames and MapPoints.
//!
//! Owns every keyframe and point and keeps the bipartite KF ↔ MP links and
//! the covisibility weights consistent. Optimizers read it to build graphs
//! and write back through `&mut Map` while holding the map lock.

use std::collections::HashMap;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The map containing KeyFrames and MapPoints.
#[derive(Debug, Default)]
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    next_kf_id: u64,
    next_mp_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe, keeping the id counter ahead of it.
    pub fn add_keyframe(&mut self, kf: KeyFrame) -> KeyFrameId {
        let id = kf.id;
        self.next_kf_id = self.next_kf_id.max(id.0 + 1);
        self.keyframes.insert(id, kf);
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Link `child` under `parent` in the spanning tree.
    pub fn set_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) -> bool {
        if child == parent || !self.keyframes.contains_key(&parent) {
            return false;
        }
        let old_parent = match self.keyframes.get_mut(&child) {
            Some(kf) => kf.parent_id.replace(parent),
            None => return false,
        };
        if let Some(old) = old_parent.and_then(|id| self.keyframes.get_mut(&id)) {
            old.children_ids.remove(&child);
        }
        if let Some(kf) = self.keyframes.get_mut(&parent) {
            kf.children_ids.insert(child);
        }
        true
    }

    /// Record a loop edge between two keyframes (both directions).
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) -> bool {
        if a == b || !self.keyframes.contains_key(&a) || !self.keyframes.contains_key(&b) {
            return false;
        }
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.loop_edges.insert(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.loop_edges.insert(a);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_map_point(&mut self, mp: MapPoint) -> MapPointId {
        let id = mp.id;
        self.next_mp_id = self.next_mp_id.max(id.0 + 1);
        self.map_points.insert(id, mp);
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link feature `feature_idx` of `kf_id` to `mp_id` and bump covisibility
    /// with every keyframe already observing the point.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let in_range = self
            .keyframes
            .get(&kf_id)
            .is_some_and(|kf| feature_idx < kf.num_features());
        let existing_observers = match self.map_points.get(&mp_id) {
            Some(mp) if in_range => mp.observers(),
            _ => return false,
        };
        if existing_observers.contains(&kf_id) {
            return false;
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_id in existing_observers {
            self.adjust_covisibility(kf_id, other_id, 1);
        }
        true
    }

    /// Remove the link held by feature `feature_idx` of `kf_id`, lowering covisibility.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observers()
            }
            None => Vec::new(),
        };

        for other_id in other_observers {
            self.adjust_covisibility(kf_id, other_id, -1);
        }
        Some(mp_id)
    }

    /// Remove the observation of `mp_id` by `kf_id`, wherever it is stored.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId) -> bool {
        let feature_idx = match self
            .map_points
            .get(&mp_id)
            .and_then(|mp| mp.observations.get(&kf_id))
        {
            Some(&idx) => idx,
            None => return false,
        };
        self.disassociate(kf_id, feature_idx) == Some(mp_id)
    }

    fn adjust_covisibility(&mut self, a: KeyFrameId, b: KeyFrameId, delta: i64) {
        if a == b {
            return;
        }
        let current = self
            .keyframes
            .get(&a)
            .map(|kf| kf.get_covisibility_weight(b))
            .unwrap_or(0);
        let weight = (current as i64 + delta).max(0) as usize;

        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.set_covisibility(b, weight);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.set_covisibility(a, weight);
        }
    }
}
