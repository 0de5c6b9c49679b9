//! Optimizer settings loaded from YAML.
//!
//! Every section is optional; missing sections and fields keep the defaults
//! of the corresponding driver config.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use tracing::warn;

use crate::optimizer::{
    EssentialGraphConfig, FlowRansacConfig, GlobalBAConfig, LocalBAConfig, MotionDriverSpec,
    Sim3RegistrationConfig,
};

/// Motion driver recipes, one per use in the tracking front-end.
///
/// A preset given in YAML is merged onto that preset's own defaults: nested
/// maps merge key by key, anything else replaces the default value.
#[derive(Debug, Clone, Serialize)]
pub struct MotionPresets {
    pub camera_tracking: MotionDriverSpec,
    pub camera_flow_tracking: MotionDriverSpec,
    pub frame_pose: MotionDriverSpec,
    pub object_pose: MotionDriverSpec,
    pub object_pose_centered: MotionDriverSpec,
    pub object_motion: MotionDriverSpec,
    pub object_motion_with_points: MotionDriverSpec,
    pub flow: MotionDriverSpec,
    pub flow_refined: MotionDriverSpec,
    pub depth: MotionDriverSpec,
    pub flow_depth: MotionDriverSpec,
    pub flow_depth_weighted: MotionDriverSpec,
    pub split_flow_depth: MotionDriverSpec,
    pub forward_backward: MotionDriverSpec,
}

impl Default for MotionPresets {
    fn default() -> Self {
        Self {
            camera_tracking: MotionDriverSpec::camera_tracking(),
            camera_flow_tracking: MotionDriverSpec::camera_flow_tracking(),
            frame_pose: MotionDriverSpec::frame_pose(),
            object_pose: MotionDriverSpec::object_pose(),
            object_pose_centered: MotionDriverSpec::object_pose_centered(),
            object_motion: MotionDriverSpec::object_motion(),
            object_motion_with_points: MotionDriverSpec::object_motion_with_points(),
            flow: MotionDriverSpec::flow(),
            flow_refined: MotionDriverSpec::flow_refined(),
            depth: MotionDriverSpec::depth(),
            flow_depth: MotionDriverSpec::flow_depth(),
            flow_depth_weighted: MotionDriverSpec::flow_depth_weighted(),
            split_flow_depth: MotionDriverSpec::split_flow_depth(),
            forward_backward: MotionDriverSpec::forward_backward(),
        }
    }
}

impl MotionPresets {
    fn preset_mut(&mut self, name: &str) -> Option<&mut MotionDriverSpec> {
        let spec = match name {
            "camera_tracking" => &mut self.camera_tracking,
            "camera_flow_tracking" => &mut self.camera_flow_tracking,
            "frame_pose" => &mut self.frame_pose,
            "object_pose" => &mut self.object_pose,
            "object_pose_centered" => &mut self.object_pose_centered,
            "object_motion" => &mut self.object_motion,
            "object_motion_with_points" => &mut self.object_motion_with_points,
            "flow" => &mut self.flow,
            "flow_refined" => &mut self.flow_refined,
            "depth" => &mut self.depth,
            "flow_depth" => &mut self.flow_depth,
            "flow_depth_weighted" => &mut self.flow_depth_weighted,
            "split_flow_depth" => &mut self.split_flow_depth,
            "forward_backward" => &mut self.forward_backward,
            _ => return None,
        };
        Some(spec)
    }
}

impl<'de> Deserialize<'de> for MotionPresets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let overrides = Option::<serde_yaml::Mapping>::deserialize(deserializer)?.unwrap_or_default();
        let mut presets = MotionPresets::default();
        for (key, patch) in overrides {
            let Some(name) = key.as_str() else {
                return Err(D::Error::custom("motion preset names must be strings"));
            };
            let Some(spec) = presets.preset_mut(name) else {
                warn!("Ignoring unknown motion preset {:?}", name);
                continue;
            };
            let mut merged = serde_yaml::to_value(&*spec).map_err(D::Error::custom)?;
            merge_yaml(&mut merged, patch);
            *spec = serde_yaml::from_value(merged)
                .map_err(|e| D::Error::custom(format!("motion preset {}: {}", name, e)))?;
        }
        Ok(presets)
    }
}

fn merge_yaml(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base), Value::Mapping(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// All optimizer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub global_ba: GlobalBAConfig,
    pub local_ba: LocalBAConfig,
    pub essential_graph: EssentialGraphConfig,
    pub sim3_registration: Sim3RegistrationConfig,
    pub ransac: FlowRansacConfig,
    pub motion: MotionPresets,
}

impl OptimizerSettings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse optimizer settings")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::MotionModelKind;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let settings = OptimizerSettings::from_yaml_str("{}").unwrap();
        assert_eq!(settings.local_ba.first_iterations, 5);
        assert_eq!(settings.essential_graph.iterations, 20);
        assert_eq!(settings.motion.forward_backward.kind, MotionModelKind::ForwardBackward);
    }

    #[test]
    fn test_partial_override() {
        let yaml = "
local_ba:
  second_iterations: 3
ransac:
  seed: 42
  inlier_threshold: 0.5
motion:
  object_pose:
    centroid_preconditioning: true
";
        let settings = OptimizerSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.local_ba.second_iterations, 3);
        assert_eq!(settings.local_ba.first_iterations, 5);
        assert_eq!(settings.ransac.seed, 42);
        assert_eq!(settings.ransac.samples, 100);
        assert!(settings.motion.object_pose.centroid_preconditioning);
    }

    #[test]
    fn test_partial_preset_keeps_its_own_defaults() {
        let yaml = "
motion:
  object_pose:
    centroid_preconditioning: true
  frame_pose:
    schedule:
      min_active: 3
";
        let settings = OptimizerSettings::from_yaml_str(yaml).unwrap();
        let object_pose = &settings.motion.object_pose;
        assert!(object_pose.centroid_preconditioning);
        assert_eq!(object_pose.schedule.rounds.len(), 4);
        assert_eq!(object_pose.schedule.rounds[0].chi2_mono, 5.991);
        assert_eq!(object_pose.huber_delta, Some(5.991_f64.sqrt()));

        let frame_pose = &settings.motion.frame_pose;
        assert_eq!(frame_pose.schedule.min_active, 3);
        assert_eq!(frame_pose.schedule.rounds[0].chi2_stereo, 7.815);
        assert!(frame_pose.use_stereo);
        assert_eq!(settings.motion.camera_tracking.schedule.rounds.len(), 1);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = OptimizerSettings::from_yaml_file("/nonexistent/optimizer.yaml").unwrap_err();
        assert!(format!("{}", err).contains("Failed to open"));
    }
}
