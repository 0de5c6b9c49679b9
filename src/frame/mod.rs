//! Per-frame measurement snapshot consumed by the motion drivers.
//!
//! A `Frame` carries what the front-end produced for one image: keypoints,
//! their depths, the forward optical flow at each keypoint and, optionally,
//! the right-image abscissa for stereo input. The drivers never mutate it.

pub mod camera;

use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;

pub use camera::CameraModel;

/// Measurements of one frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera: CameraModel,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    /// Undistorted keypoint positions in pixels.
    pub keypoints: Vec<Vector2<f64>>,

    /// Depth per keypoint (non-positive when unknown).
    pub depths: Vec<f64>,

    /// Forward optical flow per keypoint, towards the next frame.
    pub flows: Vec<Vector2<f64>>,

    /// Right-image u coordinate per keypoint (negative for monocular features).
    pub u_right: Vec<f64>,
}

/// Index pair linking a keypoint of the previous frame to one of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correspondence {
    pub previous: usize,
    pub current: usize,
}

impl Correspondence {
    pub fn new(previous: usize, current: usize) -> Self {
        Self { previous, current }
    }
}

impl Frame {
    /// Frame without stereo matches; `depths` and `flows` are indexed like `keypoints`.
    pub fn new(
        camera: CameraModel,
        pose: SE3,
        keypoints: Vec<Vector2<f64>>,
        depths: Vec<f64>,
        flows: Vec<Vector2<f64>>,
    ) -> Self {
        let n = keypoints.len();
        Self {
            camera,
            pose,
            keypoints,
            depths,
            flows,
            u_right: vec![-1.0; n],
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn depth(&self, idx: usize) -> Option<f64> {
        self.depths.get(idx).copied().filter(|d| *d > 0.0)
    }

    pub fn flow(&self, idx: usize) -> Option<Vector2<f64>> {
        self.flows.get(idx).copied()
    }

    /// Right-image abscissa if this keypoint has a stereo match.
    pub fn stereo_u(&self, idx: usize) -> Option<f64> {
        self.u_right.get(idx).copied().filter(|u| *u >= 0.0)
    }

    /// Back-project keypoint `idx` into the camera frame using its depth.
    pub fn unproject_camera(&self, idx: usize) -> Option<Vector3<f64>> {
        let uv = self.keypoints.get(idx)?;
        let depth = self.depth(idx)?;
        Some(self.camera.unproject(uv, depth))
    }

    /// Back-project keypoint `idx` into the world frame.
    pub fn unproject_world(&self, idx: usize) -> Option<Vector3<f64>> {
        self.unproject_camera(idx)
            .map(|p| self.pose.transform_point(&p))
    }

    /// Front-end `(flow_x, flow_y, depth)` estimate at keypoint `idx`.
    pub fn flow_depth(&self, idx: usize) -> Option<Vector3<f64>> {
        let flow = self.flow(idx)?;
        let depth = self.depth(idx)?;
        Some(Vector3::new(flow.x, flow.y, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_frame() -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 0.1);
        Frame::new(
            camera,
            SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)),
            vec![Vector2::new(320.0, 240.0), Vector2::new(100.0, 100.0)],
            vec![2.0, -1.0],
            vec![Vector2::new(1.5, -0.5), Vector2::zeros()],
        )
    }

    #[test]
    fn test_unproject_world_applies_pose() {
        let frame = test_frame();
        let p = frame.unproject_world(0).unwrap();
        assert_relative_eq!(p, Vector3::new(1.0, 0.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_depth_has_no_point() {
        let frame = test_frame();
        assert!(frame.unproject_camera(1).is_none());
        assert!(frame.flow_depth(1).is_none());
        assert!(frame.unproject_camera(7).is_none());
    }

    #[test]
    fn test_flow_depth() {
        let frame = test_frame();
        assert_eq!(frame.flow_depth(0), Some(Vector3::new(1.5, -0.5, 2.0)));
        assert!(frame.stereo_u(0).is_none());
    }
}
