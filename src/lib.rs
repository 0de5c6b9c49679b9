//! Factor-graph optimization back-end for visual SLAM with moving objects.
//!
//! Bundle adjustment, camera and object motion estimation, loop-closure
//! correction and two-view registration over a shared keyframe map.

pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod map;
pub mod optimizer;
pub mod system;

pub use config::OptimizerSettings;
pub use error::{OptimError, OptimResult};
