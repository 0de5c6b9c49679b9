//! Map module - keyframes, map points and their relationships.
//!
//! The map forms a bipartite graph:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames additionally carry the covisibility graph, the spanning tree and
//! loop edges, which together make up the essential graph used by the
//! pose-graph corrector.

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::{KeyFrame, KeyPoint};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
