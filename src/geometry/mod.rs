//! Geometry: rigid and similarity transforms on their Lie groups.

pub mod se3;
pub mod sim3;
pub mod so3;

pub use se3::SE3;
pub use sim3::{Sim3, Vector7};
pub use so3::skew;
