//! Factor-graph optimization.
//!
//! Core:
//! - Manifold variables and the factor catalogue
//! - Sparse Levenberg-Marquardt with Schur elimination of marginalized variables
//! - Robust round controller (chi2 gating, kernel removal, early exit)
//!
//! Drivers:
//! - Global and local bundle adjustment over the shared map
//! - Camera-pose, object-motion and flow/depth motion drivers
//! - Essential-graph Sim3 correction for loop closing
//! - Two-view Sim3 registration
//! - RANSAC over the flow driver

pub mod bundle;
pub mod factors;
pub mod global_ba;
pub mod graph;
pub mod local_ba;
pub mod motion;
pub mod pose_graph;
pub mod ransac;
pub mod robust;
pub mod sim3_registration;
pub mod solver;
pub mod variables;

pub use factors::{Factor, FactorKind, Gate, Huber};
pub use global_ba::{run_global_ba, GlobalBAConfig, GlobalBAResult};
pub use graph::{FactorId, Graph};
pub use local_ba::{run_local_ba, LocalBAConfig, LocalBAResult};
pub use motion::{optimize_motion, MotionDriverSpec, MotionModelKind, MotionResult, PriorWeight};
pub use pose_graph::{optimize_essential_graph, EssentialGraphConfig, EssentialGraphResult, LoopClosureInput};
pub use ransac::{flow_ransac, FlowRansacConfig, RansacResult};
pub use robust::{run_robust, RobustOutcome, RobustRound, RobustSchedule};
pub use sim3_registration::{optimize_sim3, Sim3RegistrationConfig};
pub use solver::{LevenbergMarquardt, SolveSummary, SolverConfig};
pub use variables::{Estimate, Variable, VariableId, VariableKind};
