//! Error types for graph construction and driver input validation.
//!
//! Numeric trouble inside the solver never surfaces here: it is absorbed by
//! damping. Drivers translate `InsufficientCorrespondences` into their
//! "no solution" result, so callers mostly see `Err` only for malformed input.

use thiserror::Error;

use crate::map::KeyFrameId;
use crate::optimizer::{VariableId, VariableKind};

/// Result type used throughout the optimizer.
pub type OptimResult<T> = Result<T, OptimError>;

#[derive(Debug, Clone, Error)]
pub enum OptimError {
    /// Fewer valid measurements than needed to constrain the free variables.
    #[error("insufficient correspondences: found {found}, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },

    /// A factor references a variable that was never added to the graph.
    #[error("unknown variable {0}")]
    UnknownVariable(VariableId),

    /// A factor was bound to a variable of the wrong kind.
    #[error("factor {factor}: variable #{position} must be {expected:?}, found {found:?}")]
    KindMismatch {
        factor: &'static str,
        position: usize,
        expected: VariableKind,
        found: VariableKind,
    },

    /// A factor was bound to the wrong number of variables.
    #[error("factor {factor}: expected {expected} variables, found {found}")]
    ArityMismatch {
        factor: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("unknown keyframe {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
