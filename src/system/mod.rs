//! Concurrency plumbing around the map.

pub mod shared_state;

pub use shared_state::SharedMap;
