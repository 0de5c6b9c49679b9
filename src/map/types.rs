//! Identifier types for map entities.
//!
//! Keyframes and points reference each other through these ids, never through
//! pointers, so the map owns every entity and the optimizer can snapshot any
//! subset by id.

use serde::{Deserialize, Serialize};

/// Handle of a keyframe. Ids grow with insertion order, which makes the
/// smallest id the natural gauge anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Handle of a map point (3D landmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_by_value() {
        let mut ids = vec![KeyFrameId::new(3), KeyFrameId::new(0), KeyFrameId::new(2)];
        ids.sort();
        assert_eq!(ids.first(), Some(&KeyFrameId::new(0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyFrameId::new(7).to_string(), "KF7");
        assert_eq!(MapPointId::new(123).to_string(), "MP123");
    }
}
