//! Identifier types shared by the map structures.

use serde::{Deserialize, Serialize};

/// Stable identifier of a camera pose within a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoseId(pub u64);

impl PoseId {
    /// Create a new PoseId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PoseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Stable identifier of a 3D landmark within a map.
///
/// Landmark ids outlive any index built over the map; octree indices and array offsets must be
/// translated back to ids before they are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    /// Create a new LandmarkId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}
