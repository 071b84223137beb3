use kornia_octree::OctreeError;

use crate::types::{LandmarkId, PoseId};

/// Error types for the mapping module.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MappingError {
    /// The spatial index could not be built.
    #[error(transparent)]
    Octree(#[from] OctreeError),

    /// A parameter is outside of its valid range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The camera model is not usable.
    #[error("Invalid camera model")]
    InvalidCamera,

    /// The pose does not exist in the map.
    #[error("Unknown pose {0}")]
    UnknownPose(PoseId),

    /// The landmark does not exist in the map.
    #[error("Unknown landmark {0}")]
    UnknownLandmark(LandmarkId),

    /// A pose with the same id exists already.
    #[error("Pose {0} exists already")]
    DuplicatePose(PoseId),

    /// A landmark with the same id exists already.
    #[error("Landmark {0} exists already")]
    DuplicateLandmark(LandmarkId),

    /// Two inputs that must pair up element-wise have different lengths.
    #[error("Mismatched lengths: {left} vs {right}")]
    MismatchedLengths {
        /// Length of the first input.
        left: usize,
        /// Length of the second input.
        right: usize,
    },

    /// Not enough correspondences to estimate a model.
    #[error("Insufficient correspondences: required {required}, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences provided.
        actual: usize,
    },

    /// The robust estimator did not find a consistent pose.
    #[error("Pose estimation failed")]
    PoseEstimationFailed,

    /// Cross-map alignment found too few corresponding poses.
    #[error("Insufficient corresponding poses: required {required}, got {actual}")]
    InsufficientPosePairs {
        /// Minimum number of pose pairs.
        required: usize,
        /// Number of pose pairs found.
        actual: usize,
    },

    /// The input geometry does not determine a unique solution.
    #[error("Degenerate configuration: {0}")]
    Degenerate(&'static str),

    /// The refinement did not produce a result, the map is left as it was.
    #[error("Refinement failed: {0}")]
    RefinementFailed(&'static str),
}
