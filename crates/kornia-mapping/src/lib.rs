#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Kornia Mapping
//!
//! Consolidation of sparse landmark maps built by a visual tracker. A [`Map`] holds camera
//! poses, triangulated landmarks, the pixel observations linking them and binary descriptors
//! per landmark. The crate finds landmarks that describe the same physical point and fuses
//! them:
//!
//! - [`close_loops`] when the camera revisited a place and created a second copy of it,
//! - [`merge_duplicate_landmarks`] for duplicates found by following viewing rays,
//! - [`merge_maps`] to align an independently built map with a similarity transform and
//!   import it.
//!
//! Every stage removes landmarks ending up behind their cameras and refines the map afterwards.

/// Alignment and import of a second map.
pub mod alignment;

/// Camera projection models.
pub mod camera;

/// Grouping and merging of corresponding landmarks.
pub mod consolidation;

/// Storage of poses, landmarks and observations.
pub mod database;

/// Binary descriptors and descriptor indices.
pub mod descriptor;

/// Error types for the mapping module.
pub mod error;

/// Rigid and similarity transforms.
pub mod geometry;

/// The map container.
pub mod map;

/// Minimal three-point pose solver.
pub mod p3p;

/// Levenberg-Marquardt pose refinement.
pub mod pose_refinement;

/// Robust camera pose estimation.
pub mod pose_solver;

/// Pose and landmark refinement.
pub mod refinement;

/// Correspondence searches.
pub mod search;

/// Similarity estimation from corresponding poses.
pub mod similarity;

/// Identifier types.
pub mod types;

/// Vocabulary tree over binary descriptors.
pub mod vocabulary;

pub use alignment::{merge_maps, AlignmentReport};
pub use camera::{CameraModel, PinholeCamera};
pub use consolidation::{
    close_loops, consolidate, merge_duplicate_landmarks, ConsolidationParams, ConsolidationReport,
    MappingContext,
};
pub use database::Database;
pub use descriptor::{BinaryDescriptor, DescriptorMap};
pub use error::MappingError;
pub use geometry::{Sim3, SE3};
pub use map::Map;
pub use pose_refinement::{refine_pose, LmParams};
pub use pose_solver::{P3pRansacSolver, PoseSolver, RansacParams};
pub use refinement::{AlternatingRefiner, RefinementParams, Refiner};
pub use search::{CorrespondenceSet, LandmarkMergeParams, LoopClosureParams, MapAlignmentParams};
pub use types::{LandmarkId, PoseId};
