//! Similarity transform between two sets of corresponding poses.

use glam::{DMat3, DQuat, DVec3};

use crate::error::MappingError;
use crate::geometry::{closest_rotation, Sim3, SE3};

/// Estimates the similarity `target_T_source` that best maps `source` poses onto `target` poses.
///
/// The rotation aligns the camera orientations, the scale is the ratio of the spread of the
/// camera centers around their centroids and the translation maps the source centroid onto the
/// target centroid.
///
/// # Arguments
///
/// * `source` - Camera poses expressed in the source frame.
/// * `target` - The same cameras expressed in the target frame.
///
/// # Returns
///
/// The similarity taking source coordinates to target coordinates.
pub fn estimate_similarity(source: &[SE3], target: &[SE3]) -> Result<Sim3, MappingError> {
    if source.len() != target.len() {
        return Err(MappingError::MismatchedLengths {
            left: source.len(),
            right: target.len(),
        });
    }
    if source.len() < 2 {
        return Err(MappingError::InsufficientCorrespondences {
            required: 2,
            actual: source.len(),
        });
    }

    let n = source.len() as f64;

    let mut correlation = DMat3::ZERO;
    for (s, t) in source.iter().zip(target) {
        correlation += t.rotation_matrix() * s.rotation_matrix().transpose();
    }
    let rotation = DQuat::from_mat3(&closest_rotation(&correlation)).normalize();

    let source_centroid = source.iter().map(SE3::translation).sum::<DVec3>() / n;
    let target_centroid = target.iter().map(SE3::translation).sum::<DVec3>() / n;

    let source_spread = source
        .iter()
        .map(|s| s.translation().distance_squared(source_centroid))
        .sum::<f64>();
    let target_spread = target
        .iter()
        .map(|t| t.translation().distance_squared(target_centroid))
        .sum::<f64>();

    if source_spread <= f64::EPSILON || target_spread <= f64::EPSILON {
        return Err(MappingError::Degenerate("camera centers do not spread"));
    }

    let scale = (target_spread / source_spread).sqrt();
    if !scale.is_finite() || scale <= 0.0 {
        return Err(MappingError::Degenerate("invalid scale"));
    }

    let translation = target_centroid - scale * (rotation * source_centroid);

    Ok(Sim3::new(scale, rotation, translation))
}
