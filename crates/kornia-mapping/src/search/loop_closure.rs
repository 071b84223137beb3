use std::collections::BTreeSet;

use glam::{DVec2, DVec3};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{CorrespondenceSet, ImprovementBudget};
use crate::camera::CameraModel;
use crate::descriptor::{BruteForceIndex, DescriptorIndex};
use crate::error::MappingError;
use crate::map::Map;
use crate::pose_solver::{PoseSolver, RansacParams};
use crate::types::{LandmarkId, PoseId};

/// Parameters of the loop closure search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosureParams {
    /// A pose pair needs more descriptor matches than this to be tried, also the minimum number
    /// of pose inliers.
    pub min_valid_correspondences: usize,
    /// Pose pairs sharing more landmarks than this are skipped, they are already connected.
    pub max_overlapping_landmarks: usize,
    /// Largest Hamming distance of a descriptor match.
    pub max_descriptor_distance: u32,
    /// The search stops after this many iterations in a row without a new pair.
    pub iterations_without_improvement: usize,
    /// Parameters of the pose solver, `min_inliers` is overridden.
    pub ransac: RansacParams,
}

impl Default for LoopClosureParams {
    fn default() -> Self {
        Self {
            min_valid_correspondences: 20,
            max_overlapping_landmarks: 5,
            max_descriptor_distance: 64,
            iterations_without_improvement: 100,
            ransac: RansacParams {
                inlier_rate: 0.85,
                ..Default::default()
            },
        }
    }
}

/// Finds landmarks that were created twice when the camera revisited a place.
///
/// Each iteration picks two random poses that share hardly any landmark. The positioned
/// landmarks seen only by the first pose are matched by descriptor against the observations
/// only seen by the second pose, and the camera of the second pose is re-localized from those
/// matches. Every inlier of the pose is a pair of landmarks describing the same point.
///
/// # Arguments
///
/// * `map` - The map to search.
/// * `camera` - The camera model of all poses.
/// * `solver` - Robust pose solver for verifying the matches.
/// * `rng` - Random source for pose sampling and the solver.
/// * `params` - The search parameters.
///
/// # Returns
///
/// The found pairs, possibly empty.
pub fn find_loop_closures<S: PoseSolver, R: Rng + ?Sized>(
    map: &Map,
    camera: &dyn CameraModel,
    solver: &S,
    rng: &mut R,
    params: &LoopClosureParams,
) -> Result<CorrespondenceSet, MappingError> {
    if !camera.is_valid() {
        return Err(MappingError::InvalidCamera);
    }
    if params.min_valid_correspondences == 0 {
        return Err(MappingError::InvalidParameter("at least one correspondence is required"));
    }
    if params.iterations_without_improvement == 0 {
        return Err(MappingError::InvalidParameter("at least one iteration is required"));
    }
    params.ransac.validate()?;

    let mut pairs = CorrespondenceSet::new();

    let pose_ids = map.database.pose_ids().collect::<Vec<_>>();
    if pose_ids.len() < 2 {
        return Ok(pairs);
    }

    let ransac = RansacParams {
        min_inliers: params.min_valid_correspondences,
        ..params.ransac
    };

    let mut budget = ImprovementBudget::new(params.iterations_without_improvement);
    let mut iteration = 0usize;

    while !budget.is_exhausted() {
        iteration += 1;

        let sample = rand::seq::index::sample(rng, pose_ids.len(), 2);
        let object_pose = pose_ids[sample.index(0)];
        let image_pose = pose_ids[sample.index(1)];

        let added = close_pose_pair(
            map,
            camera,
            solver,
            rng,
            params,
            &ransac,
            object_pose,
            image_pose,
            &mut pairs,
        )?;
        if added > 0 {
            info!(
                "Loop closure iteration {}: {} new pairs, {} in total",
                iteration,
                added,
                pairs.len()
            );
        }
        budget.record(added > 0);
    }

    Ok(pairs)
}

fn positioned_landmarks(map: &Map, pose: PoseId) -> Result<BTreeSet<LandmarkId>, MappingError> {
    let mut landmarks = BTreeSet::new();
    for id in map.database.landmarks_in_pose(pose)? {
        if map.database.landmark_position(id)?.is_some() {
            landmarks.insert(id);
        }
    }
    Ok(landmarks)
}

#[allow(clippy::too_many_arguments)]
fn close_pose_pair<S: PoseSolver, R: Rng + ?Sized>(
    map: &Map,
    camera: &dyn CameraModel,
    solver: &S,
    rng: &mut R,
    params: &LoopClosureParams,
    ransac: &RansacParams,
    object_pose: PoseId,
    image_pose: PoseId,
    pairs: &mut CorrespondenceSet,
) -> Result<usize, MappingError> {
    let object_landmarks = positioned_landmarks(map, object_pose)?;
    let image_landmarks = positioned_landmarks(map, image_pose)?;

    let overlap = object_landmarks.intersection(&image_landmarks).count();
    if overlap > params.max_overlapping_landmarks {
        debug!("Poses {object_pose} and {image_pose} share {overlap} landmarks, skipping");
        return Ok(0);
    }

    let mut candidates = Vec::new();
    let mut entries = Vec::new();
    for &id in object_landmarks.difference(&image_landmarks) {
        let Some(position) = map.database.landmark_position(id)? else {
            continue;
        };
        let index = candidates.len();
        candidates.push((id, position));
        entries.extend(map.descriptors.get(id).iter().map(|descriptor| (index, *descriptor)));
    }
    let index = BruteForceIndex::new(entries);

    let mut object_points: Vec<DVec3> = Vec::new();
    let mut image_points: Vec<DVec2> = Vec::new();
    let mut matched: Vec<(LandmarkId, LandmarkId)> = Vec::new();

    for &id in image_landmarks.difference(&object_landmarks) {
        let Some(pixel) = map.database.observation(image_pose, id) else {
            continue;
        };
        let Some((best, distance)) = index.nearest_of_set(map.descriptors.get(id)) else {
            continue;
        };
        if distance > params.max_descriptor_distance {
            continue;
        }
        let (candidate_id, position) = candidates[best];
        object_points.push(position);
        image_points.push(pixel);
        matched.push((candidate_id, id));
    }

    if matched.len() <= params.min_valid_correspondences {
        debug!(
            "Poses {object_pose} and {image_pose}: {} descriptor matches, not enough",
            matched.len()
        );
        return Ok(0);
    }

    let estimate = match solver.estimate_pose(camera, &object_points, &image_points, rng, ransac) {
        Ok(estimate) => estimate,
        Err(err) => {
            debug!("Poses {object_pose} and {image_pose}: {err}");
            return Ok(0);
        }
    };

    let added = estimate
        .inliers
        .iter()
        .filter(|&&i| pairs.insert(matched[i].0, matched[i].1))
        .count();

    Ok(added)
}
