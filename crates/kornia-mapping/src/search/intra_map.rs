use glam::{DVec2, DVec3};
use kornia_octree::{Octree, OctreeParams, QueryStack};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{CorrespondenceSet, ImprovementBudget};
use crate::camera::CameraModel;
use crate::descriptor::set_distance;
use crate::error::MappingError;
use crate::geometry::SE3;
use crate::map::Map;
use crate::types::{LandmarkId, PoseId};

/// Parameters of the duplicate landmark search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkMergeParams {
    /// Largest pixel distance between an observation and a projected candidate.
    pub max_projection_error: f64,
    /// Largest Hamming distance between the descriptor sets of a pair.
    pub max_descriptor_distance: u32,
    /// The search stops after this many iterations in a row without a new pair.
    pub iterations_without_improvement: usize,
    /// Fraction of the observing poses of one landmark the other one must reproject into.
    pub min_reprojection_fraction: f64,
    /// Tangent of the half opening angle of the candidate cone around a viewing ray, zero
    /// queries the plain ray.
    pub ray_tan_half_angle: f64,
    /// Parameters of the octree over the landmarks.
    pub octree: OctreeParams,
}

impl Default for LandmarkMergeParams {
    fn default() -> Self {
        Self {
            max_projection_error: 3.0,
            max_descriptor_distance: 64,
            iterations_without_improvement: 100,
            min_reprojection_fraction: 0.1,
            ray_tan_half_angle: 0.5f64.to_radians().tan(),
            octree: OctreeParams::default(),
        }
    }
}

impl LandmarkMergeParams {
    fn validate(&self) -> Result<(), MappingError> {
        if !(self.max_projection_error > 0.0) {
            return Err(MappingError::InvalidParameter("projection error must be positive"));
        }
        if self.iterations_without_improvement == 0 {
            return Err(MappingError::InvalidParameter("at least one iteration is required"));
        }
        if !(0.0..=1.0).contains(&self.min_reprojection_fraction) {
            return Err(MappingError::InvalidParameter("reprojection fraction must be in [0, 1]"));
        }
        if !(self.ray_tan_half_angle >= 0.0 && self.ray_tan_half_angle.is_finite()) {
            return Err(MappingError::InvalidParameter(
                "cone angle must be finite and not negative",
            ));
        }
        Ok(())
    }
}

/// Finds pairs of landmarks in one map that describe the same point.
///
/// Each iteration picks a random pose and follows the viewing ray of every positioned landmark
/// it observes through an octree over all landmarks. A candidate on the ray must project close
/// to the observation, have the closest descriptors, never be seen together with the landmark
/// and reproject well into enough of the poses observing the other landmark.
///
/// # Arguments
///
/// * `map` - The map to search.
/// * `camera` - The camera model of all poses.
/// * `rng` - Random source for pose sampling.
/// * `params` - The search parameters.
pub fn find_duplicate_landmarks<R: Rng + ?Sized>(
    map: &Map,
    camera: &dyn CameraModel,
    rng: &mut R,
    params: &LandmarkMergeParams,
) -> Result<CorrespondenceSet, MappingError> {
    if !camera.is_valid() {
        return Err(MappingError::InvalidCamera);
    }
    params.validate()?;

    let mut pairs = CorrespondenceSet::new();

    let (ids, positions) = map.database.landmarks_with_positions();
    let poses = map.database.valid_poses().collect::<Vec<_>>();
    if ids.len() < 2 || poses.is_empty() {
        return Ok(pairs);
    }

    let octree = Octree::new(&positions, &params.octree)?;
    let mut stack = QueryStack::new();
    let mut leaves = Vec::new();

    let mut budget = ImprovementBudget::new(params.iterations_without_improvement);
    let mut iteration = 0usize;

    while !budget.is_exhausted() {
        iteration += 1;

        let (pose_id, world_t_camera) = poses[rng.random_range(0..poses.len())];

        let observations = map.database.observations_in_pose(pose_id)?.collect::<Vec<_>>();

        let mut added = 0;
        for (landmark, pixel) in observations {
            let Some(position) = map.database.landmark_position(landmark)? else {
                continue;
            };
            let Some(ray) = camera.ray(pixel, &world_t_camera) else {
                continue;
            };

            leaves.clear();
            if params.ray_tan_half_angle > 0.0 {
                octree.intersecting_leaves_in_cone(
                    &ray,
                    params.ray_tan_half_angle,
                    &mut leaves,
                    &mut stack,
                );
            } else {
                octree.intersecting_leaves(&ray, &mut leaves, &mut stack);
            }

            let query = Query {
                landmark,
                pixel,
                pose_id,
                world_t_camera,
            };
            let Some((candidate, candidate_position)) =
                best_candidate(map, camera, params, &query, &ids, &positions, &leaves)
            else {
                continue;
            };

            if map.database.are_co_visible(landmark, candidate) {
                continue;
            }

            if !reprojects_into_observers(map, camera, params, candidate_position, landmark)?
                || !reprojects_into_observers(map, camera, params, position, candidate)?
            {
                continue;
            }

            if pairs.insert(landmark, candidate) {
                added += 1;
            }
        }

        if added > 0 {
            info!(
                "Duplicate search iteration {}: {} new pairs, {} in total",
                iteration,
                added,
                pairs.len()
            );
        }
        budget.record(added > 0);
    }

    Ok(pairs)
}

struct Query {
    landmark: LandmarkId,
    pixel: DVec2,
    pose_id: PoseId,
    world_t_camera: SE3,
}

/// The candidate with the closest descriptors among those projecting close to the query pixel.
fn best_candidate(
    map: &Map,
    camera: &dyn CameraModel,
    params: &LandmarkMergeParams,
    query: &Query,
    ids: &[LandmarkId],
    positions: &[DVec3],
    leaves: &[&[u32]],
) -> Option<(LandmarkId, DVec3)> {
    let sqr_max_error = params.max_projection_error * params.max_projection_error;
    let descriptors = map.descriptors.get(query.landmark);

    let mut best: Option<(LandmarkId, DVec3, u32)> = None;

    for &index in leaves.iter().flat_map(|leaf| leaf.iter()) {
        let index = index as usize;
        let candidate = ids[index];

        // a landmark already seen in this image cannot be the same point
        if candidate == query.landmark
            || map.database.observation(query.pose_id, candidate).is_some()
        {
            continue;
        }

        let Some(projected) = camera.project(&query.world_t_camera, positions[index]) else {
            continue;
        };
        if projected.distance_squared(query.pixel) > sqr_max_error {
            continue;
        }

        let distance = set_distance(descriptors, map.descriptors.get(candidate));
        if best.map_or(true, |(_, _, best_distance)| distance < best_distance) {
            best = Some((candidate, positions[index], distance));
        }
    }

    best.filter(|(_, _, distance)| *distance <= params.max_descriptor_distance)
        .map(|(candidate, position, _)| (candidate, position))
}

/// Returns whether `point` projects close to the observations of `observed` in enough of the
/// poses observing it.
fn reprojects_into_observers(
    map: &Map,
    camera: &dyn CameraModel,
    params: &LandmarkMergeParams,
    point: DVec3,
    observed: LandmarkId,
) -> Result<bool, MappingError> {
    let sqr_max_error = params.max_projection_error * params.max_projection_error;

    let mut valid = 0usize;
    let mut precise = 0usize;

    for (pose_id, pixel) in map.database.observations_of_landmark(observed)? {
        let Some(world_t_camera) = map.database.pose(pose_id)? else {
            continue;
        };
        valid += 1;
        if camera
            .project(&world_t_camera, point)
            .is_some_and(|projected| projected.distance_squared(pixel) <= sqr_max_error)
        {
            precise += 1;
        }
    }

    let required = (params.min_reprojection_fraction * valid as f64).floor() as usize;
    Ok(valid > 0 && precise >= 1 && precise >= required)
}
