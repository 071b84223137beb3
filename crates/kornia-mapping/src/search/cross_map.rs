use std::collections::BTreeSet;

use glam::{DVec2, DVec3};
use kornia_octree::{Octree, OctreeParams, QueryStack};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ImprovementBudget;
use crate::camera::CameraModel;
use crate::descriptor::{set_distance, DescriptorIndex};
use crate::error::MappingError;
use crate::geometry::SE3;
use crate::map::Map;
use crate::pose_solver::{PoseSolver, RansacParams};
use crate::types::{LandmarkId, PoseId};
use crate::vocabulary::{VocabularyParams, VocabularyTree};

/// Parameters of the alignment of two maps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapAlignmentParams {
    /// Minimum number of matched landmarks for a pose to be localized in the other map.
    pub min_correspondences_per_pose: usize,
    /// Minimum number of localized poses needed to align the maps.
    pub min_corresponding_poses: usize,
    /// The search stops after this many iterations in a row without a new pair.
    pub iterations_without_improvement: usize,
    /// The search stops once this many poses were localized.
    pub max_pose_pairs: usize,
    /// Largest Hamming distance of a descriptor match.
    pub max_descriptor_distance: u32,
    /// Pixel threshold for guided matching and pose inliers.
    pub max_projection_error: f64,
    /// Expected fraction of correct descriptor matches.
    pub inlier_rate: f64,
    /// Upper bound on the RANSAC iterations per localization.
    pub max_ransac_iterations: usize,
    /// Tangent of the half opening angle of the cone used for guided matching.
    pub guided_tan_half_angle: f64,
    /// Parameters of the descriptor index over each map.
    pub vocabulary: VocabularyParams,
    /// Parameters of the octree over each map.
    pub octree: OctreeParams,
}

impl Default for MapAlignmentParams {
    fn default() -> Self {
        Self {
            min_correspondences_per_pose: 20,
            min_corresponding_poses: 3,
            iterations_without_improvement: 100,
            max_pose_pairs: 50,
            max_descriptor_distance: 64,
            max_projection_error: 3.0,
            inlier_rate: 0.15,
            max_ransac_iterations: 1000,
            guided_tan_half_angle: 0.01,
            vocabulary: VocabularyParams::default(),
            octree: OctreeParams::default(),
        }
    }
}

impl MapAlignmentParams {
    pub(crate) fn validate(&self) -> Result<(), MappingError> {
        if self.min_correspondences_per_pose == 0 {
            return Err(MappingError::InvalidParameter(
                "at least one correspondence per pose is required",
            ));
        }
        if self.min_corresponding_poses == 0 {
            return Err(MappingError::InvalidParameter(
                "at least one corresponding pose is required",
            ));
        }
        if self.iterations_without_improvement == 0 {
            return Err(MappingError::InvalidParameter("at least one iteration is required"));
        }
        if self.max_pose_pairs == 0 {
            return Err(MappingError::InvalidParameter("at least one pose pair is required"));
        }
        if !(self.guided_tan_half_angle >= 0.0 && self.guided_tan_half_angle.is_finite()) {
            return Err(MappingError::InvalidParameter(
                "cone angle must be finite and not negative",
            ));
        }
        self.ransac().validate()
    }

    fn ransac(&self) -> RansacParams {
        RansacParams {
            max_reprojection_error: self.max_projection_error,
            min_inliers: self.min_correspondences_per_pose,
            inlier_rate: self.inlier_rate,
            max_iterations: self.max_ransac_iterations,
            ..Default::default()
        }
    }
}

/// The same camera expressed in both maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosePair {
    /// The `world_T_camera` pose in the source map.
    pub source: SE3,
    /// The `world_T_camera` pose in the target map.
    pub target: SE3,
}

/// Outcome of the search for correspondences between two maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrossMapMatches {
    /// Pairs of `(source landmark, target landmark)` describing the same point.
    pub landmark_pairs: BTreeSet<(LandmarkId, LandmarkId)>,
    /// Poses localized in both maps, in order of discovery.
    pub pose_pairs: Vec<PosePair>,
}

/// Landmarks of one map prepared for matching: positions, octree and descriptor index.
struct MapIndex {
    ids: Vec<LandmarkId>,
    positions: Vec<DVec3>,
    octree: Octree,
    vocabulary: VocabularyTree<u32>,
}

impl MapIndex {
    fn new<R: Rng + ?Sized>(
        map: &Map,
        params: &MapAlignmentParams,
        rng: &mut R,
    ) -> Result<Self, MappingError> {
        let (all_ids, all_positions) = map.database.landmarks_with_positions();
        let (ids, positions): (Vec<_>, Vec<_>) = all_ids
            .into_iter()
            .zip(all_positions)
            .filter(|(id, _)| map.descriptors.contains(*id))
            .unzip();

        let entries = ids
            .iter()
            .enumerate()
            .flat_map(|(index, id)| {
                map.descriptors
                    .get(*id)
                    .iter()
                    .map(move |descriptor| (index as u32, *descriptor))
            })
            .collect::<Vec<_>>();

        Ok(Self {
            octree: Octree::new(&positions, &params.octree)?,
            vocabulary: VocabularyTree::new(entries, &params.vocabulary, rng)?,
            ids,
            positions,
        })
    }
}

/// One side of the alignment.
struct MapView<'a> {
    map: &'a Map,
    camera: &'a dyn CameraModel,
    poses: Vec<(PoseId, SE3)>,
    index: MapIndex,
}

/// A pose of one map localized in the other map.
struct Localization {
    /// Pairs of `(query landmark, other landmark)`.
    pairs: Vec<(LandmarkId, LandmarkId)>,
    /// The pose in the frame of the other map.
    world_t_camera: SE3,
}

/// Finds landmarks shared by two independently built maps and the poses relating them.
///
/// Iterations alternate between localizing a random source pose in the target map and a
/// random target pose in the source map. A pose is first localized from descriptor matches
/// against the vocabulary of the other map; the estimate then guides a second matching pass
/// restricted to landmarks projecting close to each observation. Whenever an iteration adds
/// new landmark pairs, the pose is recorded in both frames.
///
/// # Arguments
///
/// * `source` - The map to align.
/// * `source_camera` - The camera model of the source map.
/// * `target` - The reference map.
/// * `target_camera` - The camera model of the target map.
/// * `solver` - Robust pose solver used for localization.
/// * `rng` - Random source.
/// * `params` - The search parameters.
pub fn find_cross_map_correspondences<S: PoseSolver, R: Rng + ?Sized>(
    source: &Map,
    source_camera: &dyn CameraModel,
    target: &Map,
    target_camera: &dyn CameraModel,
    solver: &S,
    rng: &mut R,
    params: &MapAlignmentParams,
) -> Result<CrossMapMatches, MappingError> {
    if !source_camera.is_valid() || !target_camera.is_valid() {
        return Err(MappingError::InvalidCamera);
    }
    params.validate()?;

    let mut matches = CrossMapMatches::default();

    let source_view = MapView {
        map: source,
        camera: source_camera,
        poses: source.database.valid_poses().collect(),
        index: MapIndex::new(source, params, rng)?,
    };
    let target_view = MapView {
        map: target,
        camera: target_camera,
        poses: target.database.valid_poses().collect(),
        index: MapIndex::new(target, params, rng)?,
    };

    if source_view.poses.is_empty() || target_view.poses.is_empty() {
        return Ok(matches);
    }

    let ransac = params.ransac();
    let mut budget = ImprovementBudget::new(params.iterations_without_improvement);
    let mut iteration = 0usize;

    while !budget.is_exhausted() && matches.pose_pairs.len() < params.max_pose_pairs {
        let from_source = iteration % 2 == 0;
        iteration += 1;

        let (query, other) = if from_source {
            (&source_view, &target_view)
        } else {
            (&target_view, &source_view)
        };

        let (pose_id, world_t_camera) = query.poses[rng.random_range(0..query.poses.len())];

        let localization = localize(
            query,
            pose_id,
            world_t_camera,
            other,
            solver,
            rng,
            params,
            &ransac,
        )?;
        let Some(localization) = localization else {
            budget.record(false);
            continue;
        };

        let mut added = 0;
        for (query_landmark, other_landmark) in localization.pairs {
            let pair = if from_source {
                (query_landmark, other_landmark)
            } else {
                (other_landmark, query_landmark)
            };
            if matches.landmark_pairs.insert(pair) {
                added += 1;
            }
        }

        if added > 0 {
            matches.pose_pairs.push(if from_source {
                PosePair {
                    source: world_t_camera,
                    target: localization.world_t_camera,
                }
            } else {
                PosePair {
                    source: localization.world_t_camera,
                    target: world_t_camera,
                }
            });
            info!(
                "Localized {} pose {pose_id} in the {} map: {added} new pairs, {} pose pairs",
                if from_source { "source" } else { "target" },
                if from_source { "target" } else { "source" },
                matches.pose_pairs.len()
            );
        }
        budget.record(added > 0);
    }

    Ok(matches)
}

/// Localizes a pose of the query map in the other map.
#[allow(clippy::too_many_arguments)]
fn localize<S: PoseSolver, R: Rng + ?Sized>(
    query: &MapView<'_>,
    pose_id: PoseId,
    world_t_camera: SE3,
    other: &MapView<'_>,
    solver: &S,
    rng: &mut R,
    params: &MapAlignmentParams,
    ransac: &RansacParams,
) -> Result<Option<Localization>, MappingError> {
    let mut landmarks = Vec::new();
    let mut pixels = Vec::new();
    for (landmark, pixel) in query.map.database.observations_in_pose(pose_id)? {
        if query.map.database.landmark_position(landmark)?.is_some()
            && query.map.descriptors.contains(landmark)
        {
            landmarks.push(landmark);
            pixels.push(pixel);
        }
    }

    if landmarks.len() < params.min_correspondences_per_pose {
        debug!("Pose {pose_id} sees {} described landmarks, skipping", landmarks.len());
        return Ok(None);
    }

    // unguided: descriptor lookup in the whole other map
    let mut matched = Vec::new();
    for (k, landmark) in landmarks.iter().enumerate() {
        let descriptors = query.map.descriptors.get(*landmark);
        if let Some((index, distance)) = other.index.vocabulary.nearest_of_set(descriptors) {
            if distance <= params.max_descriptor_distance {
                matched.push((k, index as usize));
            }
        }
    }

    let unguided = solve(query, other, &pixels, matched, solver, rng, params, ransac);
    let Some((mut estimate, mut used)) = unguided else {
        debug!("Pose {pose_id} could not be localized from descriptors alone");
        return Ok(None);
    };

    // guided: only landmarks projecting close to each observation with the estimated pose
    let sqr_max_error = params.max_projection_error * params.max_projection_error;
    let mut stack = QueryStack::new();
    let mut leaves = Vec::new();
    let mut guided = Vec::new();

    for (k, (landmark, pixel)) in landmarks.iter().zip(&pixels).enumerate() {
        let Some(ray) = query.camera.ray(*pixel, &estimate) else {
            continue;
        };
        leaves.clear();
        other.index.octree.intersecting_leaves_in_cone(
            &ray,
            params.guided_tan_half_angle,
            &mut leaves,
            &mut stack,
        );

        let descriptors = query.map.descriptors.get(*landmark);
        let mut best: Option<(usize, u32)> = None;
        for &index in leaves.iter().flat_map(|leaf| leaf.iter()) {
            let index = index as usize;
            let position = other.index.positions[index];
            let Some(projected) = query.camera.project(&estimate, position) else {
                continue;
            };
            if !query.camera.is_inside(projected)
                || projected.distance_squared(*pixel) > sqr_max_error
            {
                continue;
            }
            let candidate = other.map.descriptors.get(other.index.ids[index]);
            let distance = set_distance(descriptors, candidate);
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }

        if let Some((index, distance)) = best {
            if distance <= params.max_descriptor_distance {
                guided.push((k, index));
            }
        }
    }

    if guided.len() >= params.min_correspondences_per_pose {
        let guided = solve(query, other, &pixels, guided, solver, rng, params, ransac);
        if let Some((guided_estimate, guided_used)) = guided {
            if guided_used.len() >= used.len() {
                estimate = guided_estimate;
                used = guided_used;
            }
        }
    }

    let pairs = used
        .into_iter()
        .map(|(k, index)| (landmarks[k], other.index.ids[index]))
        .collect();

    Ok(Some(Localization {
        pairs,
        world_t_camera: estimate,
    }))
}

/// Estimates the pose from `(observation, other landmark)` matches, returns the pose and the
/// inlier matches.
#[allow(clippy::too_many_arguments)]
fn solve<S: PoseSolver, R: Rng + ?Sized>(
    query: &MapView<'_>,
    other: &MapView<'_>,
    pixels: &[DVec2],
    matched: Vec<(usize, usize)>,
    solver: &S,
    rng: &mut R,
    params: &MapAlignmentParams,
    ransac: &RansacParams,
) -> Option<(SE3, Vec<(usize, usize)>)> {
    if matched.len() < params.min_correspondences_per_pose {
        return None;
    }

    let object_points = matched
        .iter()
        .map(|&(_, index)| other.index.positions[index])
        .collect::<Vec<_>>();
    let image_points = matched.iter().map(|&(k, _)| pixels[k]).collect::<Vec<_>>();

    match solver.estimate_pose(query.camera, &object_points, &image_points, rng, ransac) {
        Ok(estimate) => {
            let used = estimate.inliers.iter().map(|&i| matched[i]).collect();
            Some((estimate.world_t_camera, used))
        }
        Err(err) => {
            debug!("Localization failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use crate::pose_solver::P3pRansacSolver;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_empty_maps() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(0);
        let matches = find_cross_map_correspondences(
            &Map::default(),
            &camera,
            &Map::default(),
            &camera,
            &P3pRansacSolver,
            &mut rng,
            &MapAlignmentParams::default(),
        )?;
        assert_eq!(matches, CrossMapMatches::default());
        Ok(())
    }

    #[test]
    fn test_invalid_parameters() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(0);
        let params = MapAlignmentParams {
            max_pose_pairs: 0,
            ..Default::default()
        };
        assert!(matches!(
            find_cross_map_correspondences(
                &Map::default(),
                &camera,
                &Map::default(),
                &camera,
                &P3pRansacSolver,
                &mut rng,
                &params,
            ),
            Err(MappingError::InvalidParameter(_))
        ));
    }
}
