//! Alignment and fusion of two independently built maps.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use rand::Rng;

use crate::camera::CameraModel;
use crate::consolidation::{
    finish, merge_group, ConsolidationParams, ConsolidationReport, DisjointSet, MappingContext,
};
use crate::error::MappingError;
use crate::geometry::{Sim3, SE3};
use crate::map::Map;
use crate::pose_solver::PoseSolver;
use crate::refinement::{RefinementReport, Refiner};
use crate::search::{find_cross_map_correspondences, MapAlignmentParams};
use crate::similarity::estimate_similarity;
use crate::types::{LandmarkId, PoseId};

/// Imported pose ids start at the next multiple of this block size above the target ids.
const POSE_ID_BLOCK: u64 = 1000;

/// Outcome of merging a source map into a target map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentReport {
    /// The transform from source to target coordinates.
    pub similarity: Sim3,
    /// Number of poses localized in both maps.
    pub pose_pairs: usize,
    /// Number of source poses added to the target.
    pub imported_poses: usize,
    /// Number of source landmarks added to the target.
    pub imported_landmarks: usize,
    /// Number of imported landmarks fused with an existing target landmark.
    pub merged_landmarks: usize,
    /// Number of landmarks removed for lying behind their observing cameras.
    pub culled_landmarks: usize,
    /// The refinement outcome, `None` if it failed.
    pub refinement: Option<RefinementReport>,
}

impl AlignmentReport {
    /// Returns whether the final refinement succeeded.
    pub fn refined(&self) -> bool {
        self.refinement.is_some()
    }
}

/// Merges `source` into `target`.
///
/// The maps are aligned from poses localized in both of them. All known source poses and
/// positioned source landmarks are then transformed into the target frame and imported: poses
/// under ids `((max target id / 1000) + 1) * 1000 + source id`, landmarks under fresh ids with
/// their descriptors and observations. Imported landmarks corresponding one-to-one to a target
/// landmark are fused with it. Finally landmarks behind cameras are removed and the map is
/// refined with the target camera.
///
/// `source_camera` only serves the localization of source poses in the target. Imported
/// observations are projected with `ctx.camera` afterwards, so both maps are assumed to share
/// the same intrinsics.
///
/// # Arguments
///
/// * `source` - The map to import.
/// * `source_camera` - The camera model of the source map, with the intrinsics of `ctx.camera`.
/// * `target` - The map receiving the source.
/// * `ctx` - The collaborators of the target map.
/// * `rng` - Random source.
/// * `params` - The alignment parameters.
/// * `consolidation` - The parameters of the final cleanup and refinement.
///
/// # Errors
///
/// Fails with [`MappingError::InsufficientPosePairs`] when too few poses could be localized,
/// the target is not modified in that case.
pub fn merge_maps<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    source: &Map,
    source_camera: &dyn CameraModel,
    target: &mut Map,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &MapAlignmentParams,
    consolidation: &ConsolidationParams,
) -> Result<AlignmentReport, MappingError> {
    consolidation.refinement.validate()?;

    let matches = find_cross_map_correspondences(
        source,
        source_camera,
        target,
        ctx.camera,
        ctx.solver,
        rng,
        params,
    )?;

    if matches.pose_pairs.len() < params.min_corresponding_poses {
        return Err(MappingError::InsufficientPosePairs {
            required: params.min_corresponding_poses,
            actual: matches.pose_pairs.len(),
        });
    }

    let (source_poses, target_poses): (Vec<SE3>, Vec<SE3>) = matches
        .pose_pairs
        .iter()
        .map(|pair| (pair.source, pair.target))
        .unzip();
    let target_t_source = estimate_similarity(&source_poses, &target_poses)?;

    info!(
        "Aligned maps from {} pose pairs and {} landmark pairs, scale {:.4}",
        matches.pose_pairs.len(),
        matches.landmark_pairs.len(),
        target_t_source.scale()
    );

    // all new ids are known before the target changes
    let first_new_pose = match target.database.max_pose_id() {
        Some(PoseId(max)) => (max / POSE_ID_BLOCK + 1).checked_mul(POSE_ID_BLOCK),
        None => Some(POSE_ID_BLOCK),
    };
    let mut imported_poses = BTreeMap::new();
    for (source_id, world_t_camera) in source.database.valid_poses() {
        let new_id = first_new_pose
            .and_then(|first| first.checked_add(source_id.0))
            .ok_or(MappingError::InvalidParameter("pose ids exceed the id range"))?;
        imported_poses.insert(
            source_id,
            (PoseId(new_id), target_t_source.transform_pose(&world_t_camera)),
        );
    }

    for (new_id, world_t_camera) in imported_poses.values() {
        target.database.add_pose(*new_id, Some(*world_t_camera))?;
    }

    let mut imported_landmarks = BTreeMap::new();
    let (source_ids, source_positions) = source.database.landmarks_with_positions();
    for (source_id, position) in source_ids.into_iter().zip(source_positions) {
        let confidence = source.database.landmark_confidence(source_id)?;
        let new_id = target
            .database
            .add_landmark(Some(target_t_source.transform_point(position)), confidence);
        target
            .descriptors
            .extend(new_id, source.descriptors.get(source_id).iter().copied());

        for (pose_id, pixel) in source.database.observations_of_landmark(source_id)? {
            if let Some((new_pose, _)) = imported_poses.get(&pose_id) {
                target.database.add_observation(*new_pose, new_id, pixel)?;
            }
        }
        imported_landmarks.insert(source_id, new_id);
    }

    let mut merged_landmarks = 0;
    for (source_id, target_id) in one_to_one_pairs(&matches.landmark_pairs) {
        let Some(&new_id) = imported_landmarks.get(&source_id) else {
            continue;
        };
        if !target.database.has_landmark(target_id) {
            continue;
        }
        merged_landmarks += merge_group(target, &BTreeSet::from([target_id, new_id]))?;
    }

    let mut report = ConsolidationReport::default();
    finish(target, ctx, rng, consolidation, &mut report);

    info!(
        "Imported {} poses and {} landmarks, merged {}, culled {}",
        imported_poses.len(),
        imported_landmarks.len(),
        merged_landmarks,
        report.culled_landmarks
    );

    Ok(AlignmentReport {
        similarity: target_t_source,
        pose_pairs: matches.pose_pairs.len(),
        imported_poses: imported_poses.len(),
        imported_landmarks: imported_landmarks.len(),
        merged_landmarks,
        culled_landmarks: report.culled_landmarks,
        refinement: report.refinement,
    })
}

/// The `(source, target)` pairs whose connected group holds exactly one landmark of each map.
fn one_to_one_pairs(pairs: &BTreeSet<(LandmarkId, LandmarkId)>) -> Vec<(LandmarkId, LandmarkId)> {
    // the two maps have separate id spaces, nodes are keyed by (id, is_target)
    let mut nodes = BTreeMap::new();
    for &(source, target) in pairs {
        let next = nodes.len();
        nodes.entry((source, false)).or_insert(next);
        let next = nodes.len();
        nodes.entry((target, true)).or_insert(next);
    }

    let mut sets = DisjointSet::new(nodes.len());
    for &(source, target) in pairs {
        sets.union(nodes[&(source, false)], nodes[&(target, true)]);
    }

    let mut group_sizes: BTreeMap<usize, usize> = BTreeMap::new();
    for &node in nodes.values() {
        *group_sizes.entry(sets.find(node)).or_default() += 1;
    }

    pairs
        .iter()
        .filter(|(source, _)| group_sizes[&sets.find(nodes[&(*source, false)])] == 2)
        .copied()
        .collect()
}
