//! Merging of corresponding landmarks and refinement of the merged map.

use std::collections::{BTreeMap, BTreeSet};

use glam::DVec3;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::error::MappingError;
use crate::map::Map;
use crate::pose_solver::PoseSolver;
use crate::refinement::{
    remove_landmarks_behind_cameras, RefinementParams, RefinementReport, Refiner,
};
use crate::search::{
    find_duplicate_landmarks, find_loop_closures, CorrespondenceSet, LandmarkMergeParams,
    LoopClosureParams,
};
use crate::types::LandmarkId;

/// A disjoint-set (union-find) data structure over `0..len`.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    /// Creates `len` singleton sets.
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    /// Returns the representative of the set containing `id`, with path compression.
    pub fn find(&mut self, mut id: usize) -> usize {
        let mut root = id;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        while self.parent[id] != root {
            let next = self.parent[id];
            self.parent[id] = root;
            id = next;
        }

        root
    }

    /// Unites the sets of `a` and `b`, returns whether they were distinct.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let a_root = self.find(a);
        let b_root = self.find(b);
        if a_root == b_root {
            return false;
        }

        let (large, small) = if self.size[a_root] >= self.size[b_root] {
            (a_root, b_root)
        } else {
            (b_root, a_root)
        };
        self.parent[small] = large;
        self.size[large] += self.size[small];
        true
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Returns whether the structure holds no element.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

/// Closes the pairs transitively into groups of landmarks that all describe the same point.
///
/// Groups are ordered by their smallest member.
pub fn group_correspondences(pairs: &CorrespondenceSet) -> Vec<BTreeSet<LandmarkId>> {
    let groups = pairs.iter().map(|(a, b)| BTreeSet::from([a, b])).collect();
    merge_overlapping_groups(groups).0
}

/// Merges groups sharing a member until all groups are disjoint.
///
/// # Returns
///
/// The disjoint groups ordered by their smallest member, and the number of merges performed.
/// Applying it again to its own output performs no merge.
pub fn merge_overlapping_groups(
    groups: Vec<BTreeSet<LandmarkId>>,
) -> (Vec<BTreeSet<LandmarkId>>, usize) {
    let groups = groups.into_iter().filter(|group| !group.is_empty()).collect::<Vec<_>>();

    let mut first_group = BTreeMap::new();
    let mut sets = DisjointSet::new(groups.len());
    let mut merges = 0;

    for (index, group) in groups.iter().enumerate() {
        for id in group {
            let other = *first_group.entry(*id).or_insert(index);
            if sets.union(index, other) {
                merges += 1;
            }
        }
    }

    let mut merged: BTreeMap<usize, BTreeSet<LandmarkId>> = BTreeMap::new();
    for (index, group) in groups.into_iter().enumerate() {
        merged.entry(sets.find(index)).or_default().extend(group);
    }

    let mut merged = merged.into_values().collect::<Vec<_>>();
    merged.sort_by_key(|group| group.first().copied());

    (merged, merges)
}

/// Fuses a group of landmarks into its member with the smallest id.
///
/// The survivor takes the confidence-weighted mean of the known member positions (equal weights
/// when no member has a positive confidence) and the mean confidence. Observations and
/// descriptors of the other members move to the survivor, which then removes them. Members
/// missing from the map are skipped.
///
/// # Returns
///
/// The number of removed landmarks.
pub fn merge_group(map: &mut Map, group: &BTreeSet<LandmarkId>) -> Result<usize, MappingError> {
    let members = group
        .iter()
        .copied()
        .filter(|id| map.database.has_landmark(*id))
        .collect::<Vec<_>>();
    if members.len() < 2 {
        return Ok(0);
    }

    let mut positioned = Vec::new();
    let mut confidence_sum = 0.0;
    for &id in &members {
        let confidence = map.database.landmark_confidence(id)?;
        confidence_sum += confidence;
        if let Some(position) = map.database.landmark_position(id)? {
            positioned.push((position, confidence.max(0.0)));
        }
    }

    let position = if positioned.is_empty() {
        None
    } else {
        let weight_sum = positioned.iter().map(|(_, weight)| weight).sum::<f64>();
        if weight_sum > 0.0 {
            Some(positioned.iter().map(|(p, w)| *p * *w).sum::<DVec3>() / weight_sum)
        } else {
            Some(positioned.iter().map(|(p, _)| *p).sum::<DVec3>() / positioned.len() as f64)
        }
    };
    let confidence = confidence_sum / members.len() as f64;

    let survivor = members[0];
    for &removed in &members[1..] {
        map.merge_landmarks(survivor, removed)?;
    }
    map.database.set_landmark_position(survivor, position)?;
    map.database.set_landmark_confidence(survivor, confidence)?;

    Ok(members.len() - 1)
}

/// The collaborators shared by the consolidation stages.
pub struct MappingContext<'a, S, F> {
    /// The camera model of the map.
    pub camera: &'a dyn CameraModel,
    /// The pose solver used to re-estimate poses.
    pub solver: &'a S,
    /// The refiner of landmark positions.
    pub refiner: &'a F,
}

impl<'a, S: PoseSolver, F: Refiner> MappingContext<'a, S, F> {
    /// Bundles the collaborators.
    pub fn new(camera: &'a dyn CameraModel, solver: &'a S, refiner: &'a F) -> Self {
        Self {
            camera,
            solver,
            refiner,
        }
    }
}

/// Refines the map from every n-th pose and re-localizes the remaining poses.
///
/// The stride is reduced when needed so that at least `min_refined_poses` poses are refined.
/// Poses that cannot be re-localized keep their previous value.
pub fn refine_map<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    map: &mut Map,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &RefinementParams,
) -> Result<RefinementReport, MappingError> {
    params.validate()?;

    let poses = map.database.valid_poses().collect::<Vec<_>>();
    if poses.len() < params.min_refined_poses {
        return Err(MappingError::RefinementFailed("not enough poses"));
    }

    let stride = params
        .pose_stride
        .min(poses.len() / params.min_refined_poses)
        .max(1);
    let selected = poses.iter().step_by(stride).map(|(id, _)| *id).collect::<Vec<_>>();

    let mut report = ctx.refiner.refine(&mut map.database, ctx.camera, &selected, params)?;

    let selected = selected.into_iter().collect::<BTreeSet<_>>();
    for (pose_id, _) in poses {
        if selected.contains(&pose_id) {
            continue;
        }

        let mut object_points = Vec::new();
        let mut image_points = Vec::new();
        for (landmark, pixel) in map.database.observations_in_pose(pose_id)? {
            if let Some(position) = map.database.landmark_position(landmark)? {
                object_points.push(position);
                image_points.push(pixel);
            }
        }

        match ctx
            .solver
            .estimate_pose(ctx.camera, &object_points, &image_points, rng, &params.reestimation)
        {
            Ok(estimate) => {
                map.database.set_pose(pose_id, Some(estimate.world_t_camera))?;
                report.reestimated_poses += 1;
            }
            Err(err) => debug!("Keeping pose {pose_id}: {err}"),
        }
    }

    Ok(report)
}

/// Parameters of the consolidation stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationParams {
    /// Parameters of the final refinement.
    pub refinement: RefinementParams,
}

/// Outcome of a consolidation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConsolidationReport {
    /// Number of groups that were fused into one landmark.
    pub merged_groups: usize,
    /// Number of landmarks removed by merging.
    pub removed_landmarks: usize,
    /// Number of landmarks removed for lying behind their observing cameras.
    pub culled_landmarks: usize,
    /// The refinement outcome, `None` if it failed.
    pub refinement: Option<RefinementReport>,
}

impl ConsolidationReport {
    /// Returns whether the final refinement succeeded.
    pub fn refined(&self) -> bool {
        self.refinement.is_some()
    }
}

/// Merges corresponding landmarks, removes landmarks behind cameras and refines the map.
///
/// A failed refinement does not undo the merges; it is logged and reported.
pub fn consolidate<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    map: &mut Map,
    pairs: &CorrespondenceSet,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &ConsolidationParams,
) -> Result<ConsolidationReport, MappingError> {
    if !ctx.camera.is_valid() {
        return Err(MappingError::InvalidCamera);
    }
    params.refinement.validate()?;

    let mut report = ConsolidationReport::default();
    if pairs.is_empty() {
        return Ok(report);
    }

    for group in group_correspondences(pairs) {
        let removed = merge_group(map, &group)?;
        if removed > 0 {
            report.merged_groups += 1;
            report.removed_landmarks += removed;
        }
    }

    finish(map, ctx, rng, params, &mut report);

    info!(
        "Merged {} groups, removed {} landmarks, culled {}",
        report.merged_groups, report.removed_landmarks, report.culled_landmarks
    );

    Ok(report)
}

/// Removes landmarks behind cameras and refines the map.
pub(crate) fn finish<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    map: &mut Map,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &ConsolidationParams,
    report: &mut ConsolidationReport,
) {
    report.culled_landmarks = remove_landmarks_behind_cameras(map);

    report.refinement = match refine_map(map, ctx, rng, &params.refinement) {
        Ok(refinement) => Some(refinement),
        Err(err) => {
            warn!("Refinement failed, keeping the merged map: {err}");
            None
        }
    };
}

/// Finds loop closures and merges them.
///
/// Returns an empty report and leaves the map untouched when no pair is found.
pub fn close_loops<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    map: &mut Map,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &LoopClosureParams,
    consolidation: &ConsolidationParams,
) -> Result<ConsolidationReport, MappingError> {
    let pairs = find_loop_closures(map, ctx.camera, ctx.solver, rng, params)?;
    consolidate(map, &pairs, ctx, rng, consolidation)
}

/// Finds landmarks created twice in one map and merges them.
///
/// Returns an empty report and leaves the map untouched when no pair is found.
pub fn merge_duplicate_landmarks<S: PoseSolver, F: Refiner, R: Rng + ?Sized>(
    map: &mut Map,
    ctx: &MappingContext<'_, S, F>,
    rng: &mut R,
    params: &LandmarkMergeParams,
    consolidation: &ConsolidationParams,
) -> Result<ConsolidationReport, MappingError> {
    let pairs = find_duplicate_landmarks(map, ctx.camera, rng, params)?;
    consolidate(map, &pairs, ctx, rng, consolidation)
}
