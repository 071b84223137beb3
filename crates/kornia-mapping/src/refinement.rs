//! Refinement of poses and landmark positions, cleanup of landmarks behind cameras.

use std::collections::BTreeMap;

use glam::{DMat3, DVec2, DVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::database::Database;
use crate::error::MappingError;
use crate::geometry::SE3;
use crate::map::Map;
use crate::pose_refinement::{refine_pose, LmParams, MIN_CORRESPONDENCES};
use crate::pose_solver::RansacParams;
use crate::types::{LandmarkId, PoseId};

/// Parameters of the map refinement stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementParams {
    /// Every n-th valid pose takes part in the refinement.
    pub pose_stride: usize,
    /// Minimum number of poses handed to the refiner.
    pub min_refined_poses: usize,
    /// Minimum number of observations from refined poses for a landmark to be refined.
    pub min_observations: usize,
    /// Maximum number of alternations between pose and landmark updates.
    pub rounds: usize,
    /// Parameters of the pose updates.
    pub lm: LmParams,
    /// Solver parameters used to re-estimate the poses that were not refined.
    pub reestimation: RansacParams,
}

impl Default for RefinementParams {
    fn default() -> Self {
        Self {
            pose_stride: 5,
            min_refined_poses: 10,
            min_observations: 2,
            rounds: 5,
            lm: LmParams::default(),
            reestimation: RansacParams::default(),
        }
    }
}

impl RefinementParams {
    pub(crate) fn validate(&self) -> Result<(), MappingError> {
        if self.pose_stride == 0 {
            return Err(MappingError::InvalidParameter("pose stride must be at least 1"));
        }
        if self.min_refined_poses == 0 {
            return Err(MappingError::InvalidParameter("at least one refined pose is required"));
        }
        if self.min_observations < 2 {
            return Err(MappingError::InvalidParameter(
                "a landmark needs at least two observations",
            ));
        }
        if self.rounds == 0 {
            return Err(MappingError::InvalidParameter("at least one round is required"));
        }
        Ok(())
    }
}

/// Outcome of a refinement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementReport {
    /// Mean squared reprojection error of the refined landmarks before refinement.
    pub initial_error: f64,
    /// Mean squared reprojection error of the refined landmarks after refinement.
    pub final_error: f64,
    /// Number of landmarks whose position was updated.
    pub refined_landmarks: usize,
    /// Number of poses whose value was updated.
    pub refined_poses: usize,
    /// Number of remaining poses that were re-estimated afterwards.
    pub reestimated_poses: usize,
}

/// Squared pixel error below which a pose or landmark counts as unchanged by the refinement.
const ERROR_TOLERANCE: f64 = 1e-9;

/// Refines the poses and landmark positions of a database.
pub trait Refiner {
    /// Refines the map from the poses `pose_ids`.
    ///
    /// Implementations must leave the database untouched when they fail.
    ///
    /// # Arguments
    ///
    /// * `database` - The database to refine.
    /// * `camera` - The camera model shared by all poses.
    /// * `pose_ids` - The poses to refine, poses without a value are ignored.
    /// * `params` - The refinement parameters.
    fn refine(
        &self,
        database: &mut Database,
        camera: &dyn CameraModel,
        pose_ids: &[PoseId],
        params: &RefinementParams,
    ) -> Result<RefinementReport, MappingError>;
}

/// Alternates pose and landmark updates until the reprojection error settles.
///
/// Each round first refines every pose but the first one, which anchors the map, with
/// Levenberg-Marquardt against the current landmark positions. Then every landmark is
/// re-triangulated by least squares over its viewing rays. A pose only moves when its error
/// drops, a landmark only when its error does not grow; either must keep all points in front
/// of the cameras.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlternatingRefiner;

struct Track {
    id: LandmarkId,
    initial: Option<DVec3>,
    position: Option<DVec3>,
    /// `(index into the refined poses, pixel)`
    observations: Vec<(usize, DVec2)>,
}

impl Track {
    fn views(&self, poses: &[(PoseId, SE3)]) -> Vec<(SE3, DVec2)> {
        self.observations
            .iter()
            .map(|&(pose, pixel)| (poses[pose].1, pixel))
            .collect()
    }
}

impl Refiner for AlternatingRefiner {
    fn refine(
        &self,
        database: &mut Database,
        camera: &dyn CameraModel,
        pose_ids: &[PoseId],
        params: &RefinementParams,
    ) -> Result<RefinementReport, MappingError> {
        if !camera.is_valid() {
            return Err(MappingError::InvalidCamera);
        }
        params.validate()?;

        let mut valid = BTreeMap::new();
        for &pose_id in pose_ids {
            if let Some(world_t_camera) = database.pose(pose_id)? {
                valid.insert(pose_id, world_t_camera);
            }
        }
        if valid.is_empty() {
            return Err(MappingError::RefinementFailed("no valid pose to refine"));
        }
        let initial_poses = valid.into_iter().collect::<Vec<_>>();
        let slots = initial_poses
            .iter()
            .enumerate()
            .map(|(slot, (id, _))| (*id, slot))
            .collect::<BTreeMap<_, _>>();

        let mut tracks = Vec::new();
        for id in database.landmark_ids() {
            let observations = database
                .observations_of_landmark(id)?
                .filter_map(|(pose_id, pixel)| slots.get(&pose_id).map(|&slot| (slot, pixel)))
                .collect::<Vec<_>>();
            if observations.len() < params.min_observations {
                continue;
            }
            let position = database.landmark_position(id)?;
            tracks.push(Track {
                id,
                initial: position,
                position,
                observations,
            });
        }
        if tracks.is_empty() {
            return Err(MappingError::RefinementFailed("no landmark seen by enough poses"));
        }

        // landmarks seen by each pose, as (track index, pixel)
        let mut pose_tracks = vec![Vec::new(); initial_poses.len()];
        for (index, track) in tracks.iter().enumerate() {
            for &(slot, pixel) in &track.observations {
                pose_tracks[slot].push((index, pixel));
            }
        }

        let mut poses = initial_poses.clone();
        let mut error = mean_error(camera, &tracks, &poses, |track| track.position);

        for round in 0..params.rounds {
            let pose_updates = (1..poses.len())
                .into_par_iter()
                .filter_map(|slot| {
                    let (object_points, image_points): (Vec<_>, Vec<_>) = pose_tracks[slot]
                        .iter()
                        .filter_map(|&(index, pixel)| tracks[index].position.map(|p| (p, pixel)))
                        .unzip();
                    if object_points.len() < MIN_CORRESPONDENCES {
                        return None;
                    }
                    let world_t_camera = poses[slot].1;
                    let old_error =
                        pose_error(camera, &world_t_camera, &object_points, &image_points)?;
                    let refined = refine_pose(
                        camera,
                        &world_t_camera,
                        &object_points,
                        &image_points,
                        &params.lm,
                    )
                    .ok()?;
                    (refined.mean_sqr_error < old_error - ERROR_TOLERANCE)
                        .then_some((slot, refined.world_t_camera))
                })
                .collect::<Vec<_>>();
            for &(slot, world_t_camera) in &pose_updates {
                poses[slot].1 = world_t_camera;
            }

            let landmark_updates = tracks
                .par_iter()
                .enumerate()
                .filter_map(|(index, track)| {
                    let views = track.views(&poses);
                    let position = triangulate(camera, &views)?;
                    let new_error = reprojection_error(camera, &views, position)?;
                    let old_error = track
                        .position
                        .and_then(|old| reprojection_error(camera, &views, old))
                        .unwrap_or(f64::INFINITY);
                    (new_error <= old_error + ERROR_TOLERANCE).then_some((index, position))
                })
                .collect::<Vec<_>>();
            for &(index, position) in &landmark_updates {
                tracks[index].position = Some(position);
            }

            let round_error = mean_error(camera, &tracks, &poses, |track| track.position);
            log::trace!(
                "Refinement round {round}: {} poses, {} landmarks updated, error {round_error:.6}",
                pose_updates.len(),
                landmark_updates.len()
            );
            let settled = error.is_finite() && error - round_error <= ERROR_TOLERANCE;
            error = round_error;
            if settled {
                break;
            }
        }

        if tracks.iter().all(|track| track.position.is_none()) {
            return Err(MappingError::RefinementFailed("no landmark could be triangulated"));
        }

        let mut report = RefinementReport {
            initial_error: mean_error(camera, &tracks, &initial_poses, |track| track.initial),
            final_error: error,
            ..Default::default()
        };

        for ((pose_id, before), (_, after)) in initial_poses.iter().zip(&poses) {
            if before != after {
                database.set_pose(*pose_id, Some(*after))?;
                report.refined_poses += 1;
            }
        }
        for track in &tracks {
            if track.position != track.initial {
                database.set_landmark_position(track.id, track.position)?;
                report.refined_landmarks += 1;
            }
        }

        log::debug!(
            "Refined {} landmarks and {} of {} poses, error {:.4} -> {:.4}",
            report.refined_landmarks,
            report.refined_poses,
            poses.len(),
            report.initial_error,
            report.final_error
        );

        Ok(report)
    }
}

/// Point closest to all viewing rays in the least squares sense.
fn triangulate(camera: &dyn CameraModel, observations: &[(SE3, DVec2)]) -> Option<DVec3> {
    let mut a = DMat3::ZERO;
    let mut b = DVec3::ZERO;

    for (world_t_camera, pixel) in observations {
        let ray = camera.ray(*pixel, world_t_camera)?;
        let d = ray.direction();
        let projector = DMat3::IDENTITY
            - DMat3::from_cols(d * d.x, d * d.y, d * d.z);
        a += projector;
        b += projector * ray.origin();
    }

    if a.determinant().abs() <= 1e-12 {
        return None;
    }

    let position = a.inverse() * b;
    position.is_finite().then_some(position)
}

/// Mean over the landmarks of their squared pixel errors, landmarks without a position or
/// behind a camera are skipped.
fn mean_error(
    camera: &dyn CameraModel,
    tracks: &[Track],
    poses: &[(PoseId, SE3)],
    position: impl Fn(&Track) -> Option<DVec3>,
) -> f64 {
    let (sum, count) = tracks
        .iter()
        .filter_map(|track| reprojection_error(camera, &track.views(poses), position(track)?))
        .fold((0.0, 0usize), |(sum, count), error| (sum + error, count + 1));
    if count > 0 {
        sum / count as f64
    } else {
        f64::INFINITY
    }
}

/// Mean squared pixel error of a pose over its correspondences.
fn pose_error(
    camera: &dyn CameraModel,
    world_t_camera: &SE3,
    object_points: &[DVec3],
    image_points: &[DVec2],
) -> Option<f64> {
    let mut sum = 0.0;
    for (object_point, image_point) in object_points.iter().zip(image_points) {
        sum += camera.project(world_t_camera, *object_point)?.distance_squared(*image_point);
    }
    Some(sum / object_points.len().max(1) as f64)
}

/// Mean squared pixel error, `None` if the point is behind any of the cameras.
fn reprojection_error(
    camera: &dyn CameraModel,
    observations: &[(SE3, DVec2)],
    position: DVec3,
) -> Option<f64> {
    let mut sum = 0.0;
    for (world_t_camera, pixel) in observations {
        sum += camera.project(world_t_camera, position)?.distance_squared(*pixel);
    }
    Some(sum / observations.len() as f64)
}

/// Removes every landmark that lies behind all of the cameras observing it.
///
/// Only poses with a known value take part; landmarks without a position or without such a
/// pose are kept.
///
/// # Returns
///
/// The number of removed landmarks.
pub fn remove_landmarks_behind_cameras(map: &mut Map) -> usize {
    let mut behind = Vec::new();

    for id in map.database.landmark_ids() {
        let Ok(Some(position)) = map.database.landmark_position(id) else {
            continue;
        };
        let Ok(observations) = map.database.observations_of_landmark(id) else {
            continue;
        };

        let depths = observations
            .filter_map(|(pose_id, _)| match map.database.pose(pose_id) {
                Ok(Some(world_t_camera)) => {
                    Some(world_t_camera.inverse().transform_point(position).z)
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        if !depths.is_empty() && depths.iter().all(|&z| z <= 0.0) {
            behind.push(id);
        }
    }

    let mut removed = 0;
    for id in behind {
        if map.remove_landmark(id).is_ok() {
            removed += 1;
        }
    }
    removed
}
