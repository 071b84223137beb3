//! Storage of poses, landmarks and the observations linking them.

use std::collections::{BTreeMap, BTreeSet};

use glam::{DVec2, DVec3};

use crate::error::MappingError;
use crate::geometry::SE3;
use crate::types::{LandmarkId, PoseId};

#[derive(Debug, Clone, Default, PartialEq)]
struct PoseEntry {
    world_t_camera: Option<SE3>,
    observations: BTreeMap<LandmarkId, DVec2>,
}

#[derive(Debug, Clone, PartialEq)]
struct LandmarkEntry {
    position: Option<DVec3>,
    confidence: f64,
    observations: BTreeMap<PoseId, DVec2>,
}

/// Poses, landmarks and their observations, addressed by stable ids.
///
/// A pose or a landmark may exist with an unknown value (`None`), e.g. a pose that could not be
/// tracked or a landmark that has not been triangulated yet. Observations are kept on both
/// sides so that lookups in either direction are cheap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    poses: BTreeMap<PoseId, PoseEntry>,
    landmarks: BTreeMap<LandmarkId, LandmarkEntry>,
    next_landmark_id: u64,
}

impl Database {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of poses.
    pub fn num_poses(&self) -> usize {
        self.poses.len()
    }

    /// Number of landmarks.
    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// Adds a pose, with an unknown value if `world_t_camera` is `None`.
    pub fn add_pose(
        &mut self,
        id: PoseId,
        world_t_camera: Option<SE3>,
    ) -> Result<(), MappingError> {
        if self.poses.contains_key(&id) {
            return Err(MappingError::DuplicatePose(id));
        }
        self.poses.insert(
            id,
            PoseEntry {
                world_t_camera,
                observations: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Removes a pose together with all its observations.
    pub fn remove_pose(&mut self, id: PoseId) -> Result<(), MappingError> {
        let entry = self.poses.remove(&id).ok_or(MappingError::UnknownPose(id))?;
        for landmark_id in entry.observations.keys() {
            if let Some(landmark) = self.landmarks.get_mut(landmark_id) {
                landmark.observations.remove(&id);
            }
        }
        Ok(())
    }

    /// Returns whether the pose exists.
    pub fn has_pose(&self, id: PoseId) -> bool {
        self.poses.contains_key(&id)
    }

    /// The value of a pose, `None` if the pose is unknown.
    pub fn pose(&self, id: PoseId) -> Result<Option<SE3>, MappingError> {
        self.poses
            .get(&id)
            .map(|entry| entry.world_t_camera)
            .ok_or(MappingError::UnknownPose(id))
    }

    /// Sets the value of an existing pose.
    pub fn set_pose(
        &mut self,
        id: PoseId,
        world_t_camera: Option<SE3>,
    ) -> Result<(), MappingError> {
        let entry = self.poses.get_mut(&id).ok_or(MappingError::UnknownPose(id))?;
        entry.world_t_camera = world_t_camera;
        Ok(())
    }

    /// Iterates over all pose ids in ascending order.
    pub fn pose_ids(&self) -> impl Iterator<Item = PoseId> + '_ {
        self.poses.keys().copied()
    }

    /// Iterates over all poses with a known value.
    pub fn valid_poses(&self) -> impl Iterator<Item = (PoseId, SE3)> + '_ {
        self.poses
            .iter()
            .filter_map(|(id, entry)| entry.world_t_camera.map(|pose| (*id, pose)))
    }

    /// The largest pose id, `None` for a database without poses.
    pub fn max_pose_id(&self) -> Option<PoseId> {
        self.poses.keys().next_back().copied()
    }

    /// Adds a landmark with a fresh id.
    pub fn add_landmark(&mut self, position: Option<DVec3>, confidence: f64) -> LandmarkId {
        let id = LandmarkId(self.next_landmark_id);
        self.insert_landmark(id, position, confidence);
        id
    }

    /// Adds a landmark with a given id.
    pub fn add_landmark_with_id(
        &mut self,
        id: LandmarkId,
        position: Option<DVec3>,
        confidence: f64,
    ) -> Result<(), MappingError> {
        if self.landmarks.contains_key(&id) {
            return Err(MappingError::DuplicateLandmark(id));
        }
        self.insert_landmark(id, position, confidence);
        Ok(())
    }

    fn insert_landmark(&mut self, id: LandmarkId, position: Option<DVec3>, confidence: f64) {
        self.landmarks.insert(
            id,
            LandmarkEntry {
                position,
                confidence,
                observations: BTreeMap::new(),
            },
        );
        self.next_landmark_id = self.next_landmark_id.max(id.0.saturating_add(1));
    }

    /// Removes a landmark together with all its observations.
    pub fn remove_landmark(&mut self, id: LandmarkId) -> Result<(), MappingError> {
        let entry = self
            .landmarks
            .remove(&id)
            .ok_or(MappingError::UnknownLandmark(id))?;
        for pose_id in entry.observations.keys() {
            if let Some(pose) = self.poses.get_mut(pose_id) {
                pose.observations.remove(&id);
            }
        }
        Ok(())
    }

    /// Returns whether the landmark exists.
    pub fn has_landmark(&self, id: LandmarkId) -> bool {
        self.landmarks.contains_key(&id)
    }

    /// Iterates over all landmark ids in ascending order.
    pub fn landmark_ids(&self) -> impl Iterator<Item = LandmarkId> + '_ {
        self.landmarks.keys().copied()
    }

    /// The position of a landmark, `None` if it is unknown.
    pub fn landmark_position(&self, id: LandmarkId) -> Result<Option<DVec3>, MappingError> {
        self.landmark(id).map(|entry| entry.position)
    }

    /// Sets the position of an existing landmark.
    pub fn set_landmark_position(
        &mut self,
        id: LandmarkId,
        position: Option<DVec3>,
    ) -> Result<(), MappingError> {
        self.landmark_mut(id)?.position = position;
        Ok(())
    }

    /// The confidence of a landmark.
    pub fn landmark_confidence(&self, id: LandmarkId) -> Result<f64, MappingError> {
        self.landmark(id).map(|entry| entry.confidence)
    }

    /// Sets the confidence of an existing landmark.
    pub fn set_landmark_confidence(
        &mut self,
        id: LandmarkId,
        confidence: f64,
    ) -> Result<(), MappingError> {
        self.landmark_mut(id)?.confidence = confidence;
        Ok(())
    }

    /// Records that `landmark` is seen at `pixel` in the image of `pose`.
    ///
    /// An existing observation of the same pair is replaced.
    pub fn add_observation(
        &mut self,
        pose: PoseId,
        landmark: LandmarkId,
        pixel: DVec2,
    ) -> Result<(), MappingError> {
        if !self.landmarks.contains_key(&landmark) {
            return Err(MappingError::UnknownLandmark(landmark));
        }
        let pose_entry = self.poses.get_mut(&pose).ok_or(MappingError::UnknownPose(pose))?;
        pose_entry.observations.insert(landmark, pixel);

        self.landmark_mut(landmark)?.observations.insert(pose, pixel);
        Ok(())
    }

    /// Removes an observation, returns whether it existed.
    pub fn remove_observation(
        &mut self,
        pose: PoseId,
        landmark: LandmarkId,
    ) -> Result<bool, MappingError> {
        if !self.landmarks.contains_key(&landmark) {
            return Err(MappingError::UnknownLandmark(landmark));
        }
        let pose_entry = self.poses.get_mut(&pose).ok_or(MappingError::UnknownPose(pose))?;
        let existed = pose_entry.observations.remove(&landmark).is_some();

        self.landmark_mut(landmark)?.observations.remove(&pose);
        Ok(existed)
    }

    /// The pixel at which `landmark` is seen in `pose`, if it is.
    pub fn observation(&self, pose: PoseId, landmark: LandmarkId) -> Option<DVec2> {
        self.poses
            .get(&pose)
            .and_then(|entry| entry.observations.get(&landmark).copied())
    }

    /// Iterates over the landmarks seen in a pose together with their pixels.
    pub fn observations_in_pose(
        &self,
        pose: PoseId,
    ) -> Result<impl Iterator<Item = (LandmarkId, DVec2)> + '_, MappingError> {
        let entry = self.poses.get(&pose).ok_or(MappingError::UnknownPose(pose))?;
        Ok(entry.observations.iter().map(|(id, pixel)| (*id, *pixel)))
    }

    /// Iterates over the poses observing a landmark together with the observed pixels.
    pub fn observations_of_landmark(
        &self,
        landmark: LandmarkId,
    ) -> Result<impl Iterator<Item = (PoseId, DVec2)> + '_, MappingError> {
        let entry = self.landmark(landmark)?;
        Ok(entry.observations.iter().map(|(id, pixel)| (*id, *pixel)))
    }

    /// The ids of the landmarks seen in a pose.
    pub fn landmarks_in_pose(&self, pose: PoseId) -> Result<BTreeSet<LandmarkId>, MappingError> {
        Ok(self.observations_in_pose(pose)?.map(|(id, _)| id).collect())
    }

    /// The ids of the poses observing a landmark.
    pub fn poses_observing(&self, landmark: LandmarkId) -> Result<BTreeSet<PoseId>, MappingError> {
        Ok(self
            .observations_of_landmark(landmark)?
            .map(|(id, _)| id)
            .collect())
    }

    /// Returns whether at least one pose observes both landmarks.
    pub fn are_co_visible(&self, a: LandmarkId, b: LandmarkId) -> bool {
        match (self.landmarks.get(&a), self.landmarks.get(&b)) {
            (Some(a), Some(b)) => a
                .observations
                .keys()
                .any(|pose| b.observations.contains_key(pose)),
            _ => false,
        }
    }

    /// Folds the observations of `removed` into `survivor` and removes `removed`.
    ///
    /// Where both landmarks are seen in the same pose, the observation of the survivor is kept.
    /// Position and confidence of the survivor are not changed.
    pub fn merge_landmarks(
        &mut self,
        survivor: LandmarkId,
        removed: LandmarkId,
    ) -> Result<(), MappingError> {
        if survivor == removed {
            return Err(MappingError::InvalidParameter("cannot merge a landmark with itself"));
        }
        if !self.landmarks.contains_key(&survivor) {
            return Err(MappingError::UnknownLandmark(survivor));
        }
        let removed_entry = self
            .landmarks
            .remove(&removed)
            .ok_or(MappingError::UnknownLandmark(removed))?;

        let moved = removed_entry.observations.keys().copied().collect::<Vec<_>>();

        let survivor_entry = self.landmark_mut(survivor)?;
        for (pose_id, pixel) in removed_entry.observations {
            survivor_entry.observations.entry(pose_id).or_insert(pixel);
        }

        for pose_id in moved {
            let Some(pose) = self.poses.get_mut(&pose_id) else {
                continue;
            };
            if let Some(pixel) = pose.observations.remove(&removed) {
                pose.observations.entry(survivor).or_insert(pixel);
            }
        }

        Ok(())
    }

    /// Snapshot of all landmarks with a known position.
    ///
    /// The two vectors are aligned; an index into the positions (e.g. from an octree built on
    /// them) resolves to the landmark id at the same index.
    pub fn landmarks_with_positions(&self) -> (Vec<LandmarkId>, Vec<DVec3>) {
        self.landmarks
            .iter()
            .filter_map(|(id, entry)| entry.position.map(|position| (*id, position)))
            .unzip()
    }

    fn landmark(&self, id: LandmarkId) -> Result<&LandmarkEntry, MappingError> {
        self.landmarks.get(&id).ok_or(MappingError::UnknownLandmark(id))
    }

    fn landmark_mut(&mut self, id: LandmarkId) -> Result<&mut LandmarkEntry, MappingError> {
        self.landmarks
            .get_mut(&id)
            .ok_or(MappingError::UnknownLandmark(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> Result<(Database, LandmarkId, LandmarkId), MappingError> {
        let mut database = Database::new();
        database.add_pose(PoseId(0), Some(SE3::IDENTITY))?;
        database.add_pose(PoseId(1), Some(SE3::IDENTITY))?;
        database.add_pose(PoseId(2), None)?;

        let a = database.add_landmark(Some(DVec3::new(0.0, 0.0, 1.0)), 1.0);
        let b = database.add_landmark(Some(DVec3::new(0.0, 0.0, 2.0)), 3.0);

        database.add_observation(PoseId(0), a, DVec2::new(1.0, 1.0))?;
        database.add_observation(PoseId(1), a, DVec2::new(2.0, 2.0))?;
        database.add_observation(PoseId(1), b, DVec2::new(3.0, 3.0))?;
        database.add_observation(PoseId(2), b, DVec2::new(4.0, 4.0))?;

        Ok((database, a, b))
    }

    #[test]
    fn test_duplicate_and_unknown_ids() -> Result<(), MappingError> {
        let (mut database, a, _) = database()?;
        assert_eq!(
            database.add_pose(PoseId(0), None),
            Err(MappingError::DuplicatePose(PoseId(0)))
        );
        assert_eq!(
            database.add_landmark_with_id(a, None, 0.0),
            Err(MappingError::DuplicateLandmark(a))
        );
        assert_eq!(database.pose(PoseId(9)), Err(MappingError::UnknownPose(PoseId(9))));
        assert_eq!(
            database.add_observation(PoseId(0), LandmarkId(99), DVec2::ZERO),
            Err(MappingError::UnknownLandmark(LandmarkId(99)))
        );
        Ok(())
    }

    #[test]
    fn test_fresh_ids_follow_explicit_ids() -> Result<(), MappingError> {
        let mut database = Database::new();
        database.add_landmark_with_id(LandmarkId(41), Some(DVec3::X), 2.0)?;
        assert_eq!(database.landmark_position(LandmarkId(41))?, Some(DVec3::X));
        assert_eq!(database.landmark_confidence(LandmarkId(41))?, 2.0);
        assert_eq!(database.add_landmark(None, 0.0), LandmarkId(42));

        // a lower explicit id does not move the fresh ids back
        database.add_landmark_with_id(LandmarkId(7), None, 0.0)?;
        assert_eq!(database.add_landmark(None, 0.0), LandmarkId(43));
        Ok(())
    }

    #[test]
    fn test_observations_both_ways() -> Result<(), MappingError> {
        let (database, a, b) = database()?;
        assert_eq!(database.landmarks_in_pose(PoseId(1))?, BTreeSet::from([a, b]));
        assert_eq!(database.poses_observing(b)?, BTreeSet::from([PoseId(1), PoseId(2)]));
        assert!(database.are_co_visible(a, b));
        assert_eq!(database.observation(PoseId(2), b), Some(DVec2::new(4.0, 4.0)));
        assert_eq!(database.valid_poses().count(), 2);
        assert_eq!(database.max_pose_id(), Some(PoseId(2)));
        Ok(())
    }

    #[test]
    fn test_merge_landmarks() -> Result<(), MappingError> {
        let (mut database, a, b) = database()?;
        database.merge_landmarks(a, b)?;

        assert!(!database.has_landmark(b));
        assert_eq!(
            database.poses_observing(a)?,
            BTreeSet::from([PoseId(0), PoseId(1), PoseId(2)])
        );
        // the shared pose keeps the survivor's observation
        assert_eq!(database.observation(PoseId(1), a), Some(DVec2::new(2.0, 2.0)));
        assert_eq!(database.landmarks_in_pose(PoseId(1))?, BTreeSet::from([a]));
        assert_eq!(database.observation(PoseId(2), a), Some(DVec2::new(4.0, 4.0)));
        Ok(())
    }

    #[test]
    fn test_remove_pose_detaches_observations() -> Result<(), MappingError> {
        let (mut database, a, _) = database()?;
        database.remove_pose(PoseId(0))?;
        assert!(!database.has_pose(PoseId(0)));
        assert_eq!(database.num_poses(), 2);
        assert_eq!(database.poses_observing(a)?, BTreeSet::from([PoseId(1)]));
        assert_eq!(
            database.remove_pose(PoseId(0)),
            Err(MappingError::UnknownPose(PoseId(0)))
        );
        Ok(())
    }

    #[test]
    fn test_remove_observation() -> Result<(), MappingError> {
        let (mut database, a, b) = database()?;
        assert!(database.remove_observation(PoseId(1), a)?);
        assert!(!database.remove_observation(PoseId(1), a)?);

        assert_eq!(database.observation(PoseId(1), a), None);
        assert_eq!(database.poses_observing(a)?, BTreeSet::from([PoseId(0)]));
        assert_eq!(database.landmarks_in_pose(PoseId(1))?, BTreeSet::from([b]));

        // an unknown landmark leaves the pose untouched
        assert_eq!(
            database.remove_observation(PoseId(1), LandmarkId(99)),
            Err(MappingError::UnknownLandmark(LandmarkId(99)))
        );
        assert_eq!(
            database.remove_observation(PoseId(9), b),
            Err(MappingError::UnknownPose(PoseId(9)))
        );
        assert_eq!(database.observation(PoseId(1), b), Some(DVec2::new(3.0, 3.0)));
        Ok(())
    }

    #[test]
    fn test_landmarks_with_positions() -> Result<(), MappingError> {
        let (mut database, a, b) = database()?;
        database.set_landmark_position(a, None)?;
        let (ids, positions) = database.landmarks_with_positions();
        assert_eq!(ids, vec![b]);
        assert_eq!(positions, vec![DVec3::new(0.0, 0.0, 2.0)]);
        Ok(())
    }
}
