#![allow(dead_code)]

use glam::DVec3;
use kornia_mapping::{
    BinaryDescriptor, CameraModel, LandmarkId, Map, MappingError, PinholeCamera, PoseId, SE3,
};
use rand::{rngs::StdRng, Rng};

pub fn camera() -> PinholeCamera {
    PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0)
}

pub fn random_descriptor(rng: &mut StdRng) -> BinaryDescriptor {
    BinaryDescriptor([rng.random(), rng.random(), rng.random(), rng.random()])
}

/// Points spread along x in front of cameras placed on the z = 0 plane.
pub fn random_points(rng: &mut StdRng, count: usize, half_width: f64) -> Vec<DVec3> {
    (0..count)
        .map(|_| {
            DVec3::new(
                rng.random_range(-half_width..half_width),
                rng.random_range(-1.5..1.5),
                rng.random_range(6.0..10.0),
            )
        })
        .collect()
}

/// A camera at `(x, y, 0)` looking along +z, turned by `yaw` around the vertical axis.
pub fn camera_pose(x: f64, y: f64, yaw: f64) -> SE3 {
    SE3::from_axis_angle(DVec3::Y, yaw, DVec3::new(x, y, 0.0))
}

pub fn add_landmark(map: &mut Map, position: DVec3, descriptor: BinaryDescriptor) -> LandmarkId {
    let id = map.database.add_landmark(Some(position), 1.0);
    map.descriptors.insert(id, descriptor);
    id
}

/// Adds the observation of `landmark` in `pose` at its exact projection.
pub fn observe(map: &mut Map, pose: PoseId, landmark: LandmarkId) -> Result<(), MappingError> {
    let world_t_camera = map.database.pose(pose)?.ok_or(MappingError::UnknownPose(pose))?;
    let position = map
        .database
        .landmark_position(landmark)?
        .ok_or(MappingError::UnknownLandmark(landmark))?;
    let pixel = camera()
        .project(&world_t_camera, position)
        .ok_or(MappingError::UnknownLandmark(landmark))?;
    map.database.add_observation(pose, landmark, pixel)
}
