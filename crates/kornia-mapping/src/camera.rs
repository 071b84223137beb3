use glam::{DVec2, DVec3};
use kornia_octree::Ray3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Minimal depth in front of the camera for a point to be projected.
const MIN_DEPTH: f64 = 1e-9;

/// A camera projection model.
///
/// Poses passed to the provided methods follow the `world_T_camera` convention.
pub trait CameraModel: Send + Sync {
    /// Returns whether the model parameters are usable.
    fn is_valid(&self) -> bool;

    /// Image width in pixels.
    fn width(&self) -> u32;

    /// Image height in pixels.
    fn height(&self) -> u32;

    /// Projects a point given in the camera frame, `None` if it lies behind the camera.
    fn project_camera(&self, point_in_camera: DVec3) -> Option<DVec2>;

    /// Returns the viewing direction through `pixel` in the camera frame, with unit depth.
    fn unproject(&self, pixel: DVec2) -> DVec3;

    /// Projects a world point into the image of a camera at `world_t_camera`.
    fn project(&self, world_t_camera: &SE3, point: DVec3) -> Option<DVec2> {
        self.project_camera(world_t_camera.inverse().transform_point(point))
    }

    /// The viewing ray through `pixel` in world coordinates.
    fn ray(&self, pixel: DVec2, world_t_camera: &SE3) -> Option<Ray3> {
        Ray3::new(
            world_t_camera.translation(),
            world_t_camera.rotation() * self.unproject(pixel),
        )
    }

    /// Returns whether `pixel` lies inside the image.
    fn is_inside(&self, pixel: DVec2) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.width() as f64
            && pixel.y < self.height() as f64
    }
}

/// A pinhole camera without distortion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Focal length along x in pixels.
    pub fx: f64,
    /// Focal length along y in pixels.
    pub fy: f64,
    /// Principal point x coordinate.
    pub cx: f64,
    /// Principal point y coordinate.
    pub cy: f64,
}

impl PinholeCamera {
    /// Creates a new pinhole camera.
    pub fn new(width: u32, height: u32, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            width,
            height,
            fx,
            fy,
            cx,
            cy,
        }
    }
}

impl CameraModel for PinholeCamera {
    fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.fx.is_finite()
            && self.fy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
            && self.cx.is_finite()
            && self.cy.is_finite()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn project_camera(&self, point_in_camera: DVec3) -> Option<DVec2> {
        if point_in_camera.z <= MIN_DEPTH {
            return None;
        }
        let inv_z = 1.0 / point_in_camera.z;
        Some(DVec2::new(
            self.fx * point_in_camera.x * inv_z + self.cx,
            self.fy * point_in_camera.y * inv_z + self.cy,
        ))
    }

    fn unproject(&self, pixel: DVec2) -> DVec3 {
        DVec3::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0)
    }

    #[test]
    fn test_project_unproject() {
        let camera = camera();
        assert!(camera.is_valid());

        let pose = SE3::from_axis_angle(DVec3::Y, 0.3, DVec3::new(1.0, 0.0, -2.0));
        let point = DVec3::new(1.5, 0.4, 3.0);

        let pixel = camera.project(&pose, point).unwrap();
        let ray = camera.ray(pixel, &pose).unwrap();
        assert_relative_eq!(ray.distance_to_point(point), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_behind_camera() {
        let camera = camera();
        assert!(camera.project(&SE3::IDENTITY, DVec3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera.is_inside(DVec2::new(320.0, 240.0)));
        assert!(!camera.is_inside(DVec2::new(640.0, 10.0)));
    }

    #[test]
    fn test_image_bounds() {
        let camera = camera();
        assert!(camera.is_inside(DVec2::ZERO));
        assert!(camera.is_inside(DVec2::new(639.5, 479.5)));
        assert!(!camera.is_inside(DVec2::new(-0.1, 240.0)));
        assert!(!camera.is_inside(DVec2::new(320.0, 480.0)));
    }

    #[test]
    fn test_invalid_camera() {
        let mut camera = camera();
        camera.fx = 0.0;
        assert!(!camera.is_valid());
    }
}
