use glam::DVec3;

/// A ray in 3D space with a unit-length direction.
///
/// Spatial queries treat the ray as an infinite line through `origin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray3 {
    origin: DVec3,
    direction: DVec3,
}

impl Ray3 {
    /// Creates a ray, returns `None` if `direction` is zero or not finite.
    pub fn new(origin: DVec3, direction: DVec3) -> Option<Self> {
        if !origin.is_finite() {
            return None;
        }

        let direction = direction.try_normalize()?;

        Some(Self { origin, direction })
    }

    /// Creates the ray starting at `from` and passing through `to`.
    pub fn through(from: DVec3, to: DVec3) -> Option<Self> {
        Self::new(from, to - from)
    }

    /// The start point of the ray.
    #[inline]
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// The unit direction of the ray.
    #[inline]
    pub fn direction(&self) -> DVec3 {
        self.direction
    }

    /// Returns `origin + t * direction`.
    #[inline]
    pub fn point_at(&self, t: f64) -> DVec3 {
        self.origin + self.direction * t
    }

    /// Distance between `point` and the infinite line of the ray.
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        let offset = point - self.origin;
        (offset - self.direction * offset.dot(self.direction)).length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_invalid_direction() {
        assert!(Ray3::new(DVec3::ZERO, DVec3::ZERO).is_none());
        assert!(Ray3::new(DVec3::ZERO, DVec3::new(f64::NAN, 0.0, 1.0)).is_none());
    }

    #[test]
    fn test_distance_to_point() {
        let ray = Ray3::through(DVec3::ZERO, DVec3::new(0.0, 0.0, 5.0)).unwrap();
        assert_relative_eq!(ray.direction().length(), 1.0);
        assert_relative_eq!(ray.distance_to_point(DVec3::new(3.0, 4.0, -2.0)), 5.0);
        assert_relative_eq!(ray.point_at(2.0).z, 2.0);
    }
}
