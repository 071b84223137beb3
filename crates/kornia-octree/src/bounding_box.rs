use glam::DVec3;

use crate::ray::Ray3;

/// Absolute slack added to ray/box tests so that points lying exactly on a ray are not lost to
/// rounding in the slab computation.
const RAY_SLACK: f64 = 1e-9;

/// Axis-aligned bounding box in 3D.
///
/// A default constructed box is empty and therefore invalid. It becomes valid as soon as one
/// point has been added; a box around a single point is valid with zero extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    lower: DVec3,
    upper: DVec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// Creates an empty (invalid) bounding box.
    pub const fn empty() -> Self {
        Self {
            lower: DVec3::splat(f64::INFINITY),
            upper: DVec3::splat(f64::NEG_INFINITY),
        }
    }

    /// Creates a bounding box from its two corners.
    pub fn new(lower: DVec3, upper: DVec3) -> Self {
        Self { lower, upper }
    }

    /// Creates the tight bounding box of a set of points, empty if no point is given.
    pub fn from_points<I: IntoIterator<Item = DVec3>>(points: I) -> Self {
        let mut bounding_box = Self::empty();
        for point in points {
            bounding_box.extend(point);
        }
        bounding_box
    }

    /// The corner with the smallest coordinates.
    #[inline]
    pub fn lower(&self) -> DVec3 {
        self.lower
    }

    /// The corner with the largest coordinates.
    #[inline]
    pub fn upper(&self) -> DVec3 {
        self.upper
    }

    /// Returns whether the box encloses at least one point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.lower.cmple(self.upper).all()
    }

    /// Grows the box so that it contains `point`.
    #[inline]
    pub fn extend(&mut self, point: DVec3) {
        self.lower = self.lower.min(point);
        self.upper = self.upper.max(point);
    }

    /// The center of the box.
    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.lower + self.upper) * 0.5
    }

    /// The edge lengths of the box, zero for a box around a single point.
    #[inline]
    pub fn extent(&self) -> DVec3 {
        self.upper - self.lower
    }

    /// Returns whether `point` lies inside the box (borders included).
    #[inline]
    pub fn contains(&self, point: DVec3) -> bool {
        self.contains_with_margin(point, 0.0)
    }

    /// Returns whether `point` lies inside the box grown by `margin` in every direction.
    #[inline]
    pub fn contains_with_margin(&self, point: DVec3, margin: f64) -> bool {
        self.is_valid()
            && point.cmpge(self.lower - DVec3::splat(margin)).all()
            && point.cmple(self.upper + DVec3::splat(margin)).all()
    }

    /// Returns one of the eight sub-boxes obtained by splitting the box at `center`.
    ///
    /// Bit 2 of `octant` selects the upper half along x, bit 1 along y, bit 0 along z.
    pub fn octant(&self, octant: usize, center: DVec3) -> Self {
        debug_assert!(octant < 8);

        let pick = |high: bool, lower: f64, center: f64, upper: f64| {
            if high {
                (center, upper)
            } else {
                (lower, center)
            }
        };

        let (x0, x1) = pick(octant & 0b100 != 0, self.lower.x, center.x, self.upper.x);
        let (y0, y1) = pick(octant & 0b010 != 0, self.lower.y, center.y, self.upper.y);
        let (z0, z1) = pick(octant & 0b001 != 0, self.lower.z, center.z, self.upper.z);

        Self::new(DVec3::new(x0, y0, z0), DVec3::new(x1, y1, z1))
    }

    /// Returns whether the infinite line through `ray` touches the box.
    pub fn intersects_ray(&self, ray: &Ray3) -> bool {
        self.intersects_line_with_margin(ray, 0.0)
    }

    /// Approximate test whether a cone around `ray` touches the box.
    ///
    /// The box is grown by `tan_half_angle` times the distance between the ray origin and the
    /// farthest box corner bound, which over-approximates the cone radius at the box.
    pub fn intersects_cone(&self, ray: &Ray3, tan_half_angle: f64) -> bool {
        let distance = ray.origin().distance(self.center()) + self.extent().length() * 0.5;
        self.intersects_line_with_margin(ray, tan_half_angle * distance)
    }

    fn intersects_line_with_margin(&self, ray: &Ray3, margin: f64) -> bool {
        if !self.is_valid() {
            return false;
        }

        let magnitude = self
            .lower
            .abs()
            .max(self.upper.abs())
            .max(ray.origin().abs())
            .max_element();
        let margin = DVec3::splat(margin + RAY_SLACK * (1.0 + magnitude));

        let lower = self.lower - margin;
        let upper = self.upper + margin;

        let origin = ray.origin();
        let direction = ray.direction();

        let mut t_min = f64::NEG_INFINITY;
        let mut t_max = f64::INFINITY;

        for axis in 0..3 {
            let o = origin[axis];
            let d = direction[axis];

            if d.abs() <= f64::EPSILON {
                if o < lower[axis] || o > upper[axis] {
                    return false;
                }
                continue;
            }

            let inv = 1.0 / d;
            let mut t0 = (lower[axis] - o) * inv;
            let mut t1 = (upper[axis] - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }

            t_min = t_min.max(t0);
            t_max = t_max.min(t1);

            if t_min > t_max {
                return false;
            }
        }

        true
    }
}
