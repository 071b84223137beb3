//! Rigid and similarity transforms in 3D.

use glam::{DMat3, DQuat, DVec3};
use serde::{Deserialize, Serialize};

/// A rigid transformation, rotation followed by translation.
///
/// Poses in a map are stored as `world_T_camera`: the transform maps points from the camera
/// frame into the world frame, the camera looks along its +Z axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    rotation: DQuat,
    translation: DVec3,
}

impl Default for SE3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl SE3 {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        rotation: DQuat::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Creates a transform, the rotation is normalized.
    pub fn new(rotation: DQuat, translation: DVec3) -> Self {
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// Creates a transform from a rotation axis, an angle in radians and a translation.
    pub fn from_axis_angle(axis: DVec3, angle: f64, translation: DVec3) -> Self {
        Self::new(DQuat::from_axis_angle(axis.normalize(), angle), translation)
    }

    /// Creates a transform from a rotation matrix, which must be orthonormal.
    pub fn from_matrix(rotation: DMat3, translation: DVec3) -> Self {
        Self::new(DQuat::from_mat3(&rotation), translation)
    }

    /// The rotation part.
    #[inline]
    pub fn rotation(&self) -> DQuat {
        self.rotation
    }

    /// The rotation as a 3x3 matrix.
    #[inline]
    pub fn rotation_matrix(&self) -> DMat3 {
        DMat3::from_quat(self.rotation)
    }

    /// The translation part, for a `world_T_camera` pose this is the camera center.
    #[inline]
    pub fn translation(&self) -> DVec3 {
        self.translation
    }

    /// Returns the inverse transform.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Returns `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.translation + self.rotation * other.translation,
        )
    }

    /// Applies the transform to a point.
    #[inline]
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.translation
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

/// A similarity transformation: uniform scale, rotation and translation.
///
/// Maps a point `p` to `scale * rotation * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    scale: f64,
    rotation: DQuat,
    translation: DVec3,
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Sim3 {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        rotation: DQuat::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Creates a similarity transform, the rotation is normalized.
    pub fn new(scale: f64, rotation: DQuat, translation: DVec3) -> Self {
        Self {
            scale,
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// The uniform scale factor.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// The rotation part.
    #[inline]
    pub fn rotation(&self) -> DQuat {
        self.rotation
    }

    /// The translation part.
    #[inline]
    pub fn translation(&self) -> DVec3 {
        self.translation
    }

    /// Returns the inverse transform, the scale must not be zero.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Self {
            scale,
            rotation,
            translation: -(rotation * self.translation) * scale,
        }
    }

    /// Applies the transform to a point.
    #[inline]
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point * self.scale + self.translation
    }

    /// Re-expresses a `world_T_camera` pose in the target frame.
    ///
    /// The camera center is transformed as a point, the orientation is rotated; the scale only
    /// affects the position so the result is again a rigid pose.
    pub fn transform_pose(&self, world_t_camera: &SE3) -> SE3 {
        SE3::new(
            self.rotation * world_t_camera.rotation(),
            self.transform_point(world_t_camera.translation()),
        )
    }
}

/// Result of a 3x3 singular value decomposition, `m = u * diag(s) * vᵀ`.
#[derive(Debug, Clone, Copy)]
pub struct Svd3 {
    /// Left singular vectors as columns.
    pub u: DMat3,
    /// Singular values in non-increasing order.
    pub s: DVec3,
    /// Right singular vectors as columns.
    pub v: DMat3,
}

/// Computes the singular value decomposition of a 3x3 matrix.
pub fn svd3(m: &DMat3) -> Svd3 {
    let mat = faer::Mat::<f64>::from_fn(3, 3, |i, j| m.col(j)[i]);
    let svd = mat.svd();

    let u = svd.u();
    let v = svd.v();
    let s = svd.s_diagonal();

    let to_dmat3 = |m: faer::MatRef<'_, f64>| {
        DMat3::from_cols(
            DVec3::new(m.read(0, 0), m.read(1, 0), m.read(2, 0)),
            DVec3::new(m.read(0, 1), m.read(1, 1), m.read(2, 1)),
            DVec3::new(m.read(0, 2), m.read(1, 2), m.read(2, 2)),
        )
    };

    Svd3 {
        u: to_dmat3(u),
        s: DVec3::new(s.read(0), s.read(1), s.read(2)),
        v: to_dmat3(v),
    }
}

/// Projects a 3x3 matrix onto the closest rotation matrix in the Frobenius sense.
pub fn closest_rotation(m: &DMat3) -> DMat3 {
    let Svd3 { u, v, .. } = svd3(m);

    let rotation = u * v.transpose();
    if rotation.determinant() < 0.0 {
        // flip the axis of the smallest singular value
        let correction = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0));
        u * correction * v.transpose()
    } else {
        rotation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_se3_inverse() {
        let pose = SE3::from_axis_angle(DVec3::new(1.0, 2.0, 3.0), 0.7, DVec3::new(-1.0, 4.0, 2.0));
        let point = DVec3::new(0.3, -0.2, 5.0);

        let back = pose.inverse().transform_point(pose.transform_point(point));
        assert_relative_eq!(back.x, point.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, point.y, epsilon = 1e-12);
        assert_relative_eq!(back.z, point.z, epsilon = 1e-12);

        let identity = pose * pose.inverse();
        assert_relative_eq!(identity.translation().length(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sim3_inverse_and_pose() {
        let sim = Sim3::new(
            2.5,
            DQuat::from_axis_angle(DVec3::Y, 0.4),
            DVec3::new(1.0, -2.0, 0.5),
        );
        let point = DVec3::new(3.0, 1.0, -4.0);

        let back = sim.inverse().transform_point(sim.transform_point(point));
        assert_relative_eq!(back.distance(point), 0.0, epsilon = 1e-12);

        let pose = SE3::from_axis_angle(DVec3::X, 0.2, DVec3::new(0.0, 1.0, 0.0));
        let moved = sim.transform_pose(&pose);

        // a point seen by the camera is the same point after transforming both
        let in_camera = DVec3::new(0.1, 0.2, 3.0);
        let expected = sim.transform_point(pose.transform_point(in_camera));
        let actual = moved.transform_point(in_camera * sim.scale());
        assert_relative_eq!(actual.distance(expected), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_svd3_reconstructs() {
        let m = DMat3::from_cols(
            DVec3::new(2.0, 0.5, -1.0),
            DVec3::new(0.3, 3.0, 0.2),
            DVec3::new(-0.7, 0.1, 1.5),
        );
        let Svd3 { u, s, v } = svd3(&m);
        let rebuilt = u * DMat3::from_diagonal(s) * v.transpose();

        for c in 0..3 {
            for r in 0..3 {
                assert_relative_eq!(rebuilt.col(c)[r], m.col(c)[r], epsilon = 1e-10);
            }
        }
        assert!(s.x >= s.y && s.y >= s.z);
    }

    #[test]
    fn test_closest_rotation_of_rotation_is_identity_map() {
        let axis = DVec3::new(1.0, 1.0, 0.0).normalize();
        let rotation = DMat3::from_quat(DQuat::from_axis_angle(axis, 1.1));
        let projected = closest_rotation(&(rotation * 3.0));

        for c in 0..3 {
            for r in 0..3 {
                assert_relative_eq!(projected.col(c)[r], rotation.col(c)[r], epsilon = 1e-10);
            }
        }
        assert_relative_eq!(projected.determinant(), 1.0, epsilon = 1e-10);
    }
}
