//! Minimal camera pose from three 2D/3D correspondences.
//!
//! Grunert's formulation: the distances along the three viewing rays are recovered from a
//! quartic in the ratio of two of them, the pose then follows from aligning the world points
//! with the points found along the rays.
//! Paper: Haralick et al., "Review and analysis of solutions of the three point perspective pose
//! estimation problem", IJCV 1994.

use glam::{DMat3, DVec3};

use crate::geometry::{closest_rotation, SE3};

/// Candidate distances below this are treated as a point on the camera center.
const MIN_DISTANCE: f64 = 1e-9;

/// Number of bisection steps when isolating a polynomial root.
const BISECTION_STEPS: usize = 100;

/// Computes the camera poses compatible with three correspondences.
///
/// Up to four poses are returned; every pose sees the three points in front of the camera.
/// The points may lie on any plane, they only must not be collinear.
///
/// # Arguments
///
/// * `object_points` - Three points in world coordinates.
/// * `bearings` - Their viewing directions in the camera frame, not necessarily normalized.
///
/// # Returns
///
/// The `world_T_camera` candidates, empty for a degenerate configuration.
pub fn solve_p3p(object_points: &[DVec3; 3], bearings: &[DVec3; 3]) -> Vec<SE3> {
    let [p1, p2, p3] = *object_points;
    let j = bearings.map(|b| b.normalize_or_zero());
    if j.iter().any(|b| *b == DVec3::ZERO) {
        return Vec::new();
    }

    let a2 = p2.distance_squared(p3);
    let b2 = p1.distance_squared(p3);
    let c2 = p1.distance_squared(p2);
    if a2 <= MIN_DISTANCE || b2 <= MIN_DISTANCE || c2 <= MIN_DISTANCE {
        return Vec::new();
    }
    // collinear world points leave the rotation about their line free
    if (p2 - p1).cross(p3 - p1).length_squared() <= MIN_DISTANCE * (b2 * c2).sqrt() {
        return Vec::new();
    }

    let cos_alpha = j[1].dot(j[2]);
    let cos_beta = j[0].dot(j[2]);
    let cos_gamma = j[0].dot(j[1]);

    let a_minus_c = (a2 - c2) / b2;
    let a_plus_c = (a2 + c2) / b2;

    let quartic = [
        (a_minus_c - 1.0).powi(2) - 4.0 * c2 / b2 * cos_alpha * cos_alpha,
        4.0 * (a_minus_c * (1.0 - a_minus_c) * cos_beta
            - (1.0 - a_plus_c) * cos_alpha * cos_gamma
            + 2.0 * c2 / b2 * cos_alpha * cos_alpha * cos_beta),
        2.0 * (a_minus_c * a_minus_c - 1.0
            + 2.0 * a_minus_c * a_minus_c * cos_beta * cos_beta
            + 2.0 * (b2 - c2) / b2 * cos_alpha * cos_alpha
            - 4.0 * a_plus_c * cos_alpha * cos_beta * cos_gamma
            + 2.0 * (b2 - a2) / b2 * cos_gamma * cos_gamma),
        4.0 * (-a_minus_c * (1.0 + a_minus_c) * cos_beta
            + 2.0 * a2 / b2 * cos_gamma * cos_gamma * cos_beta
            - (1.0 - a_plus_c) * cos_alpha * cos_gamma),
        (1.0 + a_minus_c).powi(2) - 4.0 * a2 / b2 * cos_gamma * cos_gamma,
    ];

    let mut poses = Vec::with_capacity(4);
    for v in real_roots(&quartic) {
        let denominator = 2.0 * (cos_gamma - v * cos_alpha);
        if denominator.abs() <= f64::EPSILON {
            continue;
        }
        let u = ((a_minus_c - 1.0) * v * v - 2.0 * a_minus_c * cos_beta * v + 1.0 + a_minus_c)
            / denominator;

        let d = 1.0 + v * v - 2.0 * v * cos_beta;
        if d <= f64::EPSILON {
            continue;
        }
        let s1 = (b2 / d).sqrt();
        let distances = [s1, u * s1, v * s1];
        if distances.iter().any(|&s| !(s > MIN_DISTANCE) || !s.is_finite()) {
            continue;
        }

        let in_camera = [j[0] * distances[0], j[1] * distances[1], j[2] * distances[2]];
        if let Some(camera_t_world) = rigid_alignment(object_points, &in_camera) {
            poses.push(camera_t_world.inverse());
        }
    }
    poses
}

/// Rigid transform mapping `from` onto `to` in the least squares sense.
fn rigid_alignment(from: &[DVec3; 3], to: &[DVec3; 3]) -> Option<SE3> {
    let from_centroid = (from[0] + from[1] + from[2]) / 3.0;
    let to_centroid = (to[0] + to[1] + to[2]) / 3.0;

    let mut correlation = DMat3::ZERO;
    for (f, t) in from.iter().zip(to) {
        let f = *f - from_centroid;
        let t = *t - to_centroid;
        correlation += DMat3::from_cols(t * f.x, t * f.y, t * f.z);
    }

    let rotation = closest_rotation(&correlation);
    if !rotation.is_finite() {
        return None;
    }
    let translation = to_centroid - rotation * from_centroid;
    Some(SE3::from_matrix(rotation, translation))
}

fn evaluate(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, c| acc * x + c)
}

/// Real roots of a polynomial given by its coefficients, highest degree first.
///
/// The roots of the derivative split the real line into monotonic pieces, each piece holds at
/// most one root which is isolated by bisection. Roots of even multiplicity are not reported.
pub(crate) fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    let scale = coefficients.iter().fold(0.0f64, |acc, c| acc.max(c.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Vec::new();
    }
    let leading = coefficients
        .iter()
        .position(|c| c.abs() > 1e-14 * scale)
        .unwrap_or(coefficients.len());
    let coefficients = &coefficients[leading..];

    let degree = coefficients.len().saturating_sub(1);
    match degree {
        0 => return Vec::new(),
        1 => return vec![-coefficients[1] / coefficients[0]],
        _ => {}
    }

    let bound = 1.0
        + coefficients[1..]
            .iter()
            .fold(0.0f64, |acc, c| acc.max((c / coefficients[0]).abs()));

    let derivative = coefficients[..degree]
        .iter()
        .enumerate()
        .map(|(i, c)| c * (degree - i) as f64)
        .collect::<Vec<_>>();

    let mut breaks = vec![-bound];
    breaks.extend(real_roots(&derivative).into_iter().filter(|x| x.abs() < bound));
    breaks.push(bound);
    breaks.sort_by(f64::total_cmp);

    let mut roots = Vec::new();
    for window in breaks.windows(2) {
        let (mut low, mut high) = (window[0], window[1]);
        let mut f_low = evaluate(coefficients, low);
        let f_high = evaluate(coefficients, high);

        if f_low == 0.0 {
            roots.push(low);
            continue;
        }
        if f_low.signum() == f_high.signum() {
            continue;
        }

        for _ in 0..BISECTION_STEPS {
            let middle = 0.5 * (low + high);
            let f_middle = evaluate(coefficients, middle);
            if f_middle.signum() == f_low.signum() {
                low = middle;
                f_low = f_middle;
            } else {
                high = middle;
            }
        }
        roots.push(0.5 * (low + high));
    }
    roots
}
