//! Levenberg-Marquardt refinement of a single camera pose.

use glam::{DQuat, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::error::MappingError;
use crate::geometry::SE3;

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmParams {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on the decrease of the summed squared pixel error.
    pub epsilon: f64,
    /// Initial damping factor (lambda).
    pub initial_damping: f64,
    /// Multiplicative factor to increase/decrease lambda.
    pub damping_factor: f64,
}

impl Default for LmParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            epsilon: 1e-10,
            initial_damping: 1e-3,
            damping_factor: 10.0,
        }
    }
}

/// A pose after refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinedPose {
    /// The refined `world_T_camera` pose.
    pub world_t_camera: SE3,
    /// Mean squared pixel error over the correspondences.
    pub mean_sqr_error: f64,
    /// Number of LM iterations run.
    pub iterations: usize,
    /// Whether the error stopped decreasing before the iteration limit.
    pub converged: bool,
}

/// Minimum number of correspondences to constrain all six degrees of freedom.
pub const MIN_CORRESPONDENCES: usize = 3;

/// Refines a pose with Levenberg-Marquardt to minimize the pixel reprojection error.
///
/// The update is applied on the left of `camera_T_world` as a rotation vector and a
/// translation, the Jacobian is computed with central differences.
///
/// # Arguments
///
/// * `camera` - The camera model.
/// * `world_t_camera` - The initial pose.
/// * `object_points` - World points.
/// * `image_points` - Their observed pixels.
/// * `params` - The LM parameters.
pub fn refine_pose(
    camera: &dyn CameraModel,
    world_t_camera: &SE3,
    object_points: &[DVec3],
    image_points: &[DVec2],
    params: &LmParams,
) -> Result<RefinedPose, MappingError> {
    if object_points.len() != image_points.len() {
        return Err(MappingError::MismatchedLengths {
            left: object_points.len(),
            right: image_points.len(),
        });
    }
    let n = object_points.len();
    if n < MIN_CORRESPONDENCES {
        return Err(MappingError::InsufficientCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: n,
        });
    }

    let mut residuals = vec![0.0; 2 * n];
    let mut residuals_plus = vec![0.0; 2 * n];
    let mut residuals_minus = vec![0.0; 2 * n];

    let mut camera_t_world = world_t_camera.inverse();
    let mut sqr_error = project_all(
        camera,
        &camera_t_world,
        object_points,
        image_points,
        &mut residuals,
    )
    .ok_or(MappingError::RefinementFailed("point behind the initial camera"))?;

    let mut lambda = params.initial_damping;
    let mut iterations = 0;
    let mut converged = sqr_error < params.epsilon;
    let mut jacobian = vec![[0.0; 6]; 2 * n];

    'outer: while !converged && iterations < params.max_iterations {
        iterations += 1;

        let t_scale = camera_t_world.translation().abs().max_element().max(1.0);
        for k in 0..6 {
            let h = if k < 3 { 1e-6 } else { 1e-6 * t_scale };
            let mut step = [0.0; 6];
            step[k] = h;
            let plus = apply(&step, &camera_t_world);
            step[k] = -h;
            let minus = apply(&step, &camera_t_world);

            let (Some(_), Some(_)) = (
                project_all(camera, &plus, object_points, image_points, &mut residuals_plus),
                project_all(camera, &minus, object_points, image_points, &mut residuals_minus),
            ) else {
                break 'outer;
            };
            let differences = residuals_plus.iter().zip(&residuals_minus);
            for (row, (p, m)) in jacobian.iter_mut().zip(differences) {
                row[k] = (p - m) / (2.0 * h);
            }
        }

        // normal equations: (JᵀJ + λI) δ = -Jᵀr
        let mut a = [[0.0; 6]; 6];
        let mut b = [0.0; 6];
        for (row, r) in jacobian.iter().zip(&residuals) {
            for c in 0..6 {
                b[c] -= row[c] * r;
                for d in 0..6 {
                    a[c][d] += row[c] * row[d];
                }
            }
        }
        for (d, a_row) in a.iter_mut().enumerate() {
            a_row[d] += lambda;
        }

        let Some(delta) = solve_6x6(a, b) else {
            lambda *= params.damping_factor;
            continue;
        };

        let candidate = apply(&delta, &camera_t_world);
        match project_all(camera, &candidate, object_points, image_points, &mut residuals_plus) {
            Some(candidate_error) if candidate_error < sqr_error => {
                let decrease = sqr_error - candidate_error;
                camera_t_world = candidate;
                sqr_error = candidate_error;
                residuals.copy_from_slice(&residuals_plus);
                lambda = (lambda / params.damping_factor).max(1e-12);
                converged = decrease < params.epsilon;
            }
            _ => lambda *= params.damping_factor,
        }
    }

    Ok(RefinedPose {
        world_t_camera: camera_t_world.inverse(),
        mean_sqr_error: sqr_error / n as f64,
        iterations,
        converged,
    })
}

/// Left-multiplies `camera_t_world` by the increment `[rotation vector, translation]`.
fn apply(delta: &[f64; 6], camera_t_world: &SE3) -> SE3 {
    let increment = SE3::new(
        DQuat::from_scaled_axis(DVec3::new(delta[0], delta[1], delta[2])),
        DVec3::new(delta[3], delta[4], delta[5]),
    );
    increment * *camera_t_world
}

/// Writes the pixel residuals and returns their summed squares, `None` if a point is behind
/// the camera.
fn project_all(
    camera: &dyn CameraModel,
    camera_t_world: &SE3,
    object_points: &[DVec3],
    image_points: &[DVec2],
    out: &mut [f64],
) -> Option<f64> {
    let mut sum = 0.0;
    for (i, (object_point, image_point)) in object_points.iter().zip(image_points).enumerate() {
        let projected = camera.project_camera(camera_t_world.transform_point(*object_point))?;
        let residual = projected - *image_point;
        out[2 * i] = residual.x;
        out[2 * i + 1] = residual.y;
        sum += residual.length_squared();
    }
    Some(sum)
}

/// Dense 6x6 solver using Gaussian elimination with partial pivoting.
fn solve_6x6(mut a: [[f64; 6]; 6], mut b: [f64; 6]) -> Option<[f64; 6]> {
    for i in 0..6 {
        let pivot = (i..6).max_by(|&r, &s| a[r][i].abs().total_cmp(&a[s][i].abs()))?;
        if a[pivot][i].abs() < 1e-15 {
            return None;
        }
        a.swap(i, pivot);
        b.swap(i, pivot);

        for r in (i + 1)..6 {
            let factor = a[r][i] / a[i][i];
            if factor == 0.0 {
                continue;
            }
            for c in i..6 {
                a[r][c] -= factor * a[i][c];
            }
            b[r] -= factor * b[i];
        }
    }

    let mut x = [0.0; 6];
    for i in (0..6).rev() {
        let tail = ((i + 1)..6).map(|c| a[i][c] * x[c]).sum::<f64>();
        x[i] = (b[i] - tail) / a[i][i];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn correspondences(
        rng: &mut StdRng,
        camera: &PinholeCamera,
        world_t_camera: &SE3,
        count: usize,
    ) -> (Vec<DVec3>, Vec<DVec2>) {
        let object_points = (0..count)
            .map(|_| {
                world_t_camera.transform_point(DVec3::new(
                    rng.random_range(-2.0..2.0),
                    rng.random_range(-1.5..1.5),
                    rng.random_range(4.0..8.0),
                ))
            })
            .collect::<Vec<_>>();
        let image_points = object_points
            .iter()
            .filter_map(|p| camera.project(world_t_camera, *p))
            .collect();
        (object_points, image_points)
    }

    #[test]
    fn test_solve_6x6() {
        let a = [
            [4.0, 1.0, 0.0, 0.0, 0.0, 2.0],
            [1.0, 5.0, 1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 6.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 7.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0, 8.0, 1.0],
            [2.0, 0.0, 0.0, 0.0, 1.0, 9.0],
        ];
        let expected = [1.0, -2.0, 3.0, -4.0, 5.0, -6.0];
        let b: [f64; 6] = std::array::from_fn(|r| (0..6).map(|c| a[r][c] * expected[c]).sum());

        let x = solve_6x6(a, b).unwrap();
        for (x, e) in x.iter().zip(expected) {
            assert_relative_eq!(*x, e, epsilon = 1e-12);
        }
        assert!(solve_6x6([[0.0; 6]; 6], [1.0; 6]).is_none());
    }

    #[test]
    fn test_refine_recovers_perturbed_pose() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(4);
        let world_t_camera =
            SE3::from_axis_angle(DVec3::new(0.1, 1.0, 0.0), 0.3, DVec3::new(0.5, 0.0, -1.0));
        let (object_points, image_points) =
            correspondences(&mut rng, &camera, &world_t_camera, 20);

        let perturbed =
            world_t_camera * SE3::from_axis_angle(DVec3::X, 0.02, DVec3::new(0.05, -0.03, 0.1));
        let params = LmParams::default();
        let refined = refine_pose(&camera, &perturbed, &object_points, &image_points, &params)?;

        assert!(refined.mean_sqr_error < 1e-10);
        assert_relative_eq!(
            refined.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-6
        );
        assert!(refined.world_t_camera.rotation().angle_between(world_t_camera.rotation()) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_exact_pose_is_kept() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(5);
        let world_t_camera = SE3::from_axis_angle(DVec3::Y, -0.2, DVec3::new(0.0, 0.3, 0.0));
        let (object_points, image_points) = correspondences(&mut rng, &camera, &world_t_camera, 3);

        let params = LmParams::default();
        let refined =
            refine_pose(&camera, &world_t_camera, &object_points, &image_points, &params)?;
        assert!(refined.converged);
        assert_eq!(refined.iterations, 0);
        assert_relative_eq!(
            refined.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn test_too_few_points() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let result = refine_pose(
            &camera,
            &SE3::IDENTITY,
            &[DVec3::Z; 2],
            &[DVec2::ZERO; 2],
            &LmParams::default(),
        );
        assert_eq!(
            result,
            Err(MappingError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            })
        );
    }
}
