//! Robust camera pose estimation from 2D/3D correspondences.

use glam::{DVec2, DVec3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::error::MappingError;
use crate::geometry::SE3;
use crate::p3p::solve_p3p;
use crate::pose_refinement::{self, refine_pose, LmParams};

/// Parameters of the RANSAC loop around a minimal pose solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Pixel distance below which a correspondence counts as an inlier.
    pub max_reprojection_error: f64,
    /// Minimum number of inliers for a pose to be accepted.
    pub min_inliers: usize,
    /// Desired probability that at least one sample set is outlier-free.
    pub success_probability: f64,
    /// Expected fraction of inliers, sets the initial iteration count.
    pub inlier_rate: f64,
    /// Upper bound on the number of iterations.
    pub max_iterations: usize,
    /// Whether to refit on all inliers of the best hypothesis.
    pub refine: bool,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_reprojection_error: 3.0,
            min_inliers: 10,
            success_probability: 0.99,
            inlier_rate: 0.5,
            max_iterations: 500,
            refine: true,
        }
    }
}

impl RansacParams {
    pub(crate) fn validate(&self) -> Result<(), MappingError> {
        if !(self.max_reprojection_error > 0.0) {
            return Err(MappingError::InvalidParameter("reprojection error must be positive"));
        }
        if !(self.success_probability > 0.0 && self.success_probability < 1.0) {
            return Err(MappingError::InvalidParameter("success probability must be in (0, 1)"));
        }
        if !(self.inlier_rate > 0.0 && self.inlier_rate <= 1.0) {
            return Err(MappingError::InvalidParameter("inlier rate must be in (0, 1]"));
        }
        if self.max_iterations == 0 {
            return Err(MappingError::InvalidParameter("at least one iteration is required"));
        }
        Ok(())
    }
}

/// A pose found by a robust solver.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    /// The camera pose in world coordinates.
    pub world_t_camera: SE3,
    /// Indices of the correspondences consistent with the pose.
    pub inliers: Vec<usize>,
    /// Mean squared pixel error over the inliers.
    pub mean_sqr_error: f64,
}

/// Estimates a camera pose from 3D points and their observed pixels.
pub trait PoseSolver {
    /// Number of correspondences in a minimal sample.
    fn minimal_correspondences(&self) -> usize;

    /// Estimates the pose of the camera that observed `object_points` at `image_points`.
    ///
    /// # Arguments
    ///
    /// * `camera` - The camera model of the observing image.
    /// * `object_points` - The 3D points in world coordinates.
    /// * `image_points` - The observed pixels, aligned with `object_points`.
    /// * `rng` - Random source for sampling.
    /// * `params` - The RANSAC parameters.
    fn estimate_pose<R: Rng + ?Sized>(
        &self,
        camera: &dyn CameraModel,
        object_points: &[DVec3],
        image_points: &[DVec2],
        rng: &mut R,
        params: &RansacParams,
    ) -> Result<PoseEstimate, MappingError>;
}

/// Number of RANSAC iterations needed to draw one outlier-free sample.
///
/// # Arguments
///
/// * `sample_size` - Number of correspondences per sample.
/// * `success_probability` - Desired probability of drawing at least one clean sample.
/// * `inlier_rate` - Fraction of inliers among the correspondences.
pub fn ransac_iterations(sample_size: usize, success_probability: f64, inlier_rate: f64) -> usize {
    if inlier_rate >= 1.0 {
        return 1;
    }
    if inlier_rate <= 0.0 {
        return usize::MAX;
    }

    let clean_sample = inlier_rate.powi(sample_size as i32);
    let denominator = (1.0 - clean_sample).ln();
    if denominator >= 0.0 {
        return usize::MAX;
    }

    let iterations = ((1.0 - success_probability).ln() / denominator).ceil();
    if iterations.is_finite() {
        (iterations as usize).max(1)
    } else {
        usize::MAX
    }
}

/// Grunert's three-point solver inside an adaptive RANSAC loop.
///
/// Every sample of three correspondences yields up to four poses, each is scored against all
/// correspondences. The best pose is refined on its inliers with Levenberg-Marquardt.
#[derive(Debug, Clone, Copy, Default)]
pub struct P3pRansacSolver;

impl P3pRansacSolver {
    const SAMPLE_SIZE: usize = 3;
}

impl PoseSolver for P3pRansacSolver {
    fn minimal_correspondences(&self) -> usize {
        Self::SAMPLE_SIZE
    }

    fn estimate_pose<R: Rng + ?Sized>(
        &self,
        camera: &dyn CameraModel,
        object_points: &[DVec3],
        image_points: &[DVec2],
        rng: &mut R,
        params: &RansacParams,
    ) -> Result<PoseEstimate, MappingError> {
        if object_points.len() != image_points.len() {
            return Err(MappingError::MismatchedLengths {
                left: object_points.len(),
                right: image_points.len(),
            });
        }
        if !camera.is_valid() {
            return Err(MappingError::InvalidCamera);
        }
        params.validate()?;

        let n = object_points.len();
        let required = params.min_inliers.max(Self::SAMPLE_SIZE);
        if n < required {
            return Err(MappingError::InsufficientCorrespondences {
                required,
                actual: n,
            });
        }

        let bearings = image_points
            .iter()
            .map(|pixel| camera.unproject(*pixel))
            .collect::<Vec<_>>();

        let sqr_threshold = params.max_reprojection_error * params.max_reprojection_error;

        let mut max_iterations = ransac_iterations(
            Self::SAMPLE_SIZE,
            params.success_probability,
            params.inlier_rate,
        )
        .clamp(1, params.max_iterations);

        let mut best: Option<(SE3, Vec<usize>, f64)> = None;

        let mut iteration = 0;
        while iteration < max_iterations {
            iteration += 1;

            let sample = rand::seq::index::sample(rng, n, Self::SAMPLE_SIZE);
            let sample_objects = [
                object_points[sample.index(0)],
                object_points[sample.index(1)],
                object_points[sample.index(2)],
            ];
            let sample_bearings = [
                bearings[sample.index(0)],
                bearings[sample.index(1)],
                bearings[sample.index(2)],
            ];

            for world_t_camera in solve_p3p(&sample_objects, &sample_bearings) {
                let (inliers, sqr_error_sum) =
                    classify(camera, &world_t_camera, object_points, image_points, sqr_threshold);

                let improves = best.as_ref().map_or(true, |(_, best_inliers, best_error)| {
                    inliers.len() > best_inliers.len()
                        || (inliers.len() == best_inliers.len() && sqr_error_sum < *best_error)
                });
                if improves {
                    let rate = inliers.len() as f64 / n as f64;
                    max_iterations = max_iterations.min(ransac_iterations(
                        Self::SAMPLE_SIZE,
                        params.success_probability,
                        rate,
                    ));
                    best = Some((world_t_camera, inliers, sqr_error_sum));
                }
            }
        }

        let (mut world_t_camera, mut inliers, _) = best.ok_or(MappingError::PoseEstimationFailed)?;

        if params.refine && inliers.len() >= pose_refinement::MIN_CORRESPONDENCES {
            let (objects, pixels): (Vec<_>, Vec<_>) = inliers
                .iter()
                .map(|&i| (object_points[i], image_points[i]))
                .unzip();

            let lm = LmParams::default();
            if let Ok(refined) = refine_pose(camera, &world_t_camera, &objects, &pixels, &lm) {
                let (refined_inliers, _) = classify(
                    camera,
                    &refined.world_t_camera,
                    object_points,
                    image_points,
                    sqr_threshold,
                );
                if refined_inliers.len() >= inliers.len() {
                    world_t_camera = refined.world_t_camera;
                    inliers = refined_inliers;
                }
            }
        }

        if inliers.len() < required {
            return Err(MappingError::PoseEstimationFailed);
        }

        let (inliers, sqr_error_sum) =
            classify(camera, &world_t_camera, object_points, image_points, sqr_threshold);
        let mean_sqr_error = sqr_error_sum / inliers.len().max(1) as f64;

        Ok(PoseEstimate {
            world_t_camera,
            inliers,
            mean_sqr_error,
        })
    }
}

/// Returns the inlier indices and the sum of their squared pixel errors.
fn classify(
    camera: &dyn CameraModel,
    world_t_camera: &SE3,
    object_points: &[DVec3],
    image_points: &[DVec2],
    sqr_threshold: f64,
) -> (Vec<usize>, f64) {
    let camera_t_world = world_t_camera.inverse();

    let mut inliers = Vec::new();
    let mut sqr_error_sum = 0.0;

    for (index, (object_point, image_point)) in object_points.iter().zip(image_points).enumerate() {
        let Some(projected) = camera.project_camera(camera_t_world.transform_point(*object_point))
        else {
            continue;
        };
        let sqr_error = projected.distance_squared(*image_point);
        if sqr_error <= sqr_threshold {
            inliers.push(index);
            sqr_error_sum += sqr_error;
        }
    }

    (inliers, sqr_error_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn scene(rng: &mut StdRng, count: usize, world_t_camera: &SE3) -> Vec<DVec3> {
        (0..count)
            .map(|_| {
                let in_camera = DVec3::new(
                    rng.random_range(-2.0..2.0),
                    rng.random_range(-1.5..1.5),
                    rng.random_range(4.0..8.0),
                );
                world_t_camera.transform_point(in_camera)
            })
            .collect()
    }

    #[test]
    fn test_ransac_iterations() {
        assert_eq!(ransac_iterations(3, 0.99, 0.85), 5);
        assert_eq!(ransac_iterations(6, 0.99, 1.0), 1);
        assert_eq!(ransac_iterations(6, 0.99, 0.0), usize::MAX);
        assert!(ransac_iterations(6, 0.99, 0.5) > ransac_iterations(6, 0.99, 0.8));
    }

    #[test]
    fn test_insufficient_correspondences() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(0);
        let result = P3pRansacSolver.estimate_pose(
            &camera,
            &[DVec3::Z; 4],
            &[DVec2::ZERO; 4],
            &mut rng,
            &RansacParams::default(),
        );
        assert_eq!(
            result,
            Err(MappingError::InsufficientCorrespondences {
                required: 10,
                actual: 4
            })
        );
    }

    #[test]
    fn test_exact_pose() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(1);

        let world_t_camera =
            SE3::from_axis_angle(DVec3::new(0.2, 1.0, 0.1), 0.5, DVec3::new(1.0, -0.5, 2.0));
        let object_points = scene(&mut rng, 30, &world_t_camera);
        let image_points = object_points
            .iter()
            .map(|p| camera.project(&world_t_camera, *p).unwrap())
            .collect::<Vec<_>>();

        let estimate = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points,
            &image_points,
            &mut rng,
            &RansacParams::default(),
        )?;

        assert_eq!(estimate.inliers.len(), 30);
        assert_relative_eq!(
            estimate.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-6
        );
        assert!(estimate.world_t_camera.rotation().angle_between(world_t_camera.rotation()) < 1e-6);
        assert!(estimate.mean_sqr_error < 1e-6);
        Ok(())
    }

    #[test]
    fn test_pose_with_outliers() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(2);

        let world_t_camera = SE3::from_axis_angle(DVec3::X, -0.3, DVec3::new(0.0, 1.0, -1.0));
        let object_points = scene(&mut rng, 100, &world_t_camera);
        let mut image_points = object_points
            .iter()
            .map(|p| camera.project(&world_t_camera, *p).unwrap())
            .collect::<Vec<_>>();

        for pixel in image_points.iter_mut().step_by(4) {
            *pixel = DVec2::new(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
        }

        let estimate = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points,
            &image_points,
            &mut rng,
            &RansacParams::default(),
        )?;

        assert!(estimate.inliers.len() >= 75);
        for &i in &estimate.inliers {
            let expected = camera.project(&world_t_camera, object_points[i]).unwrap();
            assert!(image_points[i].distance(expected) <= 3.0);
        }
        assert_relative_eq!(
            estimate.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn test_planar_scene() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(3);

        // a wall at z = 6 seen at an angle
        let world_t_camera =
            SE3::from_axis_angle(DVec3::new(0.1, 1.0, 0.0), 0.3, DVec3::new(-1.0, 0.2, 0.0));
        let object_points = (0..50)
            .map(|_| DVec3::new(rng.random_range(-3.0..3.0), rng.random_range(-2.0..2.0), 6.0))
            .collect::<Vec<_>>();
        let image_points = object_points
            .iter()
            .map(|p| camera.project(&world_t_camera, *p).unwrap())
            .collect::<Vec<_>>();

        let estimate = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points,
            &image_points,
            &mut rng,
            &RansacParams::default(),
        )?;

        assert_eq!(estimate.inliers.len(), 50);
        assert_relative_eq!(
            estimate.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-6
        );
        assert!(estimate.world_t_camera.rotation().angle_between(world_t_camera.rotation()) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_four_correspondences() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(4);

        let world_t_camera = SE3::from_axis_angle(DVec3::Z, 0.2, DVec3::new(0.5, 0.0, 1.0));
        let object_points = scene(&mut rng, 4, &world_t_camera);
        let image_points = object_points
            .iter()
            .map(|p| camera.project(&world_t_camera, *p).unwrap())
            .collect::<Vec<_>>();

        let params = RansacParams {
            min_inliers: 3,
            ..Default::default()
        };
        let estimate = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points,
            &image_points,
            &mut rng,
            &params,
        )?;

        assert_eq!(estimate.inliers, vec![0, 1, 2, 3]);
        assert_relative_eq!(
            estimate.world_t_camera.translation().distance(world_t_camera.translation()),
            0.0,
            epsilon = 1e-6
        );

        // fewer than a minimal sample
        let result = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points[..2],
            &image_points[..2],
            &mut rng,
            &params,
        );
        assert_eq!(
            result,
            Err(MappingError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            })
        );
        Ok(())
    }

    #[test]
    fn test_mostly_outliers() -> Result<(), MappingError> {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(5);

        let world_t_camera = SE3::from_axis_angle(DVec3::Y, 0.4, DVec3::new(2.0, 0.0, -0.5));
        let object_points = scene(&mut rng, 200, &world_t_camera);
        let mut image_points = object_points
            .iter()
            .map(|p| camera.project(&world_t_camera, *p).unwrap())
            .collect::<Vec<_>>();

        // only 30% of the matches are correct
        let mut correct = 0;
        for (i, pixel) in image_points.iter_mut().enumerate() {
            if i % 10 < 3 {
                correct += 1;
                continue;
            }
            *pixel = DVec2::new(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
        }

        let params = RansacParams {
            min_inliers: 20,
            inlier_rate: 0.15,
            max_iterations: 1000,
            ..Default::default()
        };
        let estimate = P3pRansacSolver.estimate_pose(
            &camera,
            &object_points,
            &image_points,
            &mut rng,
            &params,
        )?;

        assert!(estimate.inliers.len() >= correct);
        let error = estimate.world_t_camera.translation().distance(world_t_camera.translation());
        assert!(error < 1e-2);
        Ok(())
    }
}
