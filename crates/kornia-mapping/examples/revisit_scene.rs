use glam::DVec3;
use kornia_mapping::{
    close_loops, merge_duplicate_landmarks, AlternatingRefiner, BinaryDescriptor, CameraModel,
    ConsolidationParams, LandmarkMergeParams, LoopClosureParams, Map, MappingContext,
    P3pRansacSolver, PinholeCamera, PoseId, SE3,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
    let mut rng = StdRng::seed_from_u64(42);

    // a camera drives past a wall of points twice, the second pass re-creates every landmark
    let points = (0..80)
        .map(|_| {
            DVec3::new(
                rng.random_range(-3.0..3.0),
                rng.random_range(-1.5..1.5),
                rng.random_range(6.0..10.0),
            )
        })
        .collect::<Vec<_>>();
    let descriptors = points
        .iter()
        .map(|_| BinaryDescriptor([rng.random(), rng.random(), rng.random(), rng.random()]))
        .collect::<Vec<_>>();

    let mut map = Map::default();
    for pass in 0..2u64 {
        let pose_ids = (0..8u64).map(|k| PoseId(pass * 8 + k)).collect::<Vec<_>>();
        for (k, pose_id) in pose_ids.iter().enumerate() {
            let x = -0.4 + 0.1 * k as f64 + 0.03 * pass as f64;
            let pose = SE3::from_axis_angle(DVec3::Y, 0.0, DVec3::new(x, 0.0, 0.0));
            map.database.add_pose(*pose_id, Some(pose))?;
        }

        for (point, descriptor) in points.iter().zip(&descriptors) {
            let id = map.database.add_landmark(Some(*point), 1.0);
            map.descriptors.insert(id, *descriptor);
            for pose_id in &pose_ids {
                let Some(world_t_camera) = map.database.pose(*pose_id)? else {
                    continue;
                };
                if let Some(pixel) = camera.project(&world_t_camera, *point) {
                    map.database.add_observation(*pose_id, id, pixel)?;
                }
            }
        }
    }

    println!(
        "Map with {} poses and {} landmarks",
        map.database.num_poses(),
        map.database.num_landmarks()
    );

    let ctx = MappingContext::new(&camera, &P3pRansacSolver, &AlternatingRefiner);
    let consolidation = ConsolidationParams::default();

    let loop_params = LoopClosureParams::default();
    let report = close_loops(&mut map, &ctx, &mut rng, &loop_params, &consolidation)?;
    println!(
        "Loop closure: merged {} groups, removed {} landmarks, refined: {}",
        report.merged_groups,
        report.removed_landmarks,
        report.refined()
    );

    let merge_params = LandmarkMergeParams::default();
    let report =
        merge_duplicate_landmarks(&mut map, &ctx, &mut rng, &merge_params, &consolidation)?;
    println!(
        "Duplicate merging: merged {} groups, removed {} landmarks",
        report.merged_groups, report.removed_landmarks
    );

    println!("Final map has {} landmarks", map.database.num_landmarks());

    Ok(())
}
