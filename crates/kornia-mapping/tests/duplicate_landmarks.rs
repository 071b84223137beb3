mod common;

use kornia_mapping::search::find_duplicate_landmarks;
use kornia_mapping::{
    merge_duplicate_landmarks, AlternatingRefiner, ConsolidationParams, LandmarkId,
    LandmarkMergeParams, Map, MappingContext, MappingError, P3pRansacSolver, PoseId,
};
use rand::{rngs::StdRng, SeedableRng};

/// Ten poses see a shared scene, ten further points were tracked twice: once by the first half
/// of the poses and once by the second half.
fn scene_with_duplicates(
    rng: &mut StdRng,
) -> Result<(Map, Vec<(LandmarkId, LandmarkId)>), MappingError> {
    let points = common::random_points(rng, 50, 2.5);

    let mut map = Map::default();
    for k in 0..10u64 {
        let pose = common::camera_pose(-0.5 + 0.1 * k as f64, 0.02 * k as f64, 0.01 * k as f64);
        map.database.add_pose(PoseId(k), Some(pose))?;
    }

    for point in &points[..40] {
        let descriptor = common::random_descriptor(rng);
        let id = common::add_landmark(&mut map, *point, descriptor);
        for k in 0..10u64 {
            common::observe(&mut map, PoseId(k), id)?;
        }
    }

    let mut duplicates = Vec::new();
    for point in &points[40..] {
        let descriptor = common::random_descriptor(rng);
        let first = common::add_landmark(&mut map, *point, descriptor);
        let second = common::add_landmark(&mut map, *point, descriptor);
        for k in 0..5u64 {
            common::observe(&mut map, PoseId(k), first)?;
            common::observe(&mut map, PoseId(5 + k), second)?;
        }
        duplicates.push((first, second));
    }

    Ok((map, duplicates))
}

#[test]
fn finds_only_the_duplicates() -> Result<(), MappingError> {
    let mut rng = StdRng::seed_from_u64(21);
    let (map, duplicates) = scene_with_duplicates(&mut rng)?;

    let camera = common::camera();
    let pairs = find_duplicate_landmarks(&map, &camera, &mut rng, &LandmarkMergeParams::default())?;

    assert_eq!(pairs.len(), duplicates.len());
    for (first, second) in duplicates {
        assert!(pairs.contains(first, second));
    }
    Ok(())
}

#[test]
fn merging_duplicates_joins_their_tracks() -> Result<(), MappingError> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut rng = StdRng::seed_from_u64(21);
    let (mut map, duplicates) = scene_with_duplicates(&mut rng)?;

    let camera = common::camera();
    let ctx = MappingContext::new(&camera, &P3pRansacSolver, &AlternatingRefiner);
    let report = merge_duplicate_landmarks(
        &mut map,
        &ctx,
        &mut rng,
        &LandmarkMergeParams::default(),
        &ConsolidationParams::default(),
    )?;

    assert_eq!(report.merged_groups, 10);
    assert_eq!(report.removed_landmarks, 10);
    assert!(report.refined());
    assert_eq!(map.database.num_landmarks(), 50);

    for (first, second) in duplicates {
        assert!(!map.database.has_landmark(second));
        assert_eq!(map.database.poses_observing(first)?.len(), 10);
    }
    Ok(())
}

#[test]
fn map_without_duplicates_is_untouched() -> Result<(), MappingError> {
    let mut rng = StdRng::seed_from_u64(4);
    let points = common::random_points(&mut rng, 30, 2.5);

    let mut map = Map::default();
    for k in 0..4u64 {
        map.database
            .add_pose(PoseId(k), Some(common::camera_pose(0.2 * k as f64, 0.0, 0.0)))?;
    }
    for point in points {
        let descriptor = common::random_descriptor(&mut rng);
        let id = common::add_landmark(&mut map, point, descriptor);
        for k in 0..4u64 {
            common::observe(&mut map, PoseId(k), id)?;
        }
    }
    let before = map.clone();

    let camera = common::camera();
    let ctx = MappingContext::new(&camera, &P3pRansacSolver, &AlternatingRefiner);
    let params = LandmarkMergeParams {
        iterations_without_improvement: 20,
        ..Default::default()
    };
    let consolidation = ConsolidationParams::default();
    let report = merge_duplicate_landmarks(&mut map, &ctx, &mut rng, &params, &consolidation)?;

    assert_eq!(report, Default::default());
    assert_eq!(map, before);
    Ok(())
}
