use approx::assert_relative_eq;
use cv_core::nalgebra::{Point2, Point3, Rotation3, Vector2, Vector3};
use cv_core::{KeyPoint, Pose, WorldToCamera};
use cv_depth_filter::{
    Camera, DepthFilter, DepthFilterError, DepthFilterSettings, EpipolarMatcher, EpipolarSearch,
    FeatureKey, FrameKey, MapData, PinholeCamera, SeedCounter, SeedState,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::HashMap;

/// Always reports the same depth.
struct FixedDepth(f64);

impl<C> EpipolarMatcher<C> for FixedDepth {
    fn find_match(&mut self, _: &EpipolarSearch<'_, C>) -> Option<f64> {
        Some(self.0)
    }
}

/// Never finds a match, but counts how often it was asked.
#[derive(Default)]
struct NoMatch {
    calls: usize,
}

impl<C> EpipolarMatcher<C> for NoMatch {
    fn find_match(&mut self, _: &EpipolarSearch<'_, C>) -> Option<f64> {
        self.calls += 1;
        None
    }
}

fn camera() -> PinholeCamera {
    PinholeCamera::centered(500.0, 640, 480)
}

/// A pose looking down +z with the optical center at `center` in world space.
fn pose_at(center: Vector3<f64>) -> WorldToCamera {
    WorldToCamera::from_parts(-center, Rotation3::identity())
}

fn principal_point() -> KeyPoint {
    KeyPoint(camera().intrinsics.principal_point)
}

fn offset(x: f64, y: f64) -> KeyPoint {
    KeyPoint(principal_point().0 + Vector2::new(x, y))
}

/// A keyframe at the origin with one candidate per keypoint.
fn keyframe(data: &mut MapData<PinholeCamera>, keypoints: &[KeyPoint]) -> (FrameKey, Vec<FeatureKey>) {
    let frame = data.insert_frame(WorldToCamera::identity(), camera());
    let features = keypoints
        .iter()
        .map(|&keypoint| data.insert_candidate(frame, keypoint).unwrap())
        .collect();
    (frame, features)
}

#[test]
fn creation_uses_depth_prior() {
    let mut data = MapData::new();
    let (frame, features) = keyframe(
        &mut data,
        &[principal_point(), offset(10.0, 0.0), offset(0.0, 10.0)],
    );
    data.feature_mut(features[2]).unwrap().position = Some(Point3::new(0.0, 0.0, 1.0));

    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    assert_eq!(filter.add_keyframe(&data, frame, 2.0, 0.5).unwrap(), 2);

    let seeds = filter.seeds_from(frame);
    assert_eq!(seeds.len(), 2);
    assert_ne!(seeds[0].id, seeds[1].id);
    for seed in &seeds {
        assert_eq!(seed.batch, filter.counter().batch());
        assert_ne!(seed.feature, features[2]);
        assert_relative_eq!(seed.state.mu, 0.5);
        assert_relative_eq!(seed.state.z_range, 2.0);
        assert_relative_eq!(seed.state.sigma2, 0.1111, epsilon = 1e-4);
        assert_relative_eq!(seed.state.a, 10.0);
        assert_relative_eq!(seed.state.b, 10.0);
    }

    let new_keyframe = filter.take_new_keyframe().unwrap();
    assert_eq!(new_keyframe.frame, frame);
    assert_relative_eq!(new_keyframe.depth_mean, 2.0);
    assert_relative_eq!(new_keyframe.depth_min, 0.5);
    assert!(filter.take_new_keyframe().is_none());
}

#[test]
fn consistent_matches_converge_to_point() {
    let mut data = MapData::new();
    let (keyframe, features) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    let mut converged_after = None;
    for n in 1..=20 {
        let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());
        let stats = filter.add_frame(&mut data, frame).unwrap();
        assert_eq!(stats.visited, 1);
        if !stats.converged.is_empty() {
            assert_eq!(stats.converged, features);
            converged_after = Some(n);
            break;
        }
        assert_eq!(stats.updates, 1);
        assert!(data.feature(features[0]).unwrap().position.is_none());
    }

    assert!(converged_after.unwrap() < 20);
    assert!(filter.seeds().is_empty());
    let position = data.feature(features[0]).unwrap().position.unwrap();
    assert!((position - Point3::new(0.0, 0.0, 2.0)).norm() < 1e-6);
}

#[test]
fn converged_point_is_in_world_space() {
    let mut data = MapData::new();
    let origin_center = Vector3::new(1.0, -0.5, 3.0);
    let keyframe = data.insert_frame(pose_at(origin_center), camera());
    let feature = data.insert_candidate(keyframe, principal_point()).unwrap();
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    for _ in 0..20 {
        let frame = data.insert_frame(
            pose_at(origin_center + Vector3::new(0.2, 0.0, 0.0)),
            camera(),
        );
        filter.add_frame(&mut data, frame).unwrap();
    }

    let position = data.feature(feature).unwrap().position.unwrap();
    let expected = Point3::from(origin_center + Vector3::new(0.0, 0.0, 2.0));
    assert!((position - expected).norm() < 1e-6);
}

#[test]
fn failed_match_only_increments_b() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    let before = filter.seeds()[0];

    let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.failed_matches, 1);
    assert_eq!(stats.searches, 1);
    assert_eq!(stats.updates, 0);
    assert_eq!(filter.matcher().calls, 1);

    let after = filter.seeds()[0];
    assert_eq!(
        after.state,
        SeedState {
            b: before.state.b + 1.0,
            ..before.state
        }
    );
    assert_eq!(after.id, before.id);
    assert_eq!(after.batch, before.batch);
}

#[test]
fn invisible_seed_is_untouched() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    let before = filter.seeds().to_vec();

    // The point projects far to the left of the image.
    let beside = data.insert_frame(pose_at(Vector3::new(5.0, 0.0, 0.0)), camera());
    // The point is behind the camera.
    let beyond = data.insert_frame(pose_at(Vector3::new(0.0, 0.0, 3.0)), camera());
    for frame in [beside, beyond, keyframe] {
        let stats = filter.update_seeds(&mut data, frame).unwrap();
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.searches, 0);
    }

    assert_eq!(filter.matcher().calls, 0);
    assert_eq!(filter.seeds(), &before[..]);
}

#[test]
fn margin_hides_seeds_near_border() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let settings = DepthFilterSettings::default().image_margin(20.0);
    let mut filter = DepthFilter::new(NoMatch::default(), settings, SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    // Moves the projection of the hypothesis 305 pixels left, 14.5 pixels from the border.
    let frame = data.insert_frame(pose_at(Vector3::new(1.22, 0.0, 0.0)), camera());
    assert_eq!(filter.update_seeds(&mut data, frame).unwrap().deferred, 1);

    filter.settings_mut().image_margin = 10.0;
    assert_eq!(filter.update_seeds(&mut data, frame).unwrap().failed_matches, 1);
}

#[test]
fn remove_keyframe_removes_exactly_its_seeds() {
    let mut data = MapData::new();
    let (a, _) = keyframe(&mut data, &[principal_point(), offset(5.0, 5.0)]);
    let (b, _) = keyframe(&mut data, &[offset(-5.0, 0.0), offset(0.0, -5.0), offset(8.0, 8.0)]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, a, 2.0, 0.5).unwrap();
    filter.add_keyframe(&data, b, 2.0, 0.5).unwrap();
    let kept = filter.seeds_from(b);

    assert_eq!(filter.remove_keyframe(a), 2);
    assert_eq!(filter.seeds(), &kept[..]);
    assert_eq!(filter.remove_keyframe(a), 0);
}

#[test]
fn old_seeds_expire() {
    let mut data = MapData::new();
    let (a, _) = keyframe(&mut data, &[principal_point()]);
    let (b, _) = keyframe(&mut data, &[principal_point()]);
    let (c, _) = keyframe(&mut data, &[principal_point()]);
    let settings = DepthFilterSettings::default().max_keyframe_age(1);
    let mut filter = DepthFilter::new(NoMatch::default(), settings, SeedCounter::new());

    filter.add_keyframe(&data, a, 2.0, 0.5).unwrap();
    filter.add_keyframe(&data, b, 2.0, 0.5).unwrap();
    assert_eq!(filter.seeds().len(), 2);
    filter.add_keyframe(&data, c, 2.0, 0.5).unwrap();
    assert!(filter.seeds_from(a).is_empty());
    assert_eq!(filter.seeds_from(b).len(), 1);
    assert_eq!(filter.seeds_from(c).len(), 1);

    let batch = filter.counter().batch();
    assert!(filter.seeds().iter().all(|seed| seed.age(batch) <= 1));
}

#[test]
fn frame_queue_holds_two_frames() {
    let mut data = MapData::<PinholeCamera>::new();
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    let frames: Vec<_> = (0..3)
        .map(|i| data.insert_frame(pose_at(Vector3::new(0.1 * i as f64, 0.0, 0.0)), camera()))
        .collect();

    filter.add_frame(&mut data, frames[0]).unwrap();
    assert_eq!(filter.frame_queue().collect::<Vec<_>>(), vec![frames[0]]);
    filter.add_frame(&mut data, frames[1]).unwrap();
    filter.add_frame(&mut data, frames[2]).unwrap();
    assert_eq!(filter.frame_queue().collect::<Vec<_>>(), frames[1..]);

    filter.clear_frame_queue();
    assert_eq!(filter.frame_queue().count(), 0);
}

#[test]
fn budget_limits_searches_and_rotates() {
    let mut data = MapData::new();
    let keypoints: Vec<_> = (0..5).map(|i| offset(10.0 * i as f64, 0.0)).collect();
    let (keyframe, _) = keyframe(&mut data, &keypoints);
    let settings = DepthFilterSettings::default().max_updates_per_frame(Some(2));
    let mut filter = DepthFilter::new(NoMatch::default(), settings, SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());

    let searched = |filter: &DepthFilter<NoMatch>| {
        filter
            .seeds()
            .iter()
            .filter(|seed| seed.state.b > 10.0)
            .count()
    };

    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 2);
    assert_eq!(stats.budget_deferred, 3);
    assert_eq!(filter.matcher().calls, 2);
    assert_eq!(searched(&filter), 2);

    // The three seeds skipped last time are searched before the others.
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 2);
    assert_eq!(searched(&filter), 4);

    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 2);
    assert_eq!(searched(&filter), 5);
    assert_eq!(filter.matcher().calls, 6);
    assert_eq!(filter.seeds().len(), 5);
}

#[test]
fn orphaned_seeds_are_dropped() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point(), offset(5.0, 0.0)]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    data.remove_frame(keyframe);

    let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.degenerate, 2);
    assert_eq!(stats.remaining(), 0);
    assert!(filter.seeds().is_empty());
}

#[test]
fn zero_baseline_drops_seed() {
    let mut data = MapData::new();
    let (keyframe, features) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    // A different frame captured from exactly the keyframe's pose.
    let frame = data.insert_frame(WorldToCamera::identity(), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 1);
    assert_eq!(stats.degenerate, 1);
    assert_eq!(stats.updates, 0);
    assert!(filter.seeds().is_empty());
    assert!(data.feature(features[0]).unwrap().position.is_none());
}

#[test]
fn motion_along_bearing_drops_seed() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    // The camera moves straight towards the point, so there is no parallax to triangulate with.
    let frame = data.insert_frame(pose_at(Vector3::new(0.0, 0.0, 0.5)), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 1);
    assert_eq!(stats.degenerate, 1);
    assert_eq!(stats.updates, 0);
    assert!(filter.seeds().is_empty());
}

#[test]
fn degenerate_fusion_leaves_seed_unchanged() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());
    // An inverse depth of 1e200 squares to infinity inside the fusion.
    filter.add_keyframe(&data, keyframe, 1e-200, 0.5).unwrap();
    let before = filter.seeds().to_vec();

    // Behind and slightly beside the keyframe, so the hypothesis is in view with some parallax.
    let frame = data.insert_frame(pose_at(Vector3::new(0.01, 0.0, -1.0)), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.searches, 1);
    assert_eq!(stats.updates, 0);
    assert_eq!(stats.failed_matches, 0);
    assert_eq!(stats.degenerate, 0);
    assert_eq!(stats.remaining(), 1);
    assert_eq!(filter.seeds(), &before[..]);
}

#[test]
fn sweep_expires_seeds_when_max_age_is_lowered() {
    let mut data = MapData::new();
    let (a, _) = keyframe(&mut data, &[principal_point()]);
    let (b, _) = keyframe(&mut data, &[offset(5.0, 5.0)]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, a, 2.0, 0.5).unwrap();
    filter.add_keyframe(&data, b, 2.0, 0.5).unwrap();
    assert_eq!(filter.seeds().len(), 2);

    filter.settings_mut().max_keyframe_age = 0;
    let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());
    let stats = filter.add_frame(&mut data, frame).unwrap();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.failed_matches, 1);
    assert!(filter.seeds_from(a).is_empty());
    assert_eq!(filter.seeds_from(b).len(), 1);
}

#[test]
fn refined_pose_moves_published_point() {
    let mut data = MapData::new();
    let (keyframe, features) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(FixedDepth(2.0), Default::default(), SeedCounter::new());

    // Pose refinement corrects the keyframe before its seeds are created.
    let refined = pose_at(Vector3::new(0.0, 1.0, 0.0));
    assert!(data.set_pose(keyframe, refined));
    assert_eq!(data.frame(keyframe).unwrap().pose, refined);
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();

    for _ in 0..20 {
        let frame = data.insert_frame(pose_at(Vector3::new(0.2, 1.0, 0.0)), camera());
        filter.add_frame(&mut data, frame).unwrap();
    }

    let position = data.feature(features[0]).unwrap().position.unwrap();
    assert!((position - Point3::new(0.0, 1.0, 2.0)).norm() < 1e-6);
}

#[test]
fn unknown_frames_are_rejected() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let gone = data.insert_frame(WorldToCamera::identity(), camera());
    data.remove_frame(gone);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());

    assert_eq!(
        filter.add_keyframe(&data, gone, 2.0, 0.5),
        Err(DepthFilterError::UnknownFrame(gone))
    );
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    assert_eq!(
        filter.add_frame(&mut data, gone),
        Err(DepthFilterError::UnknownFrame(gone))
    );
    assert_eq!(filter.frame_queue().count(), 0);
    assert_eq!(filter.seeds().len(), 1);
}

#[test]
fn invalid_depth_priors_are_rejected() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());

    let priors = [
        (2.0, 0.0),
        (-1.0, 0.5),
        (f64::NAN, 0.5),
        (2.0, f64::INFINITY),
        // The prior variance overflows.
        (2.0, 1e-308),
    ];
    for (mean, min) in priors {
        assert!(matches!(
            filter.add_keyframe(&data, keyframe, mean, min),
            Err(DepthFilterError::InvalidDepthPrior { .. })
        ));
    }
    assert!(filter.seeds().is_empty());
    assert!(filter.take_new_keyframe().is_none());
}

#[test]
fn reset_forgets_everything() {
    let mut data = MapData::new();
    let (keyframe, _) = keyframe(&mut data, &[principal_point()]);
    let mut filter = DepthFilter::new(NoMatch::default(), Default::default(), SeedCounter::new());
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    let frame = data.insert_frame(pose_at(Vector3::new(0.2, 0.0, 0.0)), camera());
    filter.add_frame(&mut data, frame).unwrap();

    filter.reset();
    assert!(filter.seeds().is_empty());
    assert_eq!(filter.frame_queue().count(), 0);
    assert!(filter.take_new_keyframe().is_none());
    assert_eq!(filter.counter(), &SeedCounter::new());

    // Ids start over after a reset.
    filter.add_keyframe(&data, keyframe, 2.0, 0.5).unwrap();
    assert_eq!(filter.seeds()[0].id, 0);
}

#[test]
fn noisy_scene_converges_accurately() {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut data = MapData::new();
    let keyframe = data.insert_frame(WorldToCamera::identity(), camera());

    let mut depths = HashMap::new();
    for _ in 0..50 {
        let keypoint = KeyPoint(Point2::new(
            rng.gen_range(250.0..450.0),
            rng.gen_range(150.0..330.0),
        ));
        let bearing = camera().unproject(keypoint);
        let z = rng.gen_range(1.5..3.0);
        let feature = data.insert_candidate(keyframe, keypoint).unwrap();
        depths.insert(feature, z / bearing.z);
    }

    let matcher = Oracle {
        depths: depths.clone(),
        rng,
    };
    let mut filter = DepthFilter::new(matcher, Default::default(), SeedCounter::new());
    assert_eq!(filter.add_keyframe(&data, keyframe, 2.0, 1.0).unwrap(), 50);

    let mut converged = 0;
    for i in 1..=20 {
        let frame = data.insert_frame(pose_at(Vector3::new(0.02 * i as f64, 0.0, 0.0)), camera());
        let stats = filter.add_frame(&mut data, frame).unwrap();
        assert_eq!(stats.degenerate, 0);
        converged += stats.converged.len();
    }

    assert!(converged > 40, "only {} of 50 seeds converged", converged);
    for (feature, position) in data.positions() {
        let depth = depths[&feature];
        assert_relative_eq!(position.coords.norm(), depth, max_relative = 0.02);
    }
}

/// Looks up the true depth of the searched feature and adds up to 0.5% of noise.
struct Oracle {
    depths: HashMap<FeatureKey, f64>,
    rng: SmallRng,
}

impl<C> EpipolarMatcher<C> for Oracle {
    fn find_match(&mut self, search: &EpipolarSearch<'_, C>) -> Option<f64> {
        let depth = *self.depths.get(&search.feature_key)?;
        Some(depth * (1.0 + self.rng.gen_range(-0.005..=0.005)))
    }
}
