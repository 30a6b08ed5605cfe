use anyhow::{ensure, Context, Result};
use cv_core::nalgebra::{Point2, Point3, Rotation3, Vector2, Vector3};
use cv_core::{KeyPoint, Pose, WorldToCamera};
use cv_depth_filter::{
    Camera, DepthFilter, DepthFilterSettings, EpipolarMatcher, EpipolarSearch, FeatureKey,
    MapData, PinholeCamera, SeedCounter,
};
use cv_pinhole::CameraIntrinsics;
use log::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "depth-filter-sandbox",
    about = "A tool for testing the depth filter on synthetic scenes"
)]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_depth_filter::DepthFilterSettings`.
    #[structopt(short, long, default_value = "depth-filter-settings.json")]
    settings: PathBuf,
    /// The seed of the random number generator
    #[structopt(long, default_value = "5")]
    rng_seed: u64,
    /// The number of points in the scene
    #[structopt(short, long, default_value = "500")]
    points: usize,
    /// The number of frames that follow the keyframe
    #[structopt(short, long, default_value = "30")]
    frames: usize,
    /// The distance the camera moves to the right each frame
    #[structopt(long, default_value = "0.02")]
    baseline: f64,
    /// The nearest depth of a point
    #[structopt(long, default_value = "1.0")]
    min_depth: f64,
    /// The farthest depth of a point
    #[structopt(long, default_value = "4.0")]
    max_depth: f64,
    /// The relative noise of a correct match
    #[structopt(long, default_value = "0.005")]
    noise: f64,
    /// The probability that a match lands anywhere in the search range
    #[structopt(long, default_value = "0.05")]
    outlier_ratio: f64,
    /// The probability that no match is found
    #[structopt(long, default_value = "0.05")]
    miss_ratio: f64,
    /// The x focal length
    #[structopt(long, default_value = "500.0")]
    x_focal: f64,
    /// The y focal length
    #[structopt(long, default_value = "500.0")]
    y_focal: f64,
    /// The image width
    #[structopt(long, default_value = "640")]
    width: u32,
    /// The image height
    #[structopt(long, default_value = "480")]
    height: u32,
    /// Output JSON file to deposit the converged points
    #[structopt(short, long)]
    output: Option<PathBuf>,
}

/// Reports the true depth of a feature, corrupted the way a patch matcher would be.
struct NoisyOracle {
    depths: HashMap<FeatureKey, f64>,
    rng: Xoshiro256PlusPlus,
    noise: f64,
    outlier_ratio: f64,
    miss_ratio: f64,
    max_depth: f64,
}

impl<C> EpipolarMatcher<C> for NoisyOracle {
    fn find_match(&mut self, search: &EpipolarSearch<'_, C>) -> Option<f64> {
        let depth = *self.depths.get(&search.feature_key)?;
        if self.rng.gen_bool(self.miss_ratio) {
            return None;
        }
        if self.rng.gen_bool(self.outlier_ratio) {
            let far = search.depth_max.min(self.max_depth);
            if far <= search.depth_min {
                return None;
            }
            return Some(self.rng.gen_range(search.depth_min..far));
        }
        Some(depth * (1.0 + self.rng.gen_range(-self.noise..=self.noise)))
    }
}

#[derive(Serialize)]
struct ConvergedPoint {
    estimate: [f64; 3],
    truth: [f64; 3],
    relative_error: f64,
}

fn main() -> Result<()> {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    ensure!(
        (0.0..=1.0).contains(&opt.outlier_ratio) && (0.0..=1.0).contains(&opt.miss_ratio),
        "outlier and miss ratios must be probabilities"
    );
    ensure!(
        0.0 < opt.min_depth && opt.min_depth < opt.max_depth,
        "depth range must be positive and non-empty"
    );
    ensure!(opt.noise >= 0.0, "noise must not be negative");

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: DepthFilterSettings = settings.unwrap_or_default();

    let intrinsics = CameraIntrinsics {
        focals: Vector2::new(opt.x_focal, opt.y_focal),
        principal_point: Point2::new(
            opt.width as f64 / 2.0 - 0.5,
            opt.height as f64 / 2.0 - 0.5,
        ),
        skew: 0.0,
    };
    let camera = PinholeCamera::new(intrinsics, opt.width, opt.height);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(opt.rng_seed);

    // The keyframe sits at the world origin, so its camera space is world space.
    let mut data = MapData::new();
    let keyframe = data.insert_frame(WorldToCamera::identity(), camera);
    let mut depths = HashMap::new();
    let mut truths = HashMap::new();
    for _ in 0..opt.points {
        let keypoint = KeyPoint(Point2::new(
            rng.gen_range(0.0..opt.width as f64),
            rng.gen_range(0.0..opt.height as f64),
        ));
        let bearing = camera.unproject(keypoint);
        let depth = rng.gen_range(opt.min_depth..opt.max_depth) / bearing.z;
        let feature = data
            .insert_candidate(keyframe, keypoint)
            .context("keyframe missing from map data")?;
        depths.insert(feature, depth);
        truths.insert(feature, Point3::from(bearing.into_inner() * depth));
    }

    let matcher = NoisyOracle {
        depths,
        rng: Xoshiro256PlusPlus::seed_from_u64(opt.rng_seed.wrapping_add(1)),
        noise: opt.noise,
        outlier_ratio: opt.outlier_ratio,
        miss_ratio: opt.miss_ratio,
        max_depth: opt.max_depth * 2.0,
    };
    let mut filter = DepthFilter::new(matcher, settings, SeedCounter::new());
    let depth_mean = 0.5 * (opt.min_depth + opt.max_depth);
    let seeds = filter.add_keyframe(&data, keyframe, depth_mean, opt.min_depth)?;
    info!("created {} seeds", seeds);

    for i in 1..=opt.frames {
        let center = Vector3::new(opt.baseline * i as f64, 0.0, 0.0);
        let frame = data.insert_frame(
            WorldToCamera::from_parts(-center, Rotation3::identity()),
            camera,
        );
        let stats = filter.add_frame(&mut data, frame)?;
        info!(
            "frame {}: {} updates, {} failed matches, {} deferred, {} converged, {} remaining",
            i,
            stats.updates,
            stats.failed_matches,
            stats.deferred + stats.budget_deferred,
            stats.converged.len(),
            stats.remaining()
        );
        if filter.seeds().is_empty() {
            info!("no seeds left after {} frames", i);
            break;
        }
    }

    let converged: Vec<ConvergedPoint> = data
        .positions()
        .filter_map(|(feature, estimate)| {
            let truth = truths.get(&feature)?;
            Some(ConvergedPoint {
                estimate: estimate.coords.into(),
                truth: truth.coords.into(),
                relative_error: (estimate - truth).norm() / truth.coords.norm(),
            })
        })
        .collect();

    if converged.is_empty() {
        warn!("no seeds converged");
    } else {
        let mean_error = converged
            .iter()
            .map(|point| point.relative_error)
            .sum::<f64>()
            / converged.len() as f64;
        info!(
            "{} of {} points converged with a mean relative error of {:.4}",
            converged.len(),
            opt.points,
            mean_error
        );
    }

    if let Some(path) = opt.output {
        info!("exporting converged points to {}", path.display());
        let file = std::fs::File::create(&path)
            .with_context(|| format!("unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &converged).context("unable to write points")?;
    }

    Ok(())
}
