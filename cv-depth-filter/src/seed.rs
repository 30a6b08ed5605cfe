use crate::{FeatureKey, FrameKey};
use core::f64::consts::PI;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The Beta-Gaussian mixture that models the inverse depth of a seed.
///
/// With probability `a / (a + b)` a measurement is an inlier drawn from
/// `Normal(mu, sigma2 + tau2)`, otherwise it is an outlier drawn from
/// `Uniform(0, z_range)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SeedState {
    /// Beta distribution parameter counting inlier evidence
    pub a: f64,
    /// Beta distribution parameter counting outlier evidence
    pub b: f64,
    /// Mean of the inverse depth
    pub mu: f64,
    /// Variance of the inverse depth
    pub sigma2: f64,
    /// Largest inverse depth that can be measured
    pub z_range: f64,
}

impl SeedState {
    /// Creates the prior for a seed from the mean and minimum depth of the scene.
    ///
    /// ```
    /// use cv_depth_filter::SeedState;
    ///
    /// let state = SeedState::from_depth_prior(2.0, 0.5);
    /// assert_eq!(state.mu, 0.5);
    /// assert_eq!(state.z_range, 2.0);
    /// assert!((state.sigma2 - 4.0 / 36.0).abs() < 1e-12);
    /// assert_eq!((state.a, state.b), (10.0, 10.0));
    /// ```
    pub fn from_depth_prior(depth_mean: f64, depth_min: f64) -> Self {
        let z_range = depth_min.recip();
        Self {
            a: 10.0,
            b: 10.0,
            mu: depth_mean.recip(),
            sigma2: z_range * z_range / 36.0,
            z_range,
        }
    }

    /// Checks `sigma2 > 0`, `a > 0`, `b > 0`, `mu > 0` and that everything is finite.
    pub fn is_valid(&self) -> bool {
        let finite = [self.a, self.b, self.mu, self.sigma2, self.z_range]
            .iter()
            .all(|n| n.is_finite());
        finite && self.a > 0.0 && self.b > 0.0 && self.mu > 0.0 && self.sigma2 > 0.0
    }

    /// The probability that the next measurement is an inlier.
    pub fn inlier_ratio(&self) -> f64 {
        self.a / (self.a + self.b)
    }

    /// Checks if the standard deviation has shrunk below `z_range / threshold`.
    pub fn has_converged(&self, threshold: f64) -> bool {
        self.sigma2.sqrt() < self.z_range / threshold
    }
}

/// A depth hypothesis for a candidate feature.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Seed {
    /// The generation of the keyframe that created this seed
    pub batch: u64,
    /// Unique id of the seed
    pub id: u64,
    /// MapData::features index of the feature the seed estimates the depth of
    pub feature: FeatureKey,
    /// MapData::frames index of the keyframe the feature was first observed in
    pub frame: FrameKey,
    pub state: SeedState,
}

impl Seed {
    /// The number of keyframe generations that passed since this seed was created.
    pub fn age(&self, current_batch: u64) -> u64 {
        current_batch.saturating_sub(self.batch)
    }
}

/// Allocates seed ids and keyframe generations.
///
/// Each [`DepthFilter`](crate::DepthFilter) owns one, so independent filters never share counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SeedCounter {
    batch: u64,
    next_id: u64,
}

impl SeedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current keyframe generation.
    pub fn batch(&self) -> u64 {
        self.batch
    }

    /// Starts a new keyframe generation and returns it.
    pub fn next_batch(&mut self) -> u64 {
        self.batch += 1;
        self.batch
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Brings the counter back to the state it was created in.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Creates a seed in the current generation.
    pub fn seed(&mut self, feature: FeatureKey, frame: FrameKey, state: SeedState) -> Seed {
        Seed {
            batch: self.batch,
            id: self.next_id(),
            feature,
            frame,
            state,
        }
    }
}

fn normal_pdf(x: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (x - mean) / std_dev;
    (-0.5 * z * z).exp() / (std_dev * (2.0 * PI).sqrt())
}

/// Fuses an inverse depth measurement `x` with variance `tau2` into a seed.
///
/// This returns the whole new state so it can replace the old one at once. `None` is
/// returned when the update is numerically degenerate, in which case the seed should be
/// left as it was.
///
/// ```
/// use cv_depth_filter::{update_seed, SeedState};
///
/// let mut state = SeedState::from_depth_prior(2.0, 0.5);
/// let prior = state;
/// state = update_seed(&state, 0.5, 1e-4).unwrap();
/// assert!(state.sigma2 < prior.sigma2);
/// assert!(state.inlier_ratio() > prior.inlier_ratio());
/// ```
pub fn update_seed(state: &SeedState, x: f64, tau2: f64) -> Option<SeedState> {
    let &SeedState {
        a,
        b,
        mu,
        sigma2,
        z_range,
    } = state;

    let norm_scale = (sigma2 + tau2).sqrt();
    if !norm_scale.is_finite() {
        return None;
    }

    // Gaussian product of the prior and the measurement.
    let s2 = (sigma2.recip() + tau2.recip()).recip();
    let m = s2 * (mu / sigma2 + x / tau2);

    // Posterior weights of the inlier and outlier hypotheses.
    let mut c1 = a / (a + b) * normal_pdf(x, mu, norm_scale);
    let mut c2 = b / (a + b) * z_range.recip();
    let normalization = c1 + c2;
    if !(normalization > 0.0 && normalization.is_finite()) {
        return None;
    }
    c1 /= normalization;
    c2 /= normalization;

    // First and second moments of the inlier ratio.
    let ab1 = a + b + 1.0;
    let ab2 = a + b + 2.0;
    let f = c1 * (a + 1.0) / ab1 + c2 * a / ab1;
    let e = c1 * (a + 1.0) * (a + 2.0) / (ab1 * ab2) + c2 * a * (a + 1.0) / (ab1 * ab2);

    let mu_new = c1 * m + c2 * mu;
    let sigma2_new = c1 * (s2 + m * m) + c2 * (sigma2 + mu * mu) - mu_new * mu_new;

    // Moment matching of the Beta distribution, singular when f^2 = e.
    let denominator = f - e / f;
    if denominator == 0.0 {
        return None;
    }
    let a_new = (e - f) / denominator;
    let b_new = a_new * (1.0 - f) / f;

    let updated = SeedState {
        a: a_new,
        b: b_new,
        mu: mu_new,
        sigma2: sigma2_new,
        z_range,
    };
    updated.is_valid().then(|| updated)
}
