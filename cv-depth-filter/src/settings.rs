#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the depth filter.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DepthFilterSettings {
    /// The number of keyframes a seed may age before it is discarded
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_keyframe_age")
    )]
    pub max_keyframe_age: u64,
    /// A seed converges once its inverse depth standard deviation drops below `z_range` divided by this
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_convergence_sigma2_thresh")
    )]
    pub seed_convergence_sigma2_thresh: f64,
    /// The pixel noise of a match, converted into an angular error through the focal length
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pixel_noise"))]
    pub pixel_noise: f64,
    /// The number of pixels from the image border within which a seed is not considered visible
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_image_margin"))]
    pub image_margin: f64,
    /// The maximum number of epipolar searches to perform for one frame
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_updates_per_frame")
    )]
    pub max_updates_per_frame: Option<usize>,
    /// Log per-frame statistics at the info level instead of the debug level
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_verbose"))]
    pub verbose: bool,
}

impl Default for DepthFilterSettings {
    fn default() -> Self {
        Self {
            max_keyframe_age: default_max_keyframe_age(),
            seed_convergence_sigma2_thresh: default_seed_convergence_sigma2_thresh(),
            pixel_noise: default_pixel_noise(),
            image_margin: default_image_margin(),
            max_updates_per_frame: default_max_updates_per_frame(),
            verbose: default_verbose(),
        }
    }
}

impl DepthFilterSettings {
    /// Set the maximum seed age in keyframes.
    ///
    /// Default: `3`
    #[must_use]
    pub fn max_keyframe_age(self, max_keyframe_age: u64) -> Self {
        Self {
            max_keyframe_age,
            ..self
        }
    }

    /// Set the convergence threshold.
    ///
    /// The larger this value is the more accurate converged points will be, but seeds need more frames.
    ///
    /// Default: `200.0`
    #[must_use]
    pub fn seed_convergence_sigma2_thresh(self, seed_convergence_sigma2_thresh: f64) -> Self {
        Self {
            seed_convergence_sigma2_thresh,
            ..self
        }
    }

    /// Set the pixel noise of a match.
    ///
    /// Default: `1.0`
    #[must_use]
    pub fn pixel_noise(self, pixel_noise: f64) -> Self {
        Self {
            pixel_noise,
            ..self
        }
    }

    /// Set the image margin used by the visibility check.
    ///
    /// Default: `10.0`
    #[must_use]
    pub fn image_margin(self, image_margin: f64) -> Self {
        Self {
            image_margin,
            ..self
        }
    }

    /// Limit the number of epipolar searches per frame.
    ///
    /// Seeds that are skipped because of the limit are visited first on the next frame.
    ///
    /// Default: `None` (unlimited)
    #[must_use]
    pub fn max_updates_per_frame(self, max_updates_per_frame: Option<usize>) -> Self {
        Self {
            max_updates_per_frame,
            ..self
        }
    }

    #[must_use]
    pub fn verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }
}

fn default_max_keyframe_age() -> u64 {
    3
}

fn default_seed_convergence_sigma2_thresh() -> f64 {
    200.0
}

fn default_pixel_noise() -> f64 {
    1.0
}

fn default_image_margin() -> f64 {
    10.0
}

fn default_max_updates_per_frame() -> Option<usize> {
    None
}

fn default_verbose() -> bool {
    false
}
