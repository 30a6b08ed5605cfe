//! Probabilistic depth estimation of candidate features for [Rust CV](https://github.com/rust-cv/).
//!
//! ## Depth filter
//!
//! A feature observed in a keyframe constrains its 3d point to a ray from the optical center of
//! that keyframe. When a later frame observes the same feature, the point must also lie on the
//! ray through the matched pixel, so the depth along the first ray can be triangulated. Matches
//! are noisy and some are wrong, so each feature gets a seed which models its inverse depth as
//! a mixture of a Gaussian (good matches) and a uniform distribution (outliers). Each new
//! measurement narrows the Gaussian until the depth is known well enough to place the point.
//!
//! - `p` the point being estimated
//! - `a` the feature in the keyframe A
//! - `b` the match found on the epipolar line of camera B
//! - `O` the optical center of a camera
//! - `@` the virtual image plane
//! - `z` the depth of `p` along the ray of `a`
//!
//! ```text
//!                          @
//!               p----------b---------O
//!              /           @
//!          z  /            @
//!            /             @
//!   @@@@@@@@a@@@@@@
//!          /
//!         O
//! ```
//!
//! The pixel noise of `b` becomes an uncertainty on `z` that shrinks as the baseline between
//! the cameras grows.

mod camera;
mod data;
mod error;
mod filter;
mod matcher;
mod seed;
mod settings;
mod uncertainty;

pub use camera::*;
pub use data::*;
pub use error::*;
pub use filter::*;
pub use matcher::*;
pub use seed::*;
pub use settings::*;
pub use uncertainty::*;

pub use cv_core;
pub use cv_pinhole;
