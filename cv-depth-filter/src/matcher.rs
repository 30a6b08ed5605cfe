use crate::{Feature, FeatureKey, Frame};

/// A one-dimensional search for a feature along the epipolar line in another frame.
///
/// All depths are distances along the bearing of the feature in the origin frame.
#[derive(Debug)]
pub struct EpipolarSearch<'a, C> {
    /// The frame the feature was first observed in, which holds its reference patch
    pub origin: &'a Frame<C>,
    /// The frame to search in
    pub search: &'a Frame<C>,
    /// The MapData::features index of the feature being searched for
    pub feature_key: FeatureKey,
    /// The feature being searched for
    pub feature: &'a Feature,
    /// The current best estimate of the depth
    pub depth_estimate: f64,
    /// The near end of the depth interval to search
    pub depth_min: f64,
    /// The far end of the depth interval to search
    pub depth_max: f64,
}

/// Resolves an [`EpipolarSearch`] into a depth measurement.
///
/// Implementations typically slide the reference patch along the segment of the epipolar
/// line spanned by `depth_min..depth_max`, refine the best match to sub-pixel accuracy, and
/// triangulate the depth from it. The depth filter only relies on the contract: return the
/// matched depth, or `None` if no acceptable correspondence was found.
pub trait EpipolarMatcher<C> {
    fn find_match(&mut self, search: &EpipolarSearch<'_, C>) -> Option<f64>;
}

impl<C, M> EpipolarMatcher<C> for &mut M
where
    M: EpipolarMatcher<C> + ?Sized,
{
    fn find_match(&mut self, search: &EpipolarSearch<'_, C>) -> Option<f64> {
        (**self).find_match(search)
    }
}
