use cv_core::nalgebra::Point3;
use cv_core::{KeyPoint, WorldToCamera};
use slotmap::{new_key_type, DenseSlotMap};

new_key_type! {
    pub struct FrameKey;
    pub struct FeatureKey;
}

/// A camera frame with a known pose.
#[derive(Debug, Clone)]
pub struct Frame<C> {
    /// Pose of the world relative to this camera
    pub pose: WorldToCamera,
    /// The camera model used to capture the frame
    pub camera: C,
    /// MapData::features indices of the candidate features extracted on this frame
    ///
    /// Only keyframes have candidates.
    pub candidates: Vec<FeatureKey>,
}

/// A candidate feature waiting for its depth to be estimated.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// The MapData::frames index of the frame the feature was first observed in
    pub frame: FrameKey,
    /// The pixel observation in that frame
    pub keypoint: KeyPoint,
    /// The world position, set once the depth of the feature has converged
    pub position: Option<Point3<f64>>,
}

impl Feature {
    /// Features with a position are already part of the map and do not need a seed.
    pub fn is_processed(&self) -> bool {
        self.position.is_some()
    }
}

/// Owns the frames and candidate features that seeds refer to.
#[derive(Debug, Clone)]
pub struct MapData<C> {
    frames: DenseSlotMap<FrameKey, Frame<C>>,
    features: DenseSlotMap<FeatureKey, Feature>,
}

impl<C> Default for MapData<C> {
    fn default() -> Self {
        Self {
            frames: Default::default(),
            features: Default::default(),
        }
    }
}

impl<C> MapData<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a frame with no candidate features.
    pub fn insert_frame(&mut self, pose: WorldToCamera, camera: C) -> FrameKey {
        self.frames.insert(Frame {
            pose,
            camera,
            candidates: vec![],
        })
    }

    /// Adds a candidate feature observed at `keypoint` in `frame`.
    ///
    /// Returns `None` if the frame does not exist.
    pub fn insert_candidate(&mut self, frame: FrameKey, keypoint: KeyPoint) -> Option<FeatureKey> {
        if !self.frames.contains_key(frame) {
            return None;
        }
        let feature = self.features.insert(Feature {
            frame,
            keypoint,
            position: None,
        });
        self.frames[frame].candidates.push(feature);
        Some(feature)
    }

    pub fn frame(&self, frame: FrameKey) -> Option<&Frame<C>> {
        self.frames.get(frame)
    }

    pub fn frame_mut(&mut self, frame: FrameKey) -> Option<&mut Frame<C>> {
        self.frames.get_mut(frame)
    }

    pub fn contains_frame(&self, frame: FrameKey) -> bool {
        self.frames.contains_key(frame)
    }

    /// Replaces the pose of a frame, as done after pose refinement.
    ///
    /// Returns `false` if the frame does not exist.
    pub fn set_pose(&mut self, frame: FrameKey, pose: WorldToCamera) -> bool {
        if let Some(frame) = self.frames.get_mut(frame) {
            frame.pose = pose;
            true
        } else {
            false
        }
    }

    /// Removes a frame along with every candidate feature that was observed in it.
    pub fn remove_frame(&mut self, frame: FrameKey) -> Option<Frame<C>> {
        let removed = self.frames.remove(frame)?;
        for &feature in &removed.candidates {
            self.features.remove(feature);
        }
        Some(removed)
    }

    pub fn frames(&self) -> impl Iterator<Item = (FrameKey, &Frame<C>)> + '_ {
        self.frames.iter()
    }

    pub fn feature(&self, feature: FeatureKey) -> Option<&Feature> {
        self.features.get(feature)
    }

    pub fn feature_mut(&mut self, feature: FeatureKey) -> Option<&mut Feature> {
        self.features.get_mut(feature)
    }

    pub fn features(&self) -> impl Iterator<Item = (FeatureKey, &Feature)> + '_ {
        self.features.iter()
    }

    /// Iterates over the world positions of every converged feature.
    pub fn positions(&self) -> impl Iterator<Item = (FeatureKey, Point3<f64>)> + '_ {
        self.features
            .iter()
            .filter_map(|(key, feature)| feature.position.map(|position| (key, position)))
    }
}
