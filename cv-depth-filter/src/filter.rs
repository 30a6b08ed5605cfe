use crate::{
    compute_tau, inverse_depth_deviation, pixel_error_angle, update_seed, Camera,
    DepthFilterError, DepthFilterSettings, EpipolarMatcher, EpipolarSearch, FeatureKey, Frame,
    FrameKey, MapData, Result, Seed, SeedCounter, SeedState,
};
use cv_core::nalgebra::Point3;
use cv_core::CameraToCamera;
use log::*;
use std::collections::VecDeque;

/// Number of recent frames kept in the frame queue.
const FRAME_QUEUE_CAPACITY: usize = 2;
/// Smallest inverse depth used as the far end of the search range.
const MIN_INVERSE_DEPTH: f64 = 0.00000001;

/// The keyframe most recently registered through [`DepthFilter::add_keyframe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewKeyframe {
    pub frame: FrameKey,
    pub depth_mean: f64,
    pub depth_min: f64,
}

/// What happened during one sweep over the seeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    /// Seeds present when the sweep started
    pub visited: usize,
    /// Epipolar searches performed
    pub searches: usize,
    /// Measurements fused into a seed
    pub updates: usize,
    /// Searches that found no match
    pub failed_matches: usize,
    /// Seeds that could not be observed in the frame
    pub deferred: usize,
    /// Seeds skipped because `max_updates_per_frame` was reached
    pub budget_deferred: usize,
    /// Features whose position was published during this sweep
    pub converged: Vec<FeatureKey>,
    /// Seeds removed for being older than `max_keyframe_age`
    pub expired: usize,
    /// Seeds removed because of numerical or bookkeeping problems
    pub degenerate: usize,
}

impl UpdateStats {
    /// The number of seeds still alive after the sweep.
    pub fn remaining(&self) -> usize {
        self.visited - self.converged.len() - self.expired - self.degenerate
    }
}

enum SeedOutcome {
    Expired,
    Orphaned,
    NotVisible,
    OverBudget,
    MatchFailed,
    Skipped,
    Updated,
    Converged(Point3<f64>),
    Degenerate,
}

/// Estimates the depth of candidate features by fusing epipolar matches from many frames.
///
/// Every candidate feature on a keyframe gets a [`Seed`], a probabilistic estimate of its inverse
/// depth. Each frame added afterwards is searched for every visible seed and the resulting
/// measurement refines it. Once the uncertainty of a seed is small enough the world position of
/// its feature is written into [`MapData`] and the seed is retired.
#[derive(Debug)]
pub struct DepthFilter<M> {
    matcher: M,
    settings: DepthFilterSettings,
    seeds: Vec<Seed>,
    frame_queue: VecDeque<FrameKey>,
    counter: SeedCounter,
    new_keyframe: Option<NewKeyframe>,
}

impl<M> DepthFilter<M> {
    pub fn new(matcher: M, settings: DepthFilterSettings, counter: SeedCounter) -> Self {
        Self {
            matcher,
            settings,
            seeds: vec![],
            frame_queue: VecDeque::with_capacity(FRAME_QUEUE_CAPACITY + 1),
            counter,
            new_keyframe: None,
        }
    }

    pub fn settings(&self) -> &DepthFilterSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut DepthFilterSettings {
        &mut self.settings
    }

    pub fn counter(&self) -> &SeedCounter {
        &self.counter
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    pub fn matcher_mut(&mut self) -> &mut M {
        &mut self.matcher
    }

    pub fn into_matcher(self) -> M {
        self.matcher
    }

    /// Starts estimating the depth of every unprocessed candidate feature of `frame`.
    ///
    /// This opens a new keyframe generation, so seeds that are now older than
    /// `max_keyframe_age` generations are dropped. Returns the number of seeds created.
    pub fn add_keyframe<C>(
        &mut self,
        data: &MapData<C>,
        frame: FrameKey,
        depth_mean: f64,
        depth_min: f64,
    ) -> Result<usize> {
        let keyframe = data
            .frame(frame)
            .ok_or(DepthFilterError::UnknownFrame(frame))?;
        let valid = |n: f64| n.is_finite() && n > 0.0;
        let state = SeedState::from_depth_prior(depth_mean, depth_min);
        // Tiny minimum depths overflow the prior variance.
        if !valid(depth_mean) || !valid(depth_min) || !state.is_valid() {
            return Err(DepthFilterError::InvalidDepthPrior {
                mean: depth_mean,
                min: depth_min,
            });
        }

        self.new_keyframe = Some(NewKeyframe {
            frame,
            depth_mean,
            depth_min,
        });

        let batch = self.counter.next_batch();
        let max_age = self.settings.max_keyframe_age;
        let before = self.seeds.len();
        self.seeds.retain(|seed| seed.age(batch) <= max_age);
        let expired = before - self.seeds.len();
        if expired != 0 {
            debug!("{} seeds expired when opening generation {}", expired, batch);
        }

        let mut created = 0;
        for &feature in &keyframe.candidates {
            if data.feature(feature).map_or(true, |f| f.is_processed()) {
                continue;
            }
            self.seeds.push(self.counter.seed(feature, frame, state));
            created += 1;
        }

        if self.settings.verbose {
            info!(
                "depth filter initialized {} seeds, {} seeds in total",
                created,
                self.seeds.len()
            );
        } else {
            debug!(
                "depth filter initialized {} seeds, {} seeds in total",
                created,
                self.seeds.len()
            );
        }
        Ok(created)
    }

    /// Drops every seed that originates from `frame`, returning how many were dropped.
    pub fn remove_keyframe(&mut self, frame: FrameKey) -> usize {
        let before = self.seeds.len();
        self.seeds.retain(|seed| seed.frame != frame);
        let removed = before - self.seeds.len();
        info!("removed {} seeds", removed);
        removed
    }

    /// Forgets the recently added frames.
    pub fn clear_frame_queue(&mut self) {
        self.frame_queue.clear();
    }

    /// The recently added frames, oldest first.
    pub fn frame_queue(&self) -> impl Iterator<Item = FrameKey> + '_ {
        self.frame_queue.iter().copied()
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    /// Clones the seeds that were created on the keyframe `frame`.
    pub fn seeds_from(&self, frame: FrameKey) -> Vec<Seed> {
        self.seeds
            .iter()
            .filter(|seed| seed.frame == frame)
            .copied()
            .collect()
    }

    /// Takes the keyframe registered since the last call, if any.
    pub fn take_new_keyframe(&mut self) -> Option<NewKeyframe> {
        self.new_keyframe.take()
    }

    /// Drops all seeds and queued frames and resets the seed counter.
    pub fn reset(&mut self) {
        self.seeds.clear();
        self.frame_queue.clear();
        self.new_keyframe = None;
        self.counter.reset();
        info!("depth filter reset");
    }

    /// Queues `frame` as a recent frame and updates the seeds with it.
    pub fn add_frame<C>(&mut self, data: &mut MapData<C>, frame: FrameKey) -> Result<UpdateStats>
    where
        C: Camera,
        M: EpipolarMatcher<C>,
    {
        if !data.contains_frame(frame) {
            return Err(DepthFilterError::UnknownFrame(frame));
        }
        self.frame_queue.push_back(frame);
        while self.frame_queue.len() > FRAME_QUEUE_CAPACITY {
            self.frame_queue.pop_front();
        }
        self.update_seeds(data, frame)
    }

    /// Refines every live seed with a measurement from `frame`.
    ///
    /// Converged seeds write their world position into the feature they were created for.
    pub fn update_seeds<C>(
        &mut self,
        data: &mut MapData<C>,
        frame: FrameKey,
    ) -> Result<UpdateStats>
    where
        C: Camera,
        M: EpipolarMatcher<C>,
    {
        let current = data
            .frame(frame)
            .ok_or(DepthFilterError::UnknownFrame(frame))?;
        let batch = self.counter.batch();
        let seeds = std::mem::take(&mut self.seeds);

        let mut stats = UpdateStats {
            visited: seeds.len(),
            ..Default::default()
        };
        let mut budget_deferred = vec![];
        let mut survivors = Vec::with_capacity(seeds.len());
        let mut positions = vec![];

        for mut seed in seeds {
            let within_budget = self
                .settings
                .max_updates_per_frame
                .map_or(true, |max| stats.searches < max);
            match self.process_seed(data, frame, current, &mut seed, batch, within_budget) {
                SeedOutcome::Expired => {
                    trace!("seed {} expired", seed.id);
                    stats.expired += 1;
                }
                SeedOutcome::Orphaned => {
                    trace!("seed {} lost its frame or feature", seed.id);
                    stats.degenerate += 1;
                }
                SeedOutcome::Degenerate => {
                    trace!("seed {} became degenerate", seed.id);
                    stats.searches += 1;
                    stats.degenerate += 1;
                }
                SeedOutcome::Converged(position) => {
                    trace!("seed {} converged at {:?}", seed.id, position);
                    stats.searches += 1;
                    stats.updates += 1;
                    stats.converged.push(seed.feature);
                    positions.push((seed.feature, position));
                }
                SeedOutcome::NotVisible => {
                    stats.deferred += 1;
                    survivors.push(seed);
                }
                SeedOutcome::OverBudget => {
                    stats.budget_deferred += 1;
                    budget_deferred.push(seed);
                }
                SeedOutcome::MatchFailed => {
                    stats.searches += 1;
                    stats.failed_matches += 1;
                    survivors.push(seed);
                }
                SeedOutcome::Skipped => {
                    stats.searches += 1;
                    survivors.push(seed);
                }
                SeedOutcome::Updated => {
                    stats.searches += 1;
                    stats.updates += 1;
                    survivors.push(seed);
                }
            }
        }

        // Seeds that missed out on the budget go first next time.
        budget_deferred.append(&mut survivors);
        self.seeds = budget_deferred;

        for (feature, position) in positions {
            if let Some(feature) = data.feature_mut(feature) {
                feature.position = Some(position);
            }
        }

        if self.settings.verbose {
            info!(
                "depth filter: {} seeds, {} updates, {} failed matches, {} converged",
                stats.visited,
                stats.updates,
                stats.failed_matches,
                stats.converged.len()
            );
        } else {
            debug!("depth filter sweep: {:?}", stats);
        }
        Ok(stats)
    }

    fn process_seed<C>(
        &mut self,
        data: &MapData<C>,
        frame: FrameKey,
        current: &Frame<C>,
        seed: &mut Seed,
        batch: u64,
        within_budget: bool,
    ) -> SeedOutcome
    where
        C: Camera,
        M: EpipolarMatcher<C>,
    {
        if seed.age(batch) > self.settings.max_keyframe_age {
            return SeedOutcome::Expired;
        }
        let (origin, feature) = match (data.frame(seed.frame), data.feature(seed.feature)) {
            (Some(origin), Some(feature)) => (origin, feature),
            _ => return SeedOutcome::Orphaned,
        };
        // A keyframe has no baseline to itself.
        if seed.frame == frame {
            return SeedOutcome::NotVisible;
        }
        if !within_budget {
            return SeedOutcome::OverBudget;
        }

        let SeedState { mu, sigma2, .. } = seed.state;
        let origin_to_current = current.pose.0 * origin.pose.0.inverse();
        let bearing = origin.camera.unproject(feature.keypoint);
        let hypothesis = Point3::from(bearing.into_inner() / mu);

        let in_current = origin_to_current * hypothesis;
        if in_current.z <= 0.0 {
            return SeedOutcome::NotVisible;
        }
        let visible = current
            .camera
            .project(&in_current)
            .map_or(false, |keypoint| {
                current.camera.in_bounds(keypoint, self.settings.image_margin)
            });
        if !visible {
            return SeedOutcome::NotVisible;
        }

        // Search range in inverse depth, the far end clamped before going to infinity.
        let sigma = sigma2.sqrt();
        let inverse_depth_near = mu + sigma;
        let inverse_depth_far = (mu - sigma).max(MIN_INVERSE_DEPTH);

        let search = EpipolarSearch {
            origin,
            search: current,
            feature_key: seed.feature,
            feature,
            depth_estimate: mu.recip(),
            depth_min: inverse_depth_near.recip(),
            depth_max: inverse_depth_far.recip(),
        };
        let depth = match self.matcher.find_match(&search) {
            Some(depth) if depth.is_finite() && depth > 0.0 => depth,
            _ => {
                seed.state.b += 1.0;
                return SeedOutcome::MatchFailed;
            }
        };

        let px_error_angle =
            pixel_error_angle(self.settings.pixel_noise, current.camera.focal_length());
        let current_to_origin = CameraToCamera(origin_to_current.inverse());
        let tau = compute_tau(current_to_origin, &bearing, depth, px_error_angle);
        let tau_inverse = inverse_depth_deviation(depth, tau);
        // A non-positive tau means the perturbed rays no longer intersect.
        if !(tau > 0.0 && tau_inverse.is_finite()) {
            return SeedOutcome::Degenerate;
        }

        let state = match update_seed(&seed.state, depth.recip(), tau_inverse * tau_inverse) {
            Some(state) => state,
            None => return SeedOutcome::Skipped,
        };
        seed.state = state;

        if state.has_converged(self.settings.seed_convergence_sigma2_thresh) {
            let in_origin = Point3::from(bearing.into_inner() / state.mu);
            SeedOutcome::Converged(origin.pose.0.inverse() * in_origin)
        } else if !inverse_depth_near.is_finite() {
            SeedOutcome::Degenerate
        } else {
            SeedOutcome::Updated
        }
    }
}
