//! # Window scheduler
//!
//! Keeps the number of active plus linearized cameras at or below the target
//! window size by retiring one camera per iteration.
//!
//! ## Victim selection
//!
//! 1. **Starvation**: scanning oldest first, a camera is retired when too few of
//!    the points it stores are still seen by the newest frame, or when it stores
//!    too few points at all. This rule applies even when the window already fits.
//! 2. **Isolation**: otherwise, if the window is too large, the camera maximizing
//!    `Σ 1/(ε + d(c, c')) · d(c, newest)^¼` over the other eligible cameras `c'`.
//!
//! The newest `num_protected_newest` cameras are never retired.
//!
//! ## Retirement (points first)
//!
//! Observations at the victim of points still seen by a protected camera, or
//! flagged as bad, are dropped. Every other point of the victim is eliminated
//! against its (now linearized) observing cameras, then the victim itself is
//! eliminated. Points left without any surviving observation, and eligible
//! cameras that lose their last observation during the retirement, are retired
//! without elimination; the prior forgets them on the next re-basing. A camera
//! that enters the window without observations is never retired this way: the
//! bundle build rejects it.
//!
//! ## Retirement (cameras only)
//!
//! Approximate mode: the victim is eliminated against its points, which stay in
//! the window until no surviving observation is left, at which point they are
//! abandoned without an explicit elimination against their own factors.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::debug;

use crate::bundle::{BundleError, GlobalBundle};
use crate::config::{BundleConfig, MarginalizationTarget, SchedulerConfig, WindowConfig};
use crate::core::frames::{CameraTime, PointId, PointObservation};
use crate::core::ledger::{LedgerError, LifecycleState};
use crate::core::window::WindowState;
use crate::logger::log_step;
use crate::marginalization::{MarginalizationError, MarginalizationIds, MarginalizingBias};

/// Regularizer of the inverse camera distances in the isolation score
const ISOLATION_EPSILON: f64 = 1e-6;

/// Scheduler specific error types
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("Window target {target} is unreachable: no camera of the {window} in the window can be retired")]
    UnreachableWindowTarget { target: usize, window: usize },
    #[error("Retiring camera at time {time} did not shrink the window of {window} cameras")]
    NoProgress { time: CameraTime, window: usize },
    #[error("Camera at time {0} is not in the window")]
    NotInWindow(CameraTime),
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Marginalization(#[from] MarginalizationError),
}

#[derive(Debug, Clone)]
pub struct MarginalizationScheduler {
    config: SchedulerConfig,
    bundle_config: BundleConfig,
    bias: MarginalizingBias,
}

impl MarginalizationScheduler {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            config: config.scheduler.clone(),
            bundle_config: config.bundle.clone(),
            bias: MarginalizingBias::new(config.damping),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn bundle_config(&self) -> &BundleConfig {
        &self.bundle_config
    }

    /// Prior accumulated by every retirement so far
    pub fn bias(&self) -> &MarginalizingBias {
        &self.bias
    }

    /// Shrink the window if `marginalize` is set, then build the bundle of the
    /// remaining unknowns with the prior re-based onto its columns.
    pub fn global_bundle(
        &mut self,
        state: &mut WindowState,
        marginalize: bool,
    ) -> Result<GlobalBundle, SchedulerError> {
        if marginalize {
            self.validate(state)?;
            self.abandon_orphans(state, &BTreeSet::new())?;
            loop {
                let window = state.cameras.num_unmarginalized();
                let victim = match self.find_starved_camera(state) {
                    Some(time) => time,
                    None if window <= self.config.target_window_size => break,
                    None => self.find_isolated_camera(state).ok_or(
                        SchedulerError::UnreachableWindowTarget {
                            target: self.config.target_window_size,
                            window,
                        },
                    )?,
                };
                self.retire_camera(state, victim)?;
                if state.cameras.num_unmarginalized() >= window {
                    return Err(SchedulerError::NoProgress { time: victim, window });
                }
            }
        }
        self.build(state)
    }

    fn validate(&self, state: &WindowState) -> Result<(), SchedulerError> {
        if self.config.target_window_size < self.config.num_protected_newest {
            return Err(SchedulerError::UnreachableWindowTarget {
                target: self.config.target_window_size,
                window: state.cameras.num_unmarginalized(),
            });
        }
        if !(0.0..=1.0).contains(&self.config.min_visible_fraction) {
            return Err(SchedulerError::InvalidConfig(format!(
                "min_visible_fraction {} outside [0, 1]",
                self.config.min_visible_fraction
            )));
        }
        Ok(())
    }

    /// Build the bundle of the current keep-set and re-base the prior onto it.
    fn build(&mut self, state: &mut WindowState) -> Result<GlobalBundle, SchedulerError> {
        let (inputs, registry) = state.bundle_inputs();
        let mut bundle = GlobalBundle::new(&self.bundle_config, &inputs, registry)?;
        bundle.copy_in(&inputs)?;
        self.bias.update_indices(bundle.predictor_uuids())?;
        Ok(bundle)
    }

    /// Non-marginalized cameras split into (eligible, protected), oldest first
    fn partition_cameras(&self, state: &WindowState) -> (Vec<CameraTime>, Vec<CameraTime>) {
        let mut eligible = state.cameras.unmarginalized_keys();
        let split = eligible.len().saturating_sub(self.config.num_protected_newest);
        let protected = eligible.split_off(split);
        (eligible, protected)
    }

    /// Oldest eligible camera whose stored points have mostly left the newest frame
    pub fn find_starved_camera(&self, state: &WindowState) -> Option<CameraTime> {
        let newest = *state.cameras.unmarginalized_keys().last()?;
        let (eligible, _) = self.partition_cameras(state);
        eligible.into_iter().find(|&time| {
            let mut stored = 0usize;
            let mut existing = 0usize;
            for point in state.observations.frame(time).into_iter().flat_map(|frame| frame.keys()) {
                match state.points.state(point) {
                    None => continue,
                    Some(point_state) => {
                        stored += 1;
                        if point_state != LifecycleState::Marginalized
                            && state.observations.is_observed_at(newest, *point)
                        {
                            existing += 1;
                        }
                    }
                }
            }
            let starved = stored < self.config.min_stored_points
                || (existing as f64) < self.config.min_visible_fraction * stored as f64;
            if starved {
                log_step!(
                    self.config.verbose,
                    "Camera at time {time} is starved: {existing} of {stored} stored points visible in newest frame {newest}"
                );
            }
            starved
        })
    }

    /// Eligible camera with the highest isolation score
    pub fn find_isolated_camera(&self, state: &WindowState) -> Option<CameraTime> {
        let newest = state.cameras.get(state.cameras.unmarginalized_keys().last()?)?.center();
        let (eligible, _) = self.partition_cameras(state);
        let centers: Vec<_> = eligible
            .iter()
            .filter_map(|time| state.cameras.get(time).map(|frame| (*time, frame.center())))
            .collect();

        let mut best: Option<(CameraTime, f64)> = None;
        for (time, center) in &centers {
            let crowding: f64 = centers
                .iter()
                .filter(|(other, _)| other != time)
                .map(|(_, other)| 1.0 / (ISOLATION_EPSILON + (center - other).norm()))
                .sum();
            let score = crowding * (center - newest).norm().sqrt().sqrt();
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((*time, score));
            }
        }
        if let Some((time, score)) = best {
            log_step!(
                self.config.verbose,
                "Camera at time {time} selected by isolation score {score:.4}"
            );
        }
        best.map(|(time, _)| time)
    }

    /// Retire one camera under the configured policy.
    pub fn retire_camera(&mut self, state: &mut WindowState, time: CameraTime) -> Result<(), SchedulerError> {
        let was_linearized = match state.cameras.state(&time) {
            Some(LifecycleState::Active) => false,
            Some(LifecycleState::Linearized) => true,
            _ => return Err(SchedulerError::NotInWindow(time)),
        };
        log_step!(
            self.config.verbose,
            "Marginalizing camera at time {time} ({} policy, was linearized: {was_linearized})",
            match self.config.policy {
                MarginalizationTarget::Points => "points",
                MarginalizationTarget::Cameras => "cameras",
            }
        );
        // Only eligible cameras observed before this retirement may be abandoned by it.
        let (eligible, _) = self.partition_cameras(state);
        let observed: BTreeSet<CameraTime> = eligible
            .into_iter()
            .filter(|&camera| !state.live_points_at(camera).is_empty())
            .collect();
        match self.config.policy {
            MarginalizationTarget::Points => {
                self.retire_with_points(state, time, was_linearized, &observed)?
            }
            MarginalizationTarget::Cameras => self.retire_camera_only(state, time, was_linearized)?,
        }
        self.abandon_orphans(state, &observed)
    }

    fn retire_with_points(
        &mut self,
        state: &mut WindowState,
        time: CameraTime,
        was_linearized: bool,
        observed: &BTreeSet<CameraTime>,
    ) -> Result<(), SchedulerError> {
        let (_, protected) = self.partition_cameras(state);
        let mut to_eliminate: Vec<PointId> = Vec::new();
        let mut dropped = 0;
        for point in state.live_points_at(time) {
            let shared = protected
                .iter()
                .any(|&newer| state.observations.is_observed_at(newer, point));
            if shared || state.bad_points.contains_key(&point) {
                state.drop_observation(PointObservation::new(time, point));
                dropped += 1;
                log_step!(self.config.verbose, "Dropping observation of point {point} at time {time}");
            } else {
                to_eliminate.push(point);
            }
        }
        if dropped > 0 {
            debug!("Dropped {dropped} observations at time {time}");
        }

        let mut observers = BTreeSet::new();
        for &point in &to_eliminate {
            state.ensure_point_linearized(point)?;
            observers.extend(state.live_observers(point));
        }
        for &camera in &observers {
            state.ensure_camera_linearized(camera)?;
        }

        // Variables that lost their last observation carry no rows to eliminate.
        self.abandon_orphans(state, observed)?;
        if state.cameras.state(&time) == Some(LifecycleState::Marginalized) {
            return Ok(());
        }

        let bundle = self.build(state)?;
        if !to_eliminate.is_empty() {
            let mut ids = MarginalizationIds::new(&bundle);
            for &point in &to_eliminate {
                ids.marginalize_point(point)?;
            }
            for &camera in &observers {
                ids.linearize_camera(camera)?;
            }
            self.marginalize(&bundle, &ids)?;
            for &point in &to_eliminate {
                state.marginalize_point(point)?;
            }
            debug!(
                "Marginalized {} points of camera at time {time} against {} cameras",
                to_eliminate.len(),
                observers.len()
            );
        }

        let mut ids = MarginalizationIds::new(&bundle);
        self.select_camera_block(state, &mut ids, time, was_linearized)?;
        self.marginalize(&bundle, &ids)?;
        state.marginalize_camera(time)?;
        Ok(())
    }

    fn retire_camera_only(
        &mut self,
        state: &mut WindowState,
        time: CameraTime,
        was_linearized: bool,
    ) -> Result<(), SchedulerError> {
        for point in state.live_points_at(time) {
            state.ensure_point_linearized(point)?;
        }
        state.ensure_camera_linearized(time)?;

        let bundle = self.build(state)?;
        let mut ids = MarginalizationIds::new(&bundle);
        self.select_camera_block(state, &mut ids, time, was_linearized)?;
        self.marginalize(&bundle, &ids)?;
        state.marginalize_camera(time)?;
        Ok(())
    }

    /// Eliminate the camera at `time`, keeping its surviving points and, for a
    /// camera that was already linearized, every other linearized camera.
    fn select_camera_block(
        &self,
        state: &mut WindowState,
        ids: &mut MarginalizationIds<'_>,
        time: CameraTime,
        was_linearized: bool,
    ) -> Result<(), SchedulerError> {
        state.ensure_camera_linearized(time)?;
        ids.marginalize_camera(time)?;
        if was_linearized {
            for &camera in state.cameras.linearized().keys() {
                if camera != time {
                    ids.linearize_camera(camera)?;
                }
            }
        }
        for point in state.live_points_at(time) {
            state.ensure_point_linearized(point)?;
            ids.linearize_point(point)?;
        }
        Ok(())
    }

    fn marginalize(&mut self, bundle: &GlobalBundle, ids: &MarginalizationIds<'_>) -> Result<(), SchedulerError> {
        self.bias.marginalize(
            bundle.jacobian()?,
            bundle.residual(),
            bundle.x(),
            &ids.ids_a(),
            &ids.ids_b(),
        )?;
        Ok(())
    }

    /// Retire points without any surviving observation, and those of the
    /// `candidates` cameras that have none left.
    fn abandon_orphans(
        &self,
        state: &mut WindowState,
        candidates: &BTreeSet<CameraTime>,
    ) -> Result<(), SchedulerError> {
        let cameras: Vec<CameraTime> = candidates
            .iter()
            .copied()
            .filter(|time| {
                state
                    .cameras
                    .state(time)
                    .is_some_and(|camera_state| camera_state != LifecycleState::Marginalized)
                    && state.live_points_at(*time).is_empty()
            })
            .collect();
        let points: Vec<PointId> = state
            .points
            .unmarginalized_keys()
            .into_iter()
            .filter(|&point| state.live_observers(point).is_empty())
            .collect();

        for time in cameras {
            state.ensure_camera_linearized(time)?;
            state.marginalize_camera(time)?;
            log_step!(self.config.verbose, "Abandoning camera at time {time} without observations");
        }
        for point in points {
            state.ensure_point_linearized(point)?;
            state.marginalize_point(point)?;
            log_step!(self.config.verbose, "Abandoning point {point} without observations");
        }
        Ok(())
    }
}
