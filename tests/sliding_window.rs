//! End-to-end tests of the sliding-window backend
//!
//! A camera travels along a strip of points; frames are either added one by one
//! (streaming) or all at once, and the scheduler keeps the window at its target
//! size while the optimizer refines what is left.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use sliding_bundle::core::ledger::LifecycleState;
use sliding_bundle::{
    BundleOptimizer, MarginalizationScheduler, MarginalizationTarget, SchedulerError, WindowError,
    WindowState, init_logger,
};
use tracing::info;

use window_test_utils::*;

#[test]
fn test_streaming_window_stays_bounded() {
    init_logger();

    let mut noise = SceneNoise::new(7, 0.3, 0.05);
    let config = size_driven_config(sliding_bundle::WindowConfig::default(), 4);
    let intrinsics = config.bundle.intrinsics;
    let mut scheduler = MarginalizationScheduler::new(&config);
    let optimizer = BundleOptimizer::with_config(config.optimizer.clone().with_max_iterations(5));
    let mut state = WindowState::new();

    for k in 0..8 {
        add_camera(&mut state, &intrinsics, &mut noise, k);
        let summary = optimizer
            .optimize(&mut state, &mut scheduler)
            .expect("window optimization failed");
        info!("frame {k}: cost {:.4e} -> {:.4e}", summary.initial_cost, summary.final_cost);

        assert!(state.cameras.num_unmarginalized() <= 4);
        assert!(summary.final_cost <= summary.initial_cost);
        assert!(summary.final_cost.is_finite());
        // The two newest frames are never retired.
        assert_ne!(
            state.cameras.state(&camera_time(k)),
            Some(LifecycleState::Marginalized)
        );
        if k > 0 {
            assert_ne!(
                state.cameras.state(&camera_time(k - 1)),
                Some(LifecycleState::Marginalized)
            );
        }
    }

    assert_eq!(state.cameras.num_unmarginalized(), 4);
    assert_eq!(state.cameras.marginalized().len(), 4);
    assert!(!scheduler.bias().is_empty());

    // Every prior variable has a column in the current layout.
    let bundle = scheduler.global_bundle(&mut state, false).unwrap();
    for uuid in scheduler.bias().ids() {
        assert!(bundle.predictor_uuids().contains_key(uuid));
        assert!(!scheduler.bias().is_eliminated(*uuid));
    }
}

#[test]
fn test_default_configuration_retires_starved_cameras() {
    let mut noise = SceneNoise::new(13, 0.3, 0.05);
    let config = sliding_bundle::WindowConfig::default();
    let intrinsics = config.bundle.intrinsics;
    let mut scheduler = MarginalizationScheduler::new(&config);
    let optimizer = BundleOptimizer::with_config(config.optimizer.clone().with_max_iterations(5));
    let mut state = WindowState::new();

    for k in 0..12 {
        add_camera(&mut state, &intrinsics, &mut noise, k);
        let summary = optimizer
            .optimize(&mut state, &mut scheduler)
            .expect("window optimization failed");
        info!("frame {k}: cost {:.4e} -> {:.4e}", summary.initial_cost, summary.final_cost);

        assert!(state.cameras.num_unmarginalized() <= config.scheduler.target_window_size);
        assert!(summary.final_cost.is_finite());
        assert!(summary.final_cost <= summary.initial_cost);
        assert_eq!(scheduler.find_starved_camera(&state), None);
        assert_ne!(
            state.cameras.state(&camera_time(k)),
            Some(LifecycleState::Marginalized)
        );
    }

    // Cameras 0..6 share no point with the newest camera 11.
    for k in 0..6 {
        assert_eq!(
            state.cameras.state(&camera_time(k)),
            Some(LifecycleState::Marginalized)
        );
    }
    let bundle = scheduler.global_bundle(&mut state, false).unwrap();
    assert!(scheduler.bias().bias(bundle.x()).unwrap() >= -1e-9 * bundle.residual().norm_squared());
}

#[test]
fn test_optimization_moves_points_towards_truth() {
    let mut noise = SceneNoise::new(11, 0.0, 0.05);
    let (mut state, config) = build_scene(6, &mut noise);
    let config = size_driven_config(config, 10);
    let mut scheduler = MarginalizationScheduler::new(&config);
    let optimizer = BundleOptimizer::with_config(config.optimizer.clone().with_max_iterations(20));

    let before = point_rms_error(&state);
    let summary = optimizer.optimize(&mut state, &mut scheduler).unwrap();
    let after = point_rms_error(&state);

    assert!(summary.accepted_steps > 0);
    assert!(summary.final_cost < summary.initial_cost);
    assert!(after < before, "point error grew from {before} to {after}");
    assert!(scheduler.bias().is_empty());
}

#[test]
fn test_prior_is_bounded_below() {
    let mut noise = SceneNoise::new(3, 0.3, 0.02);
    let (mut state, config) = build_scene(6, &mut noise);
    let mut scheduler = MarginalizationScheduler::new(&size_driven_config(config, 3));

    let bundle = scheduler.global_bundle(&mut state, true).unwrap();

    assert_eq!(state.cameras.num_unmarginalized(), 3);
    let bias = scheduler.bias().bias(bundle.x()).unwrap();
    assert!(bias.is_finite());
    assert!(scheduler.bias().minimum() >= 0.0);
    assert!(bias >= -1e-9 * bundle.residual().norm_squared());

    let per_observation: f64 = bundle.sum_squared_observation_residuals().values().sum();
    assert!((per_observation - bundle.residual().norm_squared()).abs() < 1e-9);
}

#[test]
fn test_cameras_only_policy() {
    let mut noise = SceneNoise::new(5, 0.2, 0.02);
    let (mut state, config) = build_scene(6, &mut noise);
    let config = size_driven_config(config.with_policy(MarginalizationTarget::Cameras), 3);
    let mut scheduler = MarginalizationScheduler::new(&config);
    let optimizer = BundleOptimizer::with_config(config.optimizer.clone().with_max_iterations(5));

    let summary = optimizer.optimize(&mut state, &mut scheduler).unwrap();

    assert_eq!(state.cameras.num_unmarginalized(), 3);
    assert!(!scheduler.bias().is_empty());
    assert!(summary.final_cost <= summary.initial_cost);
    // Points keep living as long as a window camera still observes them.
    for (id, _) in state.points.active().iter().chain(state.points.linearized().iter()) {
        assert!(
            !state.live_observers(*id).is_empty(),
            "point {id} has no observer left in the window"
        );
    }
}

#[test]
fn test_unreachable_target_is_reported() {
    let mut noise = SceneNoise::new(1, 0.0, 0.0);
    let (mut state, config) = build_scene(4, &mut noise);
    let mut scheduler = MarginalizationScheduler::new(&size_driven_config(config, 1));

    let result = scheduler.global_bundle(&mut state, true);
    assert!(matches!(
        result,
        Err(SchedulerError::UnreachableWindowTarget { target: 1, window: 4 })
    ));

    let error: WindowError = result.err().map(WindowError::from).unwrap();
    assert!(error.to_string().contains("unreachable"));
    assert_eq!(state.cameras.marginalized().len(), 0);
}
