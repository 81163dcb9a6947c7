use std::sync::Arc;
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use cellsim::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(30);

fn decay_model() -> Arc<CompiledModel> {
    let description = ModelDescription {
        voi: "t".to_string(),
        constants: vec![Constant {
            name: "k".to_string(),
            value: 1.0,
        }],
        states: vec![State {
            name: "x".to_string(),
            rate: "dx".to_string(),
            initial: 1.0,
        }],
        algebraic: vec!["flux".to_string()],
        rates: "flux = k * x; dx = -flux".to_string(),
        ..Default::default()
    };
    compile(&description)
}

fn compile(description: &ModelDescription) -> Arc<CompiledModel> {
    let mut compiler = Compiler::new().unwrap();
    let model = description.parse().unwrap();
    Arc::new(CompiledModel::compile(&model, &mut compiler, "decay").unwrap())
}

fn bdf(rtol: f64, atol: f64) -> SolverSettings {
    SolverSettings::Bdf(SolverConfiguration {
        relative_tolerance: rtol,
        absolute_tolerance: atol,
        ..Default::default()
    })
}

fn progress_fractions(events: &[SimulationEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            SimulationEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        })
        .collect()
}

/// Waits for an event matching `predicate`, collecting everything received on the way.
fn wait_for(
    controller: &mut SimulationController,
    predicate: impl Fn(&SimulationEvent) -> bool,
) -> Vec<SimulationEvent> {
    let mut events = Vec::new();
    while let Some(event) = controller.next_event(TIMEOUT) {
        let found = predicate(&event);
        events.push(event);
        if found {
            return events;
        }
    }
    panic!("event not received, got {events:?}");
}

#[test]
fn test_exponential_decay_run() {
    let configuration = SimulationConfiguration {
        voi_start: 0.0,
        voi_end: 1.0,
        point_interval: 0.1,
        solver: bdf(1e-6, 1e-6),
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    let events = controller.wait_for_stop(TIMEOUT);

    assert_eq!(events.first(), Some(&SimulationEvent::Running));
    assert!(matches!(
        events.last(),
        Some(SimulationEvent::Stopped { voi, .. }) if *voi == 1.0
    ));
    assert_eq!(controller.status(), RunStatus::Stopped);

    let fractions = progress_fractions(&events);
    assert_eq!(fractions.last(), Some(&1.0));
    assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));

    let results = controller.results();
    assert_eq!(results.len(), 11);
    assert_eq!(results[0].voi, 0.0);
    assert_eq!(results[10].voi, 1.0);
    assert!(results.windows(2).all(|pair| pair[0].voi < pair[1].voi));
    assert_relative_eq!(controller.states()[0], (-1.0_f64).exp(), max_relative = 1e-4);

    // Algebraic variables are reported with the states.
    let last = &results[10];
    assert_relative_eq!(last.algebraic[0], last.states[0]);
    assert_relative_eq!(last.rates[0], -last.states[0]);
}

#[test]
fn test_last_progress_before_stopped_is_complete() {
    let configuration = SimulationConfiguration {
        voi_start: 0.0,
        voi_end: 10.0,
        point_interval: 0.01,
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    let events = controller.wait_for_stop(TIMEOUT);

    let stopped = events
        .iter()
        .position(|event| matches!(event, SimulationEvent::Stopped { .. }))
        .unwrap();
    assert_eq!(stopped, events.len() - 1);
    let last_progress = events[..stopped]
        .iter()
        .rev()
        .find_map(|event| match event {
            SimulationEvent::Progress { fraction, voi, .. } => Some((*fraction, *voi)),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_progress, (1.0, 10.0));
    assert_eq!(controller.results().len(), 1001);
}

#[test]
fn test_stop_right_after_run() {
    let configuration = SimulationConfiguration {
        voi_start: 0.0,
        voi_end: 1.0e6,
        point_interval: 0.01,
        ..Default::default()
    };
    let voi_end = configuration.voi_end;
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    controller.stop();
    let events = controller.wait_for_stop(TIMEOUT);

    match events.last() {
        Some(SimulationEvent::Stopped { voi, .. }) => {
            assert!(*voi >= 0.0 && *voi < voi_end, "stopped at {voi}")
        }
        other => panic!("expected stopped, got {other:?}"),
    }
    assert!(progress_fractions(&events).iter().all(|fraction| *fraction < 1.0));
    assert!(controller.results().iter().all(|point| point.voi < voi_end));
    assert!(controller.voi() < voi_end);
    assert_eq!(controller.status(), RunStatus::Stopped);

    // Nothing follows `Stopped`.
    thread::sleep(Duration::from_millis(50));
    assert!(controller.poll_events().is_empty());
}

#[test]
fn test_pause_then_run_resumes_from_paused_voi() {
    let configuration = SimulationConfiguration {
        voi_start: 0.0,
        voi_end: 1.0e6,
        point_interval: 0.01,
        ..Default::default()
    };
    let interval = configuration.point_interval;
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    controller.pause().unwrap();
    assert_eq!(controller.status(), RunStatus::Pausing);

    let events = wait_for(&mut controller, |event| *event == SimulationEvent::Paused);
    assert!(events.contains(&SimulationEvent::Pausing));
    assert_eq!(controller.status(), RunStatus::Paused);
    let paused_voi = controller.voi();
    let recorded = controller.results().len();

    // A parked worker reports nothing.
    thread::sleep(Duration::from_millis(50));
    assert!(controller.poll_events().is_empty());
    assert_eq!(controller.voi(), paused_voi);

    controller.run().unwrap();
    assert_eq!(controller.status(), RunStatus::Running);
    let events = wait_for(&mut controller, |event| {
        matches!(event, SimulationEvent::Progress { .. })
    });
    assert_eq!(events.first(), Some(&SimulationEvent::Running));

    let resumed = &controller.results()[recorded];
    assert!(resumed.voi > paused_voi);
    assert_relative_eq!(resumed.voi, paused_voi + interval, max_relative = 1e-9);

    controller.stop();
    let events = controller.wait_for_stop(TIMEOUT);
    match events.last() {
        Some(SimulationEvent::Stopped { voi, .. }) => assert!(*voi > paused_voi),
        other => panic!("expected stopped, got {other:?}"),
    }
}

#[test]
fn test_solver_error_is_reported_then_stopped() {
    let configuration = SimulationConfiguration {
        voi_start: 0.0,
        voi_end: 100.0,
        point_interval: 50.0,
        solver: SolverSettings::Bdf(SolverConfiguration {
            maximum_number_of_steps: 1,
            relative_tolerance: 1e-10,
            absolute_tolerance: 1e-10,
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    let events = controller.wait_for_stop(TIMEOUT);

    let n = events.len();
    assert!(n >= 3);
    match &events[n - 2] {
        SimulationEvent::Error(message) => assert!(message.starts_with("integration error")),
        other => panic!("expected an error, got {other:?}"),
    }
    assert!(matches!(events[n - 1], SimulationEvent::Stopped { .. }));
    assert!(matches!(controller.status(), RunStatus::Error(_)));

    // The run can be retried.
    controller.run().unwrap();
    let events = controller.wait_for_stop(TIMEOUT);
    assert!(matches!(events.last(), Some(SimulationEvent::Stopped { .. })));
}

#[test]
fn test_invalid_configuration_is_rejected_synchronously() {
    let configuration = SimulationConfiguration {
        point_interval: -1.0,
        ..Default::default()
    };
    let err = SimulationController::new(decay_model(), configuration)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SimulationError::Configuration(ConfigurationError::InvalidPointInterval(_))
    ));
    assert!(err.to_string().starts_with("configuration error"));

    let configuration = SimulationConfiguration {
        solver: bdf(0.0, 1e-6),
        ..Default::default()
    };
    assert!(SimulationController::new(decay_model(), configuration).is_err());
}

#[test]
fn test_invalid_transitions() {
    let configuration = SimulationConfiguration {
        voi_end: 1.0e6,
        point_interval: 0.01,
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    assert_eq!(controller.status(), RunStatus::Idle);
    assert!(matches!(
        controller.pause(),
        Err(SimulationError::InvalidTransition { action: "pause", .. })
    ));
    controller.stop();
    assert_eq!(controller.status(), RunStatus::Idle);
    assert!(controller.poll_events().is_empty());

    controller.run().unwrap();
    assert!(matches!(
        controller.run(),
        Err(SimulationError::InvalidTransition { action: "run", .. })
    ));
    controller.stop();
    controller.wait_for_stop(TIMEOUT);
}

#[test]
fn test_rerun_starts_over() {
    let configuration = SimulationConfiguration {
        voi_end: 2.0,
        point_interval: 0.5,
        solver: bdf(1e-6, 1e-6),
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    controller.wait_for_stop(TIMEOUT);
    let first: Vec<f64> = controller.results().iter().map(|p| p.states[0]).collect();

    controller.run().unwrap();
    controller.wait_for_stop(TIMEOUT);
    let second: Vec<f64> = controller.results().iter().map(|p| p.states[0]).collect();

    assert_eq!(first.len(), 5);
    assert_eq!(first, second);
}

#[test]
fn test_concurrent_runs_share_one_model() {
    let model = decay_model();
    let configuration = SimulationConfiguration {
        voi_end: 1.0,
        point_interval: 0.01,
        solver: bdf(1e-6, 1e-6),
        ..Default::default()
    };

    let mut controllers: Vec<_> = (0..4)
        .map(|_| SimulationController::new(Arc::clone(&model), configuration.clone()).unwrap())
        .collect();
    for controller in &mut controllers {
        controller.run().unwrap();
    }
    for controller in &mut controllers {
        controller.wait_for_stop(TIMEOUT);
        assert_eq!(controller.voi(), 1.0);
        assert_relative_eq!(controller.states()[0], (-1.0_f64).exp(), max_relative = 1e-4);
    }
}

#[test]
fn test_forward_euler_run() {
    let configuration = SimulationConfiguration {
        voi_end: 1.0,
        point_interval: 0.25,
        solver: SolverSettings::ForwardEuler { step: 1e-4 },
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    controller.wait_for_stop(TIMEOUT);

    assert_eq!(controller.results().len(), 5);
    assert_relative_eq!(controller.states()[0], (-1.0_f64).exp(), max_relative = 1e-3);
}

#[test]
fn test_drop_while_running_joins_worker() {
    let configuration = SimulationConfiguration {
        voi_end: 1.0e6,
        point_interval: 0.01,
        ..Default::default()
    };
    let mut controller = SimulationController::new(decay_model(), configuration).unwrap();
    controller.run().unwrap();
    thread::sleep(Duration::from_millis(20));
    drop(controller);
}

#[test]
fn test_models_needing_other_solvers_are_refused() {
    let ode = ModelDescription {
        voi: "t".to_string(),
        states: vec![State {
            name: "x".to_string(),
            rate: "dx".to_string(),
            initial: 1.0,
        }],
        rates: "dx = -x".to_string(),
        ..Default::default()
    };
    let dae = ModelDescription {
        model_type: ModelType::Dae,
        ..ode.clone()
    };
    let nla = ModelDescription {
        needs_nla_solver: true,
        ..ode.clone()
    };

    for description in [dae, nla] {
        let mut controller =
            SimulationController::new(compile(&description), SimulationConfiguration::default())
                .unwrap();
        let err = controller.run().unwrap_err();
        assert!(matches!(err, SimulationError::UnsupportedModel(_)));
        assert!(err.to_string().starts_with("unsupported model"));
        assert_eq!(controller.status(), RunStatus::Idle);
        assert!(controller.poll_events().is_empty());
    }

    let configuration = SimulationConfiguration {
        voi_end: 1.0,
        point_interval: 0.5,
        ..Default::default()
    };
    let mut controller = SimulationController::new(compile(&ode), configuration).unwrap();
    controller.run().unwrap();
    assert!(matches!(
        controller.wait_for_stop(TIMEOUT).last(),
        Some(SimulationEvent::Stopped { .. })
    ));
}
