//! The controlling side of a simulation run.
//!
//! [`SimulationController`] validates the configuration, spawns a worker thread per run and
//! forwards `run`, `pause` and `stop` to it as commands. It never blocks on the worker
//! except when joining a finished one. Events are drained on the caller's schedule and the
//! controller keeps the latest `voi`, the states and every point it has received.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::{
    errors::SimulationError,
    model::CompiledModel,
    simulation::{
        worker::Worker, Command, RunStatus, Shared, SimulationConfiguration, SimulationEvent,
        SimulationPoint,
    },
};

/// Controls one simulation run of a compiled model.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use cellsim::prelude::*;
/// # fn demo(model: Arc<CompiledModel>) -> Result<(), SimulationError> {
/// let mut controller = SimulationController::new(model, SimulationConfiguration::default())?;
/// controller.run()?;
/// for event in controller.wait_for_stop(Duration::from_secs(10)) {
///     if let SimulationEvent::Progress { fraction, .. } = event {
///         println!("{:.0}%", fraction * 100.0);
///     }
/// }
/// println!("{} points", controller.results().len());
/// # Ok(())
/// # }
/// ```
pub struct SimulationController {
    model: Arc<CompiledModel>,
    configuration: SimulationConfiguration,
    shared: Arc<Shared>,
    events: Receiver<SimulationEvent>,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    voi: f64,
    states: Vec<f64>,
    results: Vec<SimulationPoint>,
}

impl SimulationController {
    /// Creates an idle run. The configuration is checked here, before any thread exists.
    ///
    /// # Arguments
    /// * `model` - The compiled model, shared read-only with any number of runs
    /// * `configuration` - Range, point interval, progress interval and solver settings
    ///
    /// # Errors
    /// Returns a SimulationError if the configuration is invalid
    pub fn new(
        model: Arc<CompiledModel>,
        configuration: SimulationConfiguration,
    ) -> Result<Self, SimulationError> {
        configuration.validate()?;
        let (sender, events) = mpsc::channel();
        Ok(Self {
            voi: configuration.voi_start,
            states: model.states().to_vec(),
            model,
            configuration,
            shared: Arc::new(Shared::new(sender)),
            events,
            commands: None,
            worker: None,
            results: Vec::new(),
        })
    }

    /// The configuration every run of this controller uses.
    pub fn configuration(&self) -> &SimulationConfiguration {
        &self.configuration
    }

    /// Current status. It may be ahead of the events drained so far.
    pub fn status(&self) -> RunStatus {
        self.shared.status()
    }

    /// Value of the variable of integration, as of the last event received.
    pub fn voi(&self) -> f64 {
        self.voi
    }

    /// Copy of the states, as of the last event received.
    pub fn states(&self) -> &[f64] {
        &self.states
    }

    /// Every point received for the current run.
    pub fn results(&self) -> &[SimulationPoint] {
        &self.results
    }

    /// Starts a new run, or resumes a paused one.
    ///
    /// A new run starts from the configured start with the model's initial values and
    /// forgets the results of the previous one.
    ///
    /// # Errors
    /// Returns a SimulationError if a run is already going, if the model needs a solver
    /// this crate does not have, or if the worker thread cannot be spawned
    pub fn run(&mut self) -> Result<(), SimulationError> {
        let mut channel = self.shared.lock();
        let status = channel.status.clone();
        match status {
            RunStatus::Paused | RunStatus::Pausing => {
                channel.transition(RunStatus::Running, SimulationEvent::Running);
                self.send(Command::Resume);
                debug!("simulation resume requested");
                Ok(())
            }
            RunStatus::Idle | RunStatus::Stopped | RunStatus::Error(_) => {
                drop(channel);
                self.start()
            }
            status @ RunStatus::Running => Err(SimulationError::InvalidTransition {
                action: "run",
                status: status.to_string(),
            }),
        }
    }

    /// Asks the worker to park at the next increment boundary.
    ///
    /// The status becomes `Pausing` at once and `Paused` when the worker parks.
    ///
    /// # Errors
    /// Returns a SimulationError unless the run is `Running`
    pub fn pause(&mut self) -> Result<(), SimulationError> {
        let mut channel = self.shared.lock();
        if channel.status != RunStatus::Running {
            return Err(SimulationError::InvalidTransition {
                action: "pause",
                status: channel.status.to_string(),
            });
        }
        channel.transition(RunStatus::Pausing, SimulationEvent::Pausing);
        self.send(Command::Pause);
        Ok(())
    }

    /// Asks the worker to stop at the next increment boundary. Does nothing when no run is
    /// active.
    pub fn stop(&mut self) {
        if self.shared.status().is_active() {
            self.send(Command::Stop);
            debug!("simulation stop requested");
        }
    }

    /// Drains the events received so far.
    pub fn poll_events(&mut self) -> Vec<SimulationEvent> {
        let events: Vec<_> = self.events.try_iter().collect();
        for event in &events {
            self.record(event);
        }
        events
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_event(&mut self, timeout: Duration) -> Option<SimulationEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.record(&event);
                Some(event)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Collects events until `Stopped` arrives or `timeout` has passed.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Vec<SimulationEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.next_event(left) {
                Some(event) => {
                    let stopped = matches!(event, SimulationEvent::Stopped { .. });
                    events.push(event);
                    if stopped {
                        break;
                    }
                }
                None => break,
            }
        }
        events
    }

    /// Updates the query surface from an event.
    fn record(&mut self, event: &SimulationEvent) {
        match event {
            SimulationEvent::Progress { voi, points, .. } => {
                self.voi = *voi;
                if let Some(last) = points.last() {
                    self.states.clone_from(&last.states);
                }
                self.results.extend_from_slice(points);
            }
            SimulationEvent::Stopped { voi, .. } => self.voi = *voi,
            _ => {}
        }
    }

    fn send(&self, command: Command) {
        if let Some(commands) = &self.commands {
            // A worker that already finished has nothing left to obey.
            let _ = commands.send(command);
        }
    }

    /// Spawns the worker of a fresh run.
    fn start(&mut self) -> Result<(), SimulationError> {
        if let Some(reason) = self.model.unsupported_reason() {
            return Err(SimulationError::UnsupportedModel(reason));
        }
        self.join_worker();
        // Events of the previous run belong to it.
        self.poll_events();
        self.voi = self.configuration.voi_start;
        self.states = self.model.states().to_vec();
        self.results.clear();

        let (commands, receiver) = mpsc::channel();
        let worker = Worker {
            model: Arc::clone(&self.model),
            configuration: self.configuration.clone(),
            shared: Arc::clone(&self.shared),
            commands: receiver,
        };

        // The worker cannot publish anything before `Running` while the lock is held.
        let mut channel = self.shared.lock();
        let handle = thread::Builder::new()
            .name("cellsim-worker".to_string())
            .spawn(move || worker.run())?;
        channel.transition(RunStatus::Running, SimulationEvent::Running);
        drop(channel);

        self.commands = Some(commands);
        self.worker = Some(handle);
        Ok(())
    }

    /// Closes the command queue and waits for the current worker, if any.
    fn join_worker(&mut self) {
        self.commands = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("simulation worker panicked");
            }
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.stop();
        self.join_worker();
    }
}
