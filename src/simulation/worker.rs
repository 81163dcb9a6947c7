//! The thread that advances one simulation run.
//!
//! The worker owns the model's arrays and its solver for the whole run. It integrates one
//! point interval per `solve` call and looks at its command queue between calls, which is
//! the only place a pause or a stop can take effect. Points are buffered and sent in batches
//! with each progress report.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{
    model::CompiledModel,
    simulation::{Command, RunStatus, Shared, SimulationConfiguration, SimulationEvent, SimulationPoint},
    solver::SolverData,
};

/// What the worker does after looking at its commands.
enum Flow {
    Continue,
    Stop,
}

/// The arrays of one run, owned by the worker thread.
struct Arrays {
    constants: Vec<f64>,
    rates: Vec<f64>,
    states: Vec<f64>,
    algebraic: Vec<f64>,
}

impl Arrays {
    /// Borrows the arrays for one solver call.
    fn data(&mut self) -> SolverData<'_> {
        SolverData {
            constants: &self.constants,
            rates: &mut self.rates,
            states: &mut self.states,
            algebraic: &mut self.algebraic,
        }
    }

    /// Snapshot of the arrays at `voi`.
    fn point(&self, voi: f64) -> SimulationPoint {
        SimulationPoint {
            voi,
            states: self.states.clone(),
            rates: self.rates.clone(),
            algebraic: self.algebraic.clone(),
        }
    }
}

/// One run, moved onto its own thread by the controller.
pub(crate) struct Worker {
    pub(crate) model: Arc<CompiledModel>,
    pub(crate) configuration: SimulationConfiguration,
    pub(crate) shared: Arc<Shared>,
    pub(crate) commands: Receiver<Command>,
}

impl Worker {
    /// Runs the simulation to its end, to a stop command or to a solver error.
    ///
    /// The controller has already published `Running`. Whatever happens, the last event
    /// this publishes is `Stopped`.
    pub(crate) fn run(self) {
        let configuration = &self.configuration;
        let model = &self.model;
        let layout = model.layout();
        let mut arrays = Arrays {
            constants: model.constants().to_vec(),
            rates: vec![0.0; layout.rates],
            states: model.states().to_vec(),
            algebraic: vec![0.0; layout.algebraic],
        };
        let mut solver = configuration.solver.build();
        info!(
            solver = solver.name(),
            voi_start = configuration.voi_start,
            voi_end = configuration.voi_end,
            "simulation worker started"
        );

        let mut clock = Clock::start();
        let mut voi = configuration.voi_start;
        if let Err(err) = solver.initialize(
            configuration.voi_start,
            configuration.voi_end,
            arrays.data(),
            model.compute_rates_fn(),
        ) {
            self.fail(voi, err.to_string(), Vec::new(), &clock);
            return;
        }
        self.compute_variables(voi, &mut arrays);

        let mut points = vec![arrays.point(voi)];
        let mut last_report = Instant::now();
        let mut k = 0;
        loop {
            if let Flow::Stop = self.check_commands(voi, &mut points, &mut clock) {
                self.report(voi, &mut points);
                break;
            }

            k += 1;
            let end = configuration.increment_end(k);
            if let Err(err) = solver.solve(&mut voi, end, arrays.data()) {
                self.compute_variables(voi, &mut arrays);
                points.push(arrays.point(voi));
                self.fail(voi, err.to_string(), points, &clock);
                return;
            }
            self.compute_variables(voi, &mut arrays);
            points.push(arrays.point(voi));

            if end == configuration.voi_end {
                self.report(voi, &mut points);
                break;
            }
            if last_report.elapsed() >= configuration.progress_interval {
                self.report(voi, &mut points);
                last_report = Instant::now();
            }
        }

        let elapsed = clock.elapsed();
        info!(voi, elapsed_ms = elapsed.as_millis() as u64, "simulation worker stopped");
        self.shared.lock().transition(
            RunStatus::Stopped,
            SimulationEvent::Stopped { voi, elapsed },
        );
    }

    /// Brings the algebraic variables the rates do not need up to date.
    fn compute_variables(&self, voi: f64, arrays: &mut Arrays) {
        self.model.compute_variables(
            voi,
            &arrays.constants,
            &mut arrays.rates,
            &arrays.states,
            &mut arrays.algebraic,
        );
    }

    /// Sends the points recorded since the last report, if any.
    fn report(&self, voi: f64, points: &mut Vec<SimulationPoint>) {
        if points.is_empty() {
            return;
        }
        self.shared.emit(SimulationEvent::Progress {
            fraction: self.configuration.fraction(voi),
            voi,
            points: std::mem::take(points),
        });
    }

    /// Reports the pending points, then `Error(message)` and `Stopped` under one lock.
    fn fail(&self, voi: f64, message: String, mut points: Vec<SimulationPoint>, clock: &Clock) {
        self.report(voi, &mut points);
        let elapsed = clock.elapsed();
        info!(voi, error = %message, "simulation worker stopped on error");
        let mut channel = self.shared.lock();
        channel.transition(
            RunStatus::Error(message.clone()),
            SimulationEvent::Error(message),
        );
        channel.emit(SimulationEvent::Stopped { voi, elapsed });
    }

    /// Handles the commands queued since the last increment, parking the thread on a pause.
    ///
    /// Commands cancel out in order, so a pause followed by a resume that both arrived
    /// during one increment does not park the thread. A closed command queue means the
    /// controller is gone and counts as a stop.
    ///
    /// # Returns
    /// Whether the run goes on
    fn check_commands(&self, voi: f64, points: &mut Vec<SimulationPoint>, clock: &mut Clock) -> Flow {
        let mut pause = false;
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return Flow::Stop,
                Ok(Command::Pause) => pause = true,
                Ok(Command::Resume) => pause = false,
                Err(TryRecvError::Empty) => break,
            }
        }
        if !pause {
            return Flow::Continue;
        }

        self.report(voi, points);
        {
            let mut channel = self.shared.lock();
            if channel.status == RunStatus::Pausing {
                channel.transition(RunStatus::Paused, SimulationEvent::Paused);
            }
        }
        debug!(voi, "simulation paused");
        let paused_at = Instant::now();
        let flow = loop {
            match self.commands.recv() {
                Ok(Command::Resume) => break Flow::Continue,
                Ok(Command::Pause) => continue,
                Ok(Command::Stop) | Err(_) => break Flow::Stop,
            }
        };
        clock.paused += paused_at.elapsed();
        debug!(voi, "simulation resumed");
        flow
    }
}

/// Wall-clock time of a run, minus pauses.
struct Clock {
    started: Instant,
    paused: Duration,
}

impl Clock {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            paused: Duration::ZERO,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.paused)
    }
}
