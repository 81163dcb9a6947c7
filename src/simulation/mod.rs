//! Simulation runs on a dedicated worker thread.
//!
//! A [`SimulationController`] owns one run of a compiled model. It never touches the solver:
//! `run`, `pause` and `stop` are queued to the worker as commands, and the worker reports back
//! through a FIFO channel of [`SimulationEvent`]s that the controller drains on its own
//! schedule. The worker advances the solver one point interval at a time, so commands take
//! effect at the next increment boundary.

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{errors::ConfigurationError, solver::SolverSettings};

mod controller;
mod worker;

pub use controller::SimulationController;

pub const DEFAULT_VOI_START: f64 = 0.0;
pub const DEFAULT_VOI_END: f64 = 1000.0;
pub const DEFAULT_POINT_INTERVAL: f64 = 1.0;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(20);

/// What to simulate and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationConfiguration {
    pub voi_start: f64,
    pub voi_end: f64,
    /// Distance between two recorded points, which is also the size of one increment.
    pub point_interval: f64,
    /// Minimum wall-clock time between two progress reports.
    pub progress_interval: Duration,
    pub solver: SolverSettings,
}

impl Default for SimulationConfiguration {
    fn default() -> Self {
        Self {
            voi_start: DEFAULT_VOI_START,
            voi_end: DEFAULT_VOI_END,
            point_interval: DEFAULT_POINT_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            solver: SolverSettings::default(),
        }
    }
}

impl SimulationConfiguration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.voi_start.is_finite() && self.voi_end.is_finite() && self.voi_end > self.voi_start)
        {
            return Err(ConfigurationError::InvalidRange {
                start: self.voi_start,
                end: self.voi_end,
            });
        }
        if !(self.point_interval > 0.0 && self.point_interval.is_finite()) {
            return Err(ConfigurationError::InvalidPointInterval(self.point_interval));
        }
        self.solver.validate()
    }

    /// End of the `k`-th increment. The last increment ends exactly on `voi_end`.
    pub(crate) fn increment_end(&self, k: usize) -> f64 {
        let voi = self.voi_start + k as f64 * self.point_interval;
        if voi >= self.voi_end - 1e-9 * self.point_interval {
            self.voi_end
        } else {
            voi
        }
    }

    /// Fraction of the range covered at `voi`, exactly `1.0` at the end.
    pub(crate) fn fraction(&self, voi: f64) -> f64 {
        if voi >= self.voi_end {
            1.0
        } else {
            ((voi - self.voi_start) / (self.voi_end - self.voi_start)).clamp(0.0, 1.0)
        }
    }
}

/// Lifecycle of a simulation run.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    /// A pause was requested and the worker has not reached an increment boundary yet.
    Pausing,
    Paused,
    Stopped,
    /// The run ended with the given error.
    Error(String),
}

impl RunStatus {
    /// Whether a worker owns the run.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::Pausing | RunStatus::Paused
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Pausing => write!(f, "pausing"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Error(_) => write!(f, "stopped on error"),
        }
    }
}

/// Values of the model at one point of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPoint {
    pub voi: f64,
    pub states: Vec<f64>,
    pub rates: Vec<f64>,
    pub algebraic: Vec<f64>,
}

/// Notifications from a run, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationEvent {
    Running,
    Pausing,
    Paused,
    /// `points` holds every point recorded since the previous report.
    Progress {
        fraction: f64,
        voi: f64,
        points: Vec<SimulationPoint>,
    },
    Error(String),
    /// Always the last event of a run. `elapsed` excludes the time spent paused.
    Stopped {
        voi: f64,
        elapsed: Duration,
    },
}

/// Commands from the controller to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume,
    Stop,
}

/// Run status and the event channel, shared by a controller and its worker.
///
/// Events are only sent with the lock held, so their order matches the order of the status
/// changes.
pub(crate) struct Shared {
    inner: Mutex<Channel>,
}

pub(crate) struct Channel {
    pub(crate) status: RunStatus,
    events: Sender<SimulationEvent>,
}

impl Channel {
    pub(crate) fn emit(&self, event: SimulationEvent) {
        // The controller may already be gone; nobody is left to tell.
        let _ = self.events.send(event);
    }

    pub(crate) fn transition(&mut self, status: RunStatus, event: SimulationEvent) {
        self.status = status;
        self.emit(event);
    }
}

impl Shared {
    pub(crate) fn new(events: Sender<SimulationEvent>) -> Self {
        Self {
            inner: Mutex::new(Channel {
                status: RunStatus::Idle,
                events,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Channel> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.lock().status.clone()
    }

    pub(crate) fn emit(&self, event: SimulationEvent) {
        self.lock().emit(event);
    }
}
