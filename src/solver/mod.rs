//! ODE solver drivers.
//!
//! A driver advances the states of a model from one value of the variable of integration to
//! another, calling a [`ComputeRatesFn`] for the rates. The caller owns the arrays; every call
//! borrows them through [`SolverData`].
//!
//! - [`BdfSolver`]: variable-order BDF with Newton iteration and a dense linear solve, for
//!   stiff problems
//! - [`ForwardEulerSolver`]: fixed-step explicit Euler

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ConfigurationError, SolverError},
    types::ComputeRatesFn,
};

mod bdf;
mod euler;

pub use bdf::BdfSolver;
pub use euler::ForwardEulerSolver;

pub const MAXIMUM_STEP_PROPERTY: &str = "MaximumStep";
pub const MAXIMUM_NUMBER_OF_STEPS_PROPERTY: &str = "MaximumNumberOfSteps";
pub const RELATIVE_TOLERANCE_PROPERTY: &str = "RelativeTolerance";
pub const ABSOLUTE_TOLERANCE_PROPERTY: &str = "AbsoluteTolerance";

/// No limit on the step size.
pub const DEFAULT_MAXIMUM_STEP: f64 = 0.0;
pub const DEFAULT_MAXIMUM_NUMBER_OF_STEPS: usize = 500;
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 1.0e-7;
pub const DEFAULT_ABSOLUTE_TOLERANCE: f64 = 1.0e-7;

/// The arrays a solver works on, borrowed from the caller for one call.
///
/// `rates` and `states` have the state count as length; `constants` is only read.
pub struct SolverData<'a> {
    pub constants: &'a [f64],
    pub rates: &'a mut [f64],
    pub states: &'a mut [f64],
    pub algebraic: &'a mut [f64],
}

impl SolverData<'_> {
    pub(crate) fn check_len(&self, states: usize) -> Result<(), ConfigurationError> {
        for (array, got) in [("states", self.states.len()), ("rates", self.rates.len())] {
            if got != states {
                return Err(ConfigurationError::ArrayLength {
                    array,
                    expected: states,
                    got,
                });
            }
        }
        Ok(())
    }
}

/// An ODE solver driver.
///
/// `initialize` binds the driver to a rates function and a start point; a later call starts
/// over from the new point and keeps the configuration. `solve` integrates up to `voi_end`,
/// updates `states` in place and leaves `rates` evaluated at the final point.
pub trait OdeSolver: Send {
    fn name(&self) -> &'static str;

    /// Whether `name` is a configuration key this solver understands.
    fn is_valid_property(&self, name: &str) -> bool;

    fn initialize(
        &mut self,
        voi_start: f64,
        voi_end: f64,
        data: SolverData<'_>,
        compute_rates: ComputeRatesFn,
    ) -> Result<(), SolverError>;

    /// Integrates to `voi_end`. On return `voi` holds the value reached, which equals
    /// `voi_end` on success.
    fn solve(&mut self, voi: &mut f64, voi_end: f64, data: SolverData<'_>)
        -> Result<(), SolverError>;
}

/// A solver property value as stored by settings management.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Double(f64),
}

impl PropertyValue {
    fn as_f64(self) -> f64 {
        match self {
            PropertyValue::Integer(value) => value as f64,
            PropertyValue::Double(value) => value,
        }
    }

    fn as_count(self) -> Option<usize> {
        match self {
            PropertyValue::Integer(value) => usize::try_from(value).ok(),
            PropertyValue::Double(value) if value.fract() == 0.0 && value >= 0.0 => {
                Some(value as usize)
            }
            PropertyValue::Double(_) => None,
        }
    }
}

/// Configuration of the BDF driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolverConfiguration {
    /// Largest step the integrator may take; 0 means unconstrained.
    pub maximum_step: f64,
    /// Largest number of internal steps per `solve` call.
    pub maximum_number_of_steps: usize,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
}

impl Default for SolverConfiguration {
    fn default() -> Self {
        Self {
            maximum_step: DEFAULT_MAXIMUM_STEP,
            maximum_number_of_steps: DEFAULT_MAXIMUM_NUMBER_OF_STEPS,
            relative_tolerance: DEFAULT_RELATIVE_TOLERANCE,
            absolute_tolerance: DEFAULT_ABSOLUTE_TOLERANCE,
        }
    }
}

impl SolverConfiguration {
    pub fn is_valid_property(name: &str) -> bool {
        matches!(
            name,
            MAXIMUM_STEP_PROPERTY
                | MAXIMUM_NUMBER_OF_STEPS_PROPERTY
                | RELATIVE_TOLERANCE_PROPERTY
                | ABSOLUTE_TOLERANCE_PROPERTY
        )
    }

    /// Builds a configuration from key/value properties. Missing keys take their default,
    /// unknown keys are rejected.
    pub fn from_properties(
        properties: &BTreeMap<String, PropertyValue>,
    ) -> Result<Self, ConfigurationError> {
        let mut configuration = Self::default();
        for (name, value) in properties {
            match name.as_str() {
                MAXIMUM_STEP_PROPERTY => configuration.maximum_step = value.as_f64(),
                MAXIMUM_NUMBER_OF_STEPS_PROPERTY => {
                    configuration.maximum_number_of_steps =
                        value
                            .as_count()
                            .ok_or_else(|| ConfigurationError::InvalidPropertyValue {
                                name: name.clone(),
                                expected: "a non-negative integer",
                            })?
                }
                RELATIVE_TOLERANCE_PROPERTY => configuration.relative_tolerance = value.as_f64(),
                ABSOLUTE_TOLERANCE_PROPERTY => configuration.absolute_tolerance = value.as_f64(),
                _ => return Err(ConfigurationError::UnknownProperty(name.clone())),
            }
        }
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in [
            ("relative tolerance", self.relative_tolerance),
            ("absolute tolerance", self.absolute_tolerance),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigurationError::NonPositiveTolerance { name, value });
            }
        }
        if !(self.maximum_step >= 0.0 && self.maximum_step.is_finite()) {
            return Err(ConfigurationError::InvalidMaximumStep(self.maximum_step));
        }
        if self.maximum_number_of_steps == 0 {
            return Err(ConfigurationError::InvalidMaximumNumberOfSteps);
        }
        Ok(())
    }
}

/// Which driver a simulation uses, with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SolverSettings {
    Bdf(SolverConfiguration),
    ForwardEuler { step: f64 },
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings::Bdf(SolverConfiguration::default())
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            SolverSettings::Bdf(configuration) => configuration.validate(),
            SolverSettings::ForwardEuler { step } => euler::validate_step(*step),
        }
    }

    pub fn build(&self) -> Box<dyn OdeSolver> {
        match self {
            SolverSettings::Bdf(configuration) => Box::new(BdfSolver::new(*configuration)),
            SolverSettings::ForwardEuler { step } => Box::new(ForwardEulerSolver::new(*step)),
        }
    }
}

/// Root-mean-square norm, `0` for an empty slice.
pub(crate) fn rms_norm(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    (values.map(|v| v * v).sum::<f64>() / n as f64).sqrt()
}
