//! Fixed-step forward Euler driver.
//!
//! Each step advances the states by `step * rates`. There is no error control, so the
//! accuracy depends on the step alone. Suited to non-stiff models and quick checks.

use tracing::debug;

use crate::{
    errors::{ConfigurationError, IntegrationError, SolverError},
    solver::{OdeSolver, SolverData},
    types::ComputeRatesFn,
};

/// Name of the step property in key/value solver settings.
pub const STEP_PROPERTY: &str = "Step";
pub const DEFAULT_STEP: f64 = 1.0;

/// A step must be positive and finite.
pub(super) fn validate_step(step: f64) -> Result<(), ConfigurationError> {
    if step > 0.0 && step.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidStep(step))
    }
}

/// Fixed-step explicit Euler driver.
///
/// The last step of every `solve` call is shortened so that it lands exactly on `voi_end`.
pub struct ForwardEulerSolver {
    step: f64,
    compute_rates: Option<ComputeRatesFn>,
    voi: f64,
}

impl ForwardEulerSolver {
    /// Creates a driver taking steps of `step`.
    ///
    /// The step is checked by [`OdeSolver::initialize`], so an invalid one is reported as a
    /// configuration error at that point.
    pub fn new(step: f64) -> Self {
        Self {
            step,
            compute_rates: None,
            voi: 0.0,
        }
    }

    /// Size of every step but the last one of a `solve` call.
    pub fn step(&self) -> f64 {
        self.step
    }
}

impl Default for ForwardEulerSolver {
    fn default() -> Self {
        Self::new(DEFAULT_STEP)
    }
}

impl OdeSolver for ForwardEulerSolver {
    fn name(&self) -> &'static str {
        "Forward Euler"
    }

    fn is_valid_property(&self, name: &str) -> bool {
        name == STEP_PROPERTY
    }

    fn initialize(
        &mut self,
        voi_start: f64,
        voi_end: f64,
        data: SolverData<'_>,
        compute_rates: ComputeRatesFn,
    ) -> Result<(), SolverError> {
        validate_step(self.step)?;
        if !(voi_start.is_finite() && voi_end.is_finite() && voi_end >= voi_start) {
            return Err(ConfigurationError::InvalidRange {
                start: voi_start,
                end: voi_end,
            }
            .into());
        }
        data.check_len(data.states.len())?;

        compute_rates(
            voi_start,
            data.constants,
            &mut *data.rates,
            &*data.states,
            &mut *data.algebraic,
        );
        debug!(
            solver = "Forward Euler",
            voi_start,
            step = self.step,
            states = data.states.len(),
            "initialised"
        );
        self.compute_rates = Some(compute_rates);
        self.voi = voi_start;
        Ok(())
    }

    fn solve(
        &mut self,
        voi: &mut f64,
        voi_end: f64,
        data: SolverData<'_>,
    ) -> Result<(), SolverError> {
        let compute_rates = self
            .compute_rates
            .as_ref()
            .ok_or(SolverError::NotInitialized)?;
        let SolverData {
            constants,
            rates,
            states,
            algebraic,
        } = data;
        if rates.len() != states.len() {
            return Err(ConfigurationError::ArrayLength {
                array: "rates",
                expected: states.len(),
                got: rates.len(),
            }
            .into());
        }
        if !(voi_end.is_finite() && voi_end >= self.voi) {
            return Err(ConfigurationError::InvalidRange {
                start: self.voi,
                end: voi_end,
            }
            .into());
        }

        compute_rates(self.voi, constants, &mut *rates, &*states, &mut *algebraic);
        while self.voi < voi_end {
            if rates.iter().any(|rate| !rate.is_finite()) {
                *voi = self.voi;
                return Err(IntegrationError::NonFiniteRates { voi: self.voi }.into());
            }
            let h = self.step.min(voi_end - self.voi);
            for (state, rate) in states.iter_mut().zip(rates.iter()) {
                *state += h * rate;
            }
            self.voi = if h < self.step { voi_end } else { self.voi + h };
            compute_rates(self.voi, constants, &mut *rates, &*states, &mut *algebraic);
        }

        *voi = self.voi;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    struct Arrays {
        constants: Vec<f64>,
        rates: Vec<f64>,
        states: Vec<f64>,
        algebraic: Vec<f64>,
    }

    impl Arrays {
        fn new(states: Vec<f64>) -> Self {
            Self {
                constants: Vec::new(),
                rates: vec![0.0; states.len()],
                states,
                algebraic: Vec::new(),
            }
        }

        fn data(&mut self) -> SolverData<'_> {
            SolverData {
                constants: &self.constants,
                rates: &mut self.rates,
                states: &mut self.states,
                algebraic: &mut self.algebraic,
            }
        }
    }

    fn decay() -> ComputeRatesFn {
        Arc::new(|_voi, _constants, rates, states, _algebraic| rates[0] = -states[0])
    }

    #[test]
    fn test_validate_step() {
        assert!(validate_step(0.1).is_ok());
        assert_eq!(validate_step(0.0), Err(ConfigurationError::InvalidStep(0.0)));
        assert!(validate_step(-1.0).is_err());
        assert!(validate_step(f64::NAN).is_err());
    }

    #[test]
    fn test_is_valid_property() {
        let solver = ForwardEulerSolver::default();
        assert!(solver.is_valid_property("Step"));
        assert!(!solver.is_valid_property("RelativeTolerance"));
        assert_eq!(solver.step(), DEFAULT_STEP);
    }

    #[test]
    fn test_exponential_decay() {
        let mut solver = ForwardEulerSolver::new(1e-4);
        let mut arrays = Arrays::new(vec![1.0]);
        solver.initialize(0.0, 1.0, arrays.data(), decay()).unwrap();

        let mut voi = 0.0;
        solver.solve(&mut voi, 1.0, arrays.data()).unwrap();

        assert_eq!(voi, 1.0);
        assert_relative_eq!(arrays.states[0], (-1.0_f64).exp(), max_relative = 1e-3);
        assert_eq!(arrays.rates[0], -arrays.states[0]);
    }

    #[test]
    fn test_last_step_lands_on_end() {
        let mut solver = ForwardEulerSolver::new(0.3);
        let mut arrays = Arrays::new(vec![0.0]);
        let rates_fn: ComputeRatesFn = Arc::new(|_, _, rates, _, _| rates[0] = 1.0);
        solver.initialize(0.0, 1.0, arrays.data(), rates_fn).unwrap();

        let mut voi = 0.0;
        for end in [0.5, 1.0] {
            solver.solve(&mut voi, end, arrays.data()).unwrap();
            assert_eq!(voi, end);
        }
        assert_relative_eq!(arrays.states[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_step_is_rejected_at_initialize() {
        let mut solver = ForwardEulerSolver::new(0.0);
        let mut arrays = Arrays::new(vec![1.0]);
        assert_eq!(
            solver.initialize(0.0, 1.0, arrays.data(), decay()),
            Err(SolverError::Configuration(ConfigurationError::InvalidStep(0.0)))
        );
    }

    #[test]
    fn test_non_finite_rates() {
        let mut solver = ForwardEulerSolver::new(0.1);
        let mut arrays = Arrays::new(vec![1.0]);
        let rates_fn: ComputeRatesFn =
            Arc::new(|voi, _, rates, _, _| rates[0] = if voi > 0.25 { f64::NAN } else { 1.0 });
        solver.initialize(0.0, 1.0, arrays.data(), rates_fn).unwrap();

        let mut voi = 0.0;
        let result = solver.solve(&mut voi, 1.0, arrays.data());
        assert!(matches!(
            result,
            Err(SolverError::Integration(IntegrationError::NonFiniteRates { .. }))
        ));
        assert!(voi > 0.25 && voi < 1.0);
    }

    #[test]
    fn test_solve_before_initialize() {
        let mut solver = ForwardEulerSolver::default();
        let mut arrays = Arrays::new(vec![1.0]);
        let mut voi = 0.0;
        assert_eq!(
            solver.solve(&mut voi, 1.0, arrays.data()),
            Err(SolverError::NotInitialized)
        );
    }
}
