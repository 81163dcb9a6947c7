//! Variable-order, variable-step BDF driver.
//!
//! The history is kept as modified backward differences `D` (one row per difference, one
//! column per state): a step of a different size rescales the rows instead of interpolating
//! past solutions. Each step predicts from `D`, corrects with a simplified Newton iteration
//! against a finite-difference Jacobian and a dense LU of `I - c·J`, then runs the error test
//! on the scaled RMS norm of the correction. The order moves between 1 and 5 once it has been
//! held for `order + 1` equal steps.

use nalgebra::{linalg::LU, DMatrix, DVector, Dyn};
use tracing::{debug, trace};

use crate::{
    errors::{ConfigurationError, IntegrationError, SolverError},
    solver::{rms_norm, OdeSolver, SolverConfiguration, SolverData},
    types::ComputeRatesFn,
};

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const MAX_ERROR_TEST_FAILURES: usize = 7;
const MAX_CONVERGENCE_FAILURES: usize = 10;
/// An LU of `I - c·J` is reused while `c` stays within this relative distance.
const LU_REUSE_RATIO: f64 = 0.3;
/// Step used when the initial step estimate is degenerate (no states, empty interval).
const FALLBACK_STEP: f64 = 1.0e-6;
const KAPPA: [f64; MAX_ORDER + 1] = [0.0, -0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0];

/// Per-order coefficients of the NDF/BDF formulas.
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    gamma: [f64; MAX_ORDER + 1],
    alpha: [f64; MAX_ORDER + 1],
    error_const: [f64; MAX_ORDER + 1],
}

impl Coefficients {
    fn new() -> Self {
        let mut gamma = [0.0; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            gamma[k] = gamma[k - 1] + 1.0 / k as f64;
        }
        Self {
            gamma,
            alpha: std::array::from_fn(|k| (1.0 - KAPPA[k]) * gamma[k]),
            error_const: std::array::from_fn(|k| KAPPA[k] * gamma[k] + 1.0 / (k + 1) as f64),
        }
    }
}

/// Settings derived from a `SolverConfiguration` when the driver is initialised.
#[derive(Debug, Clone, Copy)]
struct Method {
    coefficients: Coefficients,
    relative_tolerance: f64,
    absolute_tolerance: f64,
    max_step: f64,
    newton_tol: f64,
}

impl Method {
    fn new(configuration: &SolverConfiguration) -> Self {
        let rtol = configuration.relative_tolerance;
        Self {
            coefficients: Coefficients::new(),
            relative_tolerance: rtol,
            absolute_tolerance: configuration.absolute_tolerance,
            max_step: if configuration.maximum_step > 0.0 {
                configuration.maximum_step
            } else {
                f64::INFINITY
            },
            newton_tol: (10.0 * f64::EPSILON / rtol).max(0.03_f64.min(rtol.sqrt())),
        }
    }

    fn scale(&self, y: &DVector<f64>) -> DVector<f64> {
        y.map(|v| self.absolute_tolerance + self.relative_tolerance * v.abs())
    }
}

/// The rates function bound to the arrays of one solver call.
struct Rhs<'a> {
    compute_rates: ComputeRatesFn,
    constants: &'a [f64],
    algebraic: &'a mut [f64],
}

impl Rhs<'_> {
    /// Evaluates the rates at `(t, y)` into `out`. Returns whether every rate is finite.
    fn eval(&mut self, t: f64, y: &DVector<f64>, out: &mut DVector<f64>) -> bool {
        self.rates_at(t, y.as_slice(), out.as_mut_slice());
        out.iter().all(|v| v.is_finite())
    }

    fn rates_at(&mut self, t: f64, states: &[f64], rates: &mut [f64]) {
        (self.compute_rates)(t, self.constants, rates, states, &mut *self.algebraic);
    }
}

/// Outcome of one Newton attempt.
struct Correction {
    converged: bool,
    iterations: usize,
    y: DVector<f64>,
    d: DVector<f64>,
}

/// Integrator state between calls.
struct Integrator {
    method: Method,
    compute_rates: ComputeRatesFn,
    t: f64,
    direction: f64,
    y: DVector<f64>,
    /// Modified divided differences, `MAX_ORDER + 3` rows.
    d: Vec<DVector<f64>>,
    h_abs: f64,
    /// Step size before the last accepted step was shortened to land on an end point.
    h_abs_unclamped: Option<f64>,
    order: usize,
    n_equal_steps: usize,
    jacobian: DMatrix<f64>,
    /// Factorisation of `I - c·J` with the `c` it was computed for.
    lu: Option<(f64, LU<f64, Dyn, Dyn>)>,
}

impl Integrator {
    fn new(n: usize, method: Method, compute_rates: ComputeRatesFn) -> Self {
        Self {
            method,
            compute_rates,
            t: 0.0,
            direction: 1.0,
            y: DVector::zeros(n),
            d: vec![DVector::zeros(n); MAX_ORDER + 3],
            h_abs: 0.0,
            h_abs_unclamped: None,
            order: 1,
            n_equal_steps: 0,
            jacobian: DMatrix::zeros(n, n),
            lu: None,
        }
    }

    /// Restarts at `(t, y)` with order 1, reusing the allocated buffers.
    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        method: Method,
        compute_rates: ComputeRatesFn,
        t: f64,
        direction: f64,
        y: &[f64],
        f0: &DVector<f64>,
        h_abs: f64,
    ) {
        self.method = method;
        self.compute_rates = compute_rates;
        self.t = t;
        self.direction = direction;
        self.y.copy_from_slice(y);
        for row in self.d.iter_mut() {
            row.fill(0.0);
        }
        self.d[0].copy_from(&self.y);
        self.d[1].copy_from(f0);
        self.d[1] *= h_abs * direction;
        self.h_abs = h_abs;
        self.h_abs_unclamped = None;
        self.order = 1;
        self.n_equal_steps = 0;
        self.lu = None;
    }

    fn n(&self) -> usize {
        self.y.len()
    }

    /// Forward-difference Jacobian of the rates at `(t, y)`, where `f0` holds the rates there.
    fn refresh_jacobian(&mut self, rhs: &mut Rhs<'_>, t: f64, y: &DVector<f64>, f0: &DVector<f64>) {
        let sqrt_eps = f64::EPSILON.sqrt();
        let mut perturbed = y.clone();
        let mut f = DVector::zeros(self.n());
        for j in 0..self.n() {
            let yj = y[j];
            let inc = sqrt_eps
                * yj.abs()
                    .max(self.h_abs * f0[j].abs())
                    .max(self.method.absolute_tolerance);
            perturbed[j] = yj + inc;
            let inc = perturbed[j] - yj;
            rhs.eval(t, &perturbed, &mut f);
            self.jacobian.set_column(j, &((&f - f0) / inc));
            perturbed[j] = yj;
        }
        self.lu = None;
    }

    fn rescale(&mut self, factor: f64) {
        change_d(&mut self.d, self.order, factor);
        self.n_equal_steps = 0;
    }

    /// Gives back the growth lost when the previous call shortened its last step.
    fn restore_step(&mut self) {
        if let Some(h) = self.h_abs_unclamped.take() {
            if h > self.h_abs && self.h_abs > 0.0 {
                let factor = (h / self.h_abs).min(MAX_FACTOR);
                self.rescale(factor);
                self.h_abs *= factor;
            }
        }
    }

    /// Steps until `t_bound` is reached. Returns the number of steps taken.
    fn advance(
        &mut self,
        rhs: &mut Rhs<'_>,
        t_bound: f64,
        max_steps: usize,
    ) -> Result<usize, IntegrationError> {
        if self.n() == 0 {
            self.t = t_bound;
            return Ok(0);
        }
        self.restore_step();

        let mut steps = 0;
        while self.direction * (t_bound - self.t) > 0.0 {
            if steps == max_steps {
                return Err(IntegrationError::TooMuchWork {
                    voi: self.t,
                    voi_end: t_bound,
                    steps,
                });
            }
            self.step(rhs, t_bound)?;
            steps += 1;
        }
        Ok(steps)
    }

    fn step(&mut self, rhs: &mut Rhs<'_>, t_bound: f64) -> Result<(), IntegrationError> {
        let n = self.n();
        let t = self.t;
        let Method {
            coefficients,
            max_step,
            newton_tol,
            ..
        } = self.method;
        let min_step = 10.0 * spacing(t);

        let mut h_abs = self.h_abs;
        if h_abs > max_step {
            self.rescale(max_step / h_abs);
            h_abs = max_step;
        } else if h_abs < min_step {
            self.rescale(min_step / h_abs);
            h_abs = min_step;
        }

        let mut error_test_failures = 0;
        let mut convergence_failures = 0;
        let mut current_jacobian = false;
        let mut clamped_from = None;
        let mut f = DVector::zeros(n);

        let (t_new, correction, scale, safety, error_norm) = loop {
            if h_abs < min_step {
                return Err(IntegrationError::StepTooSmall {
                    voi: t,
                    minimum: min_step,
                });
            }

            let mut t_new = t + self.direction * h_abs;
            if self.direction * (t_new - t_bound) > 0.0 {
                t_new = t_bound;
                self.rescale((t_new - t).abs() / h_abs);
                clamped_from = Some(h_abs);
            }
            let h = t_new - t;
            h_abs = h.abs();

            let order = self.order;
            let y_predict = self.d[..=order]
                .iter()
                .fold(DVector::<f64>::zeros(n), |acc, row| acc + row);
            let scale = self.method.scale(&y_predict);
            let mut psi = DVector::zeros(n);
            for k in 1..=order {
                psi.axpy(coefficients.gamma[k], &self.d[k], 1.0);
            }
            psi /= coefficients.alpha[order];
            let c = h / coefficients.alpha[order];

            let correction = loop {
                let (c_lu, lu) = match self.lu.take() {
                    Some((c_lu, lu)) if (c / c_lu - 1.0).abs() <= LU_REUSE_RATIO => (c_lu, lu),
                    _ => (c, (DMatrix::identity(n, n) - &self.jacobian * c).lu()),
                };
                let correction = newton(rhs, t_new, &y_predict, c, &psi, &lu, &scale, newton_tol);
                self.lu = Some((c_lu, lu));
                if correction.converged || current_jacobian {
                    break correction;
                }
                rhs.eval(t_new, &y_predict, &mut f);
                self.refresh_jacobian(rhs, t_new, &y_predict, &f);
                current_jacobian = true;
            };

            if !correction.converged {
                convergence_failures += 1;
                trace!(voi = t, h = h_abs, convergence_failures, "corrector did not converge");
                if convergence_failures >= MAX_CONVERGENCE_FAILURES {
                    return Err(IntegrationError::ConvergenceFailure { voi: t, step: h_abs });
                }
                h_abs *= 0.5;
                self.rescale(0.5);
                self.lu = None;
                clamped_from = None;
                continue;
            }

            let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
                / (2 * NEWTON_MAXITER + correction.iterations) as f64;
            let scale = self.method.scale(&correction.y);
            let error = &correction.d * coefficients.error_const[order];
            let error_norm = scaled_norm(&error, &scale);

            if !(error_norm <= 1.0) {
                error_test_failures += 1;
                trace!(voi = t, h = h_abs, error_norm, error_test_failures, "step rejected");
                if error_test_failures >= MAX_ERROR_TEST_FAILURES {
                    return Err(IntegrationError::ErrorTestFailure { voi: t, step: h_abs });
                }
                let factor = if error_norm.is_finite() {
                    MIN_FACTOR.max(safety * error_norm.powf(-1.0 / (order + 1) as f64))
                } else {
                    MIN_FACTOR
                };
                h_abs *= factor;
                self.rescale(factor);
                clamped_from = None;
                continue;
            }

            break (t_new, correction, scale, safety, error_norm);
        };

        self.n_equal_steps += 1;
        self.t = t_new;
        self.h_abs = h_abs;
        self.h_abs_unclamped = clamped_from;
        let Correction { y, d, .. } = correction;
        self.y = y;

        let order = self.order;
        self.d[order + 2] = &d - &self.d[order + 1];
        self.d[order + 1] = d;
        for i in (0..=order).rev() {
            let (head, tail) = self.d.split_at_mut(i + 1);
            head[i] += &tail[0];
        }

        if self.n_equal_steps < order + 1 {
            return Ok(());
        }

        let error_m_norm = if order > 1 {
            scaled_norm(&(&self.d[order] * coefficients.error_const[order - 1]), &scale)
        } else {
            f64::INFINITY
        };
        let error_p_norm = if order < MAX_ORDER {
            scaled_norm(
                &(&self.d[order + 2] * coefficients.error_const[order + 1]),
                &scale,
            )
        } else {
            f64::INFINITY
        };
        let norms = [error_m_norm, error_norm, error_p_norm];
        let factors: [f64; 3] = std::array::from_fn(|i| norms[i].powf(-1.0 / (order + i) as f64));
        let (best, best_factor) = factors
            .iter()
            .copied()
            .enumerate()
            .fold((1, factors[1]), |(bi, bf), (i, f)| if f > bf { (i, f) } else { (bi, bf) });

        let new_order = order + best - 1;
        if new_order != order {
            trace!(voi = self.t, from = order, to = new_order, "order changed");
        }
        self.order = new_order;
        let factor = MAX_FACTOR.min(safety * best_factor);
        self.h_abs *= factor;
        if let Some(h) = self.h_abs_unclamped.as_mut() {
            *h *= factor;
        }
        self.rescale(factor);
        Ok(())
    }
}

/// Simplified Newton iteration on the BDF system at `t_new`.
#[allow(clippy::too_many_arguments)]
fn newton(
    rhs: &mut Rhs<'_>,
    t_new: f64,
    y_predict: &DVector<f64>,
    c: f64,
    psi: &DVector<f64>,
    lu: &LU<f64, Dyn, Dyn>,
    scale: &DVector<f64>,
    tol: f64,
) -> Correction {
    let n = y_predict.len();
    let mut y = y_predict.clone();
    let mut d = DVector::zeros(n);
    let mut f = DVector::zeros(n);
    let mut dy_norm_old: Option<f64> = None;
    let mut converged = false;
    let mut iterations = 0;

    for k in 0..NEWTON_MAXITER {
        iterations = k + 1;
        if !rhs.eval(t_new, &y, &mut f) {
            break;
        }
        let Some(dy) = lu.solve(&(&f * c - psi - &d)) else {
            break;
        };
        let dy_norm = scaled_norm(&dy, scale);
        if !dy_norm.is_finite() {
            break;
        }
        let rate = dy_norm_old.map(|old| dy_norm / old);
        if let Some(rate) = rate {
            if rate >= 1.0
                || rate.powi((NEWTON_MAXITER - k) as i32) / (1.0 - rate) * dy_norm > tol
            {
                break;
            }
        }
        y += &dy;
        d += &dy;
        if dy_norm == 0.0 || rate.is_some_and(|rate| rate / (1.0 - rate) * dy_norm < tol) {
            converged = true;
            break;
        }
        dy_norm_old = Some(dy_norm);
    }

    Correction {
        converged,
        iterations,
        y,
        d,
    }
}

/// Empirical first step for an order 1 method.
fn select_initial_step(
    rhs: &mut Rhs<'_>,
    t0: f64,
    y0: &DVector<f64>,
    f0: &DVector<f64>,
    direction: f64,
    t_bound: f64,
    method: &Method,
) -> f64 {
    if y0.is_empty() {
        return f64::INFINITY;
    }
    let interval_length = (t_bound - t0).abs();
    if interval_length == 0.0 {
        return 0.0;
    }

    let scale = method.scale(y0);
    let d0 = scaled_norm(y0, &scale);
    let d1 = scaled_norm(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(interval_length);

    let y1 = y0 + f0 * (h0 * direction);
    let mut f1 = DVector::zeros(y0.len());
    rhs.eval(t0 + h0 * direction, &y1, &mut f1);
    let d2 = scaled_norm(&(f1 - f0), &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        1e-6_f64.max(h0 * 1e-3)
    } else {
        (0.01 / d1.max(d2)).sqrt()
    };
    (100.0 * h0).min(h1).min(interval_length)
}

/// Transformation of the difference rows for a step size change by `factor`.
fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let mut r = DMatrix::zeros(order + 1, order + 1);
    r.row_mut(0).fill(1.0);
    for i in 1..=order {
        for j in 1..=order {
            r[(i, j)] = r[(i - 1, j)] * (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    r
}

fn change_d(d: &mut [DVector<f64>], order: usize, factor: f64) {
    let ru = compute_r(order, factor) * compute_r(order, 1.0);
    let old = d[..=order].to_vec();
    for (i, row) in d[..=order].iter_mut().enumerate() {
        row.fill(0.0);
        for (j, previous) in old.iter().enumerate() {
            row.axpy(ru[(j, i)], previous, 1.0);
        }
    }
}

fn scaled_norm(values: &DVector<f64>, scale: &DVector<f64>) -> f64 {
    rms_norm(values.iter().zip(scale.iter()).map(|(v, s)| v / s))
}

/// Distance from `t` to the next representable double away from zero.
fn spacing(t: f64) -> f64 {
    let t = t.abs();
    f64::from_bits(t.to_bits() + 1) - t
}

/// Variable-order BDF driver for stiff systems.
pub struct BdfSolver {
    configuration: SolverConfiguration,
    integrator: Option<Integrator>,
}

impl BdfSolver {
    pub fn new(configuration: SolverConfiguration) -> Self {
        Self {
            configuration,
            integrator: None,
        }
    }

    pub fn configuration(&self) -> &SolverConfiguration {
        &self.configuration
    }

    /// Order the next step will be attempted with, once initialised.
    pub fn order(&self) -> Option<usize> {
        self.integrator.as_ref().map(|integrator| integrator.order)
    }
}

impl Default for BdfSolver {
    fn default() -> Self {
        Self::new(SolverConfiguration::default())
    }
}

impl OdeSolver for BdfSolver {
    fn name(&self) -> &'static str {
        "BDF"
    }

    fn is_valid_property(&self, name: &str) -> bool {
        SolverConfiguration::is_valid_property(name)
    }

    fn initialize(
        &mut self,
        voi_start: f64,
        voi_end: f64,
        data: SolverData<'_>,
        compute_rates: ComputeRatesFn,
    ) -> Result<(), SolverError> {
        self.configuration.validate()?;
        if !(voi_start.is_finite() && voi_end.is_finite()) {
            return Err(ConfigurationError::InvalidRange {
                start: voi_start,
                end: voi_end,
            }
            .into());
        }
        let n = data.states.len();
        data.check_len(n)?;

        let method = Method::new(&self.configuration);
        let SolverData {
            constants,
            rates,
            states,
            algebraic,
        } = data;
        let mut rhs = Rhs {
            compute_rates: compute_rates.clone(),
            constants,
            algebraic,
        };

        rhs.rates_at(voi_start, states, rates);
        if rates.iter().any(|rate| !rate.is_finite()) {
            return Err(IntegrationError::NonFiniteRates { voi: voi_start }.into());
        }
        let y0 = DVector::from_column_slice(states);
        let f0 = DVector::from_column_slice(rates);
        let direction = if voi_end >= voi_start { 1.0 } else { -1.0 };

        let h_abs = select_initial_step(&mut rhs, voi_start, &y0, &f0, direction, voi_end, &method)
            .min(method.max_step);
        let h_abs = if h_abs > 0.0 && h_abs.is_finite() {
            h_abs
        } else {
            FALLBACK_STEP.min(method.max_step)
        };

        let integrator = match self.integrator.take() {
            Some(integrator) if integrator.n() == n => {
                debug!(solver = "BDF", voi_start, voi_end, states = n, "reinitialised");
                integrator
            }
            _ => {
                debug!(solver = "BDF", voi_start, voi_end, states = n, "initialised");
                Integrator::new(n, method, compute_rates.clone())
            }
        };
        let integrator = self.integrator.insert(integrator);
        integrator.start(method, compute_rates, voi_start, direction, states, &f0, h_abs);
        integrator.refresh_jacobian(&mut rhs, voi_start, &y0, &f0);

        // Leave rates and algebraic evaluated at the start point.
        rhs.rates_at(voi_start, states, rates);
        Ok(())
    }

    /// Integration continues from the point reached by the previous call (or from
    /// `voi_start`), so the incoming value of `voi` is only overwritten.
    fn solve(
        &mut self,
        voi: &mut f64,
        voi_end: f64,
        data: SolverData<'_>,
    ) -> Result<(), SolverError> {
        let integrator = self.integrator.as_mut().ok_or(SolverError::NotInitialized)?;
        data.check_len(integrator.n())?;
        if !voi_end.is_finite() || integrator.direction * (voi_end - integrator.t) < 0.0 {
            return Err(ConfigurationError::InvalidRange {
                start: integrator.t,
                end: voi_end,
            }
            .into());
        }

        let SolverData {
            constants,
            rates,
            states,
            algebraic,
        } = data;
        let mut rhs = Rhs {
            compute_rates: integrator.compute_rates.clone(),
            constants,
            algebraic,
        };
        let result = integrator.advance(
            &mut rhs,
            voi_end,
            self.configuration.maximum_number_of_steps,
        );

        states.copy_from_slice(integrator.y.as_slice());
        *voi = integrator.t;
        rhs.rates_at(integrator.t, states, rates);

        match result {
            Ok(steps) => {
                trace!(voi = integrator.t, steps, order = integrator.order, "interval done");
                Ok(())
            }
            Err(err) => {
                debug!(voi = integrator.t, %err, "integration failed");
                Err(err.into())
            }
        }
    }
}
