//! Elementary functions: absolute value, logarithms, rounding, powers and factorial.
//!
//! The `extern "C"` functions are what compiled code calls. Functions with a restricted domain
//! also have a `Result`-returning Rust entry point; their C-callable shims map domain errors
//! to NaN.

use crate::errors::MathError;

/// Largest `n` for which `n!` is finite in double precision.
const MAX_FACTORIAL: f64 = 170.0;

pub extern "C" fn fabs(x: f64) -> f64 {
    x.abs()
}

/// Natural logarithm.
pub extern "C" fn log(x: f64) -> f64 {
    x.ln()
}

pub extern "C" fn exp(x: f64) -> f64 {
    x.exp()
}

pub extern "C" fn floor(x: f64) -> f64 {
    x.floor()
}

pub extern "C" fn ceil(x: f64) -> f64 {
    x.ceil()
}

pub extern "C" fn sqrt(x: f64) -> f64 {
    x.sqrt()
}

pub extern "C" fn pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// `n!` for non-negative integral `n`.
///
/// Negative, non-integral and NaN inputs are domain errors. Inputs above 170 overflow to
/// `+inf`.
pub fn factorial(n: f64) -> Result<f64, MathError> {
    if n.is_nan() || n < 0.0 || n.fract() != 0.0 {
        return Err(MathError::Domain {
            function: "factorial",
            value: n,
        });
    }
    if n > MAX_FACTORIAL {
        return Ok(f64::INFINITY);
    }

    Ok((2..=n as u32).fold(1.0, |acc, k| acc * k as f64))
}

pub extern "C" fn compiler_factorial(n: f64) -> f64 {
    factorial(n).unwrap_or(f64::NAN)
}

/// Logarithm of `x` in base `base`, `ln(x) / ln(base)`.
///
/// Undefined when `base <= 0`, `base == 1` or `x <= 0`.
pub fn arbitrary_log(x: f64, base: f64) -> Result<f64, MathError> {
    if base.is_nan() || base <= 0.0 || base == 1.0 {
        return Err(MathError::Domain {
            function: "arbitrary_log base",
            value: base,
        });
    }
    if x.is_nan() || x <= 0.0 {
        return Err(MathError::Domain {
            function: "arbitrary_log",
            value: x,
        });
    }

    Ok(x.ln() / base.ln())
}

pub extern "C" fn compiler_arbitrary_log(x: f64, base: f64) -> f64 {
    arbitrary_log(x, base).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_factorial() {
        assert_eq!(factorial(0.0), Ok(1.0));
        assert_eq!(factorial(1.0), Ok(1.0));
        assert_eq!(factorial(5.0), Ok(120.0));
        assert_relative_eq!(factorial(20.0).unwrap(), 2_432_902_008_176_640_000.0);
        assert!(factorial(170.0).unwrap().is_finite());
        assert_eq!(factorial(171.0), Ok(f64::INFINITY));
    }

    #[test]
    fn test_factorial_domain() {
        assert!(matches!(factorial(-1.0), Err(MathError::Domain { .. })));
        assert!(matches!(factorial(2.5), Err(MathError::Domain { .. })));
        assert!(factorial(f64::NAN).is_err());
        assert!(compiler_factorial(-3.0).is_nan());
        assert_eq!(compiler_factorial(4.0), 24.0);
    }

    #[test]
    fn test_arbitrary_log() {
        assert_relative_eq!(arbitrary_log(8.0, 2.0).unwrap(), 3.0);
        assert_relative_eq!(arbitrary_log(1000.0, 10.0).unwrap(), 3.0, epsilon = 1e-12);
        assert_relative_eq!(arbitrary_log(0.25, 2.0).unwrap(), -2.0);
    }

    #[test]
    fn test_arbitrary_log_round_trip() {
        for &x in &[1e-6, 0.3, 1.0, 2.5, 17.0, 1e9] {
            for &base in &[0.5, 2.0, std::f64::consts::E, 10.0, 123.4] {
                let log = arbitrary_log(x, base).unwrap();
                assert_relative_eq!(pow(base, log), x, max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn test_arbitrary_log_domain() {
        assert!(arbitrary_log(2.0, 1.0).is_err());
        assert!(arbitrary_log(2.0, 0.0).is_err());
        assert!(arbitrary_log(2.0, -2.0).is_err());
        assert!(arbitrary_log(0.0, 2.0).is_err());
        assert!(arbitrary_log(-1.0, 2.0).is_err());
        assert!(compiler_arbitrary_log(-1.0, 2.0).is_nan());
    }
}
