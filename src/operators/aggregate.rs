//! Functions over a variable number of arguments: minimum, maximum, gcd and lcm.
//!
//! Compiled code calls the `compiler_*` shims with a count and a pointer to that many
//! doubles. A count of zero or less yields NaN.

use crate::errors::MathError;

/// Smallest of the values. NaN if any value is NaN.
pub fn multi_min(values: &[f64]) -> Result<f64, MathError> {
    values
        .iter()
        .copied()
        .reduce(|a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) })
        .ok_or(MathError::EmptyArguments("multi_min"))
}

/// Largest of the values. NaN if any value is NaN.
pub fn multi_max(values: &[f64]) -> Result<f64, MathError> {
    values
        .iter()
        .copied()
        .reduce(|a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) })
        .ok_or(MathError::EmptyArguments("multi_max"))
}

/// Greatest common divisor of the values rounded to the nearest integer.
///
/// Works on absolute values; `gcd(0, 0) = 0`.
pub fn gcd_multi(values: &[f64]) -> Result<f64, MathError> {
    values
        .iter()
        .map(|v| v.round().abs())
        .reduce(gcd)
        .ok_or(MathError::EmptyArguments("gcd_multi"))
}

/// Least common multiple of the values rounded to the nearest integer.
///
/// Works on absolute values; any zero input gives 0.
pub fn lcm_multi(values: &[f64]) -> Result<f64, MathError> {
    values
        .iter()
        .map(|v| v.round().abs())
        .reduce(|a, b| {
            if a == 0.0 || b == 0.0 {
                0.0
            } else {
                a / gcd(a, b) * b
            }
        })
        .ok_or(MathError::EmptyArguments("lcm_multi"))
}

fn gcd(mut a: f64, mut b: f64) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return f64::NAN;
    }
    while b != 0.0 {
        (a, b) = (b, a % b);
    }
    a
}

/// # Safety
/// `values` must point to `count` initialised doubles when `count > 0`.
unsafe fn arguments<'a>(count: i32, values: *const f64) -> &'a [f64] {
    match usize::try_from(count) {
        Ok(len) if len > 0 && !values.is_null() => std::slice::from_raw_parts(values, len),
        _ => &[],
    }
}

/// # Safety
/// See [`arguments`].
pub unsafe extern "C" fn compiler_multi_min(count: i32, values: *const f64) -> f64 {
    multi_min(arguments(count, values)).unwrap_or(f64::NAN)
}

/// # Safety
/// See [`arguments`].
pub unsafe extern "C" fn compiler_multi_max(count: i32, values: *const f64) -> f64 {
    multi_max(arguments(count, values)).unwrap_or(f64::NAN)
}

/// # Safety
/// See [`arguments`].
pub unsafe extern "C" fn compiler_gcd_multi(count: i32, values: *const f64) -> f64 {
    gcd_multi(arguments(count, values)).unwrap_or(f64::NAN)
}

/// # Safety
/// See [`arguments`].
pub unsafe extern "C" fn compiler_lcm_multi(count: i32, values: *const f64) -> f64 {
    lcm_multi(arguments(count, values)).unwrap_or(f64::NAN)
}
