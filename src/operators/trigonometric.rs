//! Circular and hyperbolic functions, their reciprocals and inverses.
//!
//! Reciprocal functions are defined through their base function (`sec(x) = 1 / cos(x)`) and
//! their inverses through the reciprocal argument (`asec(x) = acos(1 / x)`), so results keep
//! the principal branches of the platform math library.

pub extern "C" fn sin(x: f64) -> f64 {
    x.sin()
}

pub extern "C" fn cos(x: f64) -> f64 {
    x.cos()
}

pub extern "C" fn tan(x: f64) -> f64 {
    x.tan()
}

pub extern "C" fn sec(x: f64) -> f64 {
    1.0 / x.cos()
}

pub extern "C" fn csc(x: f64) -> f64 {
    1.0 / x.sin()
}

pub extern "C" fn cot(x: f64) -> f64 {
    1.0 / x.tan()
}

pub extern "C" fn sinh(x: f64) -> f64 {
    x.sinh()
}

pub extern "C" fn cosh(x: f64) -> f64 {
    x.cosh()
}

pub extern "C" fn tanh(x: f64) -> f64 {
    x.tanh()
}

pub extern "C" fn sech(x: f64) -> f64 {
    1.0 / x.cosh()
}

pub extern "C" fn csch(x: f64) -> f64 {
    1.0 / x.sinh()
}

pub extern "C" fn coth(x: f64) -> f64 {
    1.0 / x.tanh()
}

pub extern "C" fn asin(x: f64) -> f64 {
    x.asin()
}

pub extern "C" fn acos(x: f64) -> f64 {
    x.acos()
}

pub extern "C" fn atan(x: f64) -> f64 {
    x.atan()
}

pub extern "C" fn asec(x: f64) -> f64 {
    (1.0 / x).acos()
}

pub extern "C" fn acsc(x: f64) -> f64 {
    (1.0 / x).asin()
}

/// Principal value in `(-pi/2, pi/2]`; `acot(0) = pi/2`.
pub extern "C" fn acot(x: f64) -> f64 {
    (1.0 / x).atan()
}

pub extern "C" fn asinh(x: f64) -> f64 {
    x.asinh()
}

pub extern "C" fn acosh(x: f64) -> f64 {
    x.acosh()
}

pub extern "C" fn atanh(x: f64) -> f64 {
    x.atanh()
}

pub extern "C" fn asech(x: f64) -> f64 {
    (1.0 / x).acosh()
}

pub extern "C" fn acsch(x: f64) -> f64 {
    (1.0 / x).asinh()
}

pub extern "C" fn acoth(x: f64) -> f64 {
    (1.0 / x).atanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_3, FRAC_PI_4};

    #[test]
    fn test_reciprocal_functions() {
        assert_relative_eq!(sec(FRAC_PI_3), 2.0, epsilon = 1e-12);
        assert_relative_eq!(csc(FRAC_PI_2), 1.0);
        assert_relative_eq!(cot(FRAC_PI_4), 1.0, epsilon = 1e-12);
        assert_relative_eq!(sech(0.0), 1.0);
        assert_relative_eq!(csch(1.0), 1.0 / 1.0_f64.sinh());
        assert_relative_eq!(coth(2.0), 2.0_f64.cosh() / 2.0_f64.sinh(), epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trips() {
        for &x in &[0.1, 0.5, 0.9] {
            assert_relative_eq!(sec(asec(1.0 / x)), 1.0 / x, epsilon = 1e-12);
            assert_relative_eq!(csc(acsc(1.0 / x)), 1.0 / x, epsilon = 1e-12);
            assert_relative_eq!(cot(acot(x)), x, epsilon = 1e-12);
            assert_relative_eq!(sech(asech(x)), x, epsilon = 1e-12);
            assert_relative_eq!(csch(acsch(x)), x, epsilon = 1e-12);
            assert_relative_eq!(coth(acoth(1.0 / x)), 1.0 / x, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_principal_branches() {
        assert_relative_eq!(acot(0.0), FRAC_PI_2);
        assert!(acot(-1.0) < 0.0);
        assert_relative_eq!(asec(-1.0), std::f64::consts::PI);
        assert!(acosh(0.5).is_nan());
        assert!(asech(2.0).is_nan());
        assert!(acoth(0.5).is_nan());
    }
}
