use std::fmt;
use std::sync::Arc;

use crate::expr::ArrayKind;

/// Type alias for a rates callback as seen by the solvers.
///
/// Arguments are `(voi, constants, rates, states, algebraic)`: the callback reads `voi`,
/// `constants` and `states` and writes `rates` and `algebraic`. Both compiled functions and
/// plain closures can be used.
pub type ComputeRatesFn = Arc<dyn Fn(f64, &[f64], &mut [f64], &[f64], &mut [f64]) + Send + Sync>;

/// Native signature of every compiled function.
pub(crate) type RawFunction = unsafe extern "C" fn(f64, *const f64, *mut f64, *const f64, *mut f64);

/// Lengths of the arrays a function is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArrayLayout {
    pub constants: usize,
    pub rates: usize,
    pub states: usize,
    pub algebraic: usize,
}

impl ArrayLayout {
    /// A layout with one rate per state.
    pub fn new(constants: usize, states: usize, algebraic: usize) -> Self {
        Self {
            constants,
            rates: states,
            states,
            algebraic,
        }
    }

    /// Length of `array`, or `None` for the variable of integration.
    pub fn len(&self, array: ArrayKind) -> Option<usize> {
        match array {
            ArrayKind::Voi => None,
            ArrayKind::Constants => Some(self.constants),
            ArrayKind::Rates => Some(self.rates),
            ArrayKind::States => Some(self.states),
            ArrayKind::Algebraic => Some(self.algebraic),
        }
    }
}

/// Handle to a natively compiled function.
///
/// The code lives in its compiler's JIT module, which never frees code while the process
/// runs, so handles can be cloned freely and shared between threads.
#[derive(Clone)]
pub struct CompiledFunction {
    name: Arc<str>,
    layout: ArrayLayout,
    code: RawFunction,
}

impl CompiledFunction {
    pub(crate) fn new(name: &str, layout: ArrayLayout, code: RawFunction) -> Self {
        Self {
            name: name.into(),
            layout,
            code,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> ArrayLayout {
        self.layout
    }

    /// Runs the function.
    ///
    /// # Panics
    /// Panics if a slice length differs from the layout the function was compiled against.
    pub fn call(
        &self,
        voi: f64,
        constants: &[f64],
        rates: &mut [f64],
        states: &[f64],
        algebraic: &mut [f64],
    ) {
        let layout = self.layout;
        assert_eq!(constants.len(), layout.constants, "{}: constants length", self.name);
        assert_eq!(rates.len(), layout.rates, "{}: rates length", self.name);
        assert_eq!(states.len(), layout.states, "{}: states length", self.name);
        assert_eq!(algebraic.len(), layout.algebraic, "{}: algebraic length", self.name);

        // SAFETY: the code was compiled for this layout and only touches in-range slots;
        // rates and algebraic are exclusive borrows, so the stores cannot alias the inputs.
        unsafe {
            (self.code)(
                voi,
                constants.as_ptr(),
                rates.as_mut_ptr(),
                states.as_ptr(),
                algebraic.as_mut_ptr(),
            )
        }
    }

    /// Wraps the function as a solver callback.
    pub fn as_compute_rates(&self) -> ComputeRatesFn {
        let function = self.clone();
        Arc::new(move |voi, constants, rates, states, algebraic| {
            function.call(voi, constants, rates, states, algebraic)
        })
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
