//! The external function table and the helpers that bind it into JIT-compiled code.
//!
//! Every `Expr::Call` is resolved against [`EXTERNAL_FUNCTIONS`] by exact, case-sensitive
//! name. An entry is either a fixed-arity native (`f64 -> f64` or `(f64, f64) -> f64`) or a
//! variadic native taking `(count: i32, values: *const f64)`. The table is static: its symbols
//! are registered once when a compiler module is created.

use cranelift_codegen::ir::types::{F64, I32};
use cranelift_codegen::ir::AbiParam;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module, ModuleError};

pub mod aggregate;
pub mod elementary;
pub mod trigonometric;

/// Native implementation behind a table entry.
#[derive(Clone, Copy)]
pub enum NativeFunction {
    Unary(extern "C" fn(f64) -> f64),
    Binary(extern "C" fn(f64, f64) -> f64),
    /// Reads `count` doubles starting at `values`.
    Variadic(unsafe extern "C" fn(i32, *const f64) -> f64),
}

/// Number of arguments a table entry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// A leading integral count followed by that many values.
    Variadic,
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{n}"),
            Arity::Variadic => write!(f, "a count followed by that many"),
        }
    }
}

/// One entry of the external function table.
#[derive(Clone, Copy)]
pub struct ExternalFunction {
    /// Name used in expressions.
    pub name: &'static str,
    /// Symbol the native is registered under in the JIT module.
    pub symbol: &'static str,
    pub native: NativeFunction,
}

impl ExternalFunction {
    pub fn arity(&self) -> Arity {
        match self.native {
            NativeFunction::Unary(_) => Arity::Fixed(1),
            NativeFunction::Binary(_) => Arity::Fixed(2),
            NativeFunction::Variadic(_) => Arity::Variadic,
        }
    }

    fn address(&self) -> *const u8 {
        match self.native {
            NativeFunction::Unary(f) => f as *const u8,
            NativeFunction::Binary(f) => f as *const u8,
            NativeFunction::Variadic(f) => f as *const u8,
        }
    }

    /// Evaluates the native directly. For variadic entries `args` holds the values only,
    /// without the leading count. Returns `None` when `args` does not fit the arity.
    pub fn evaluate(&self, args: &[f64]) -> Option<f64> {
        match (self.native, args) {
            (NativeFunction::Unary(f), [x]) => Some(f(*x)),
            (NativeFunction::Binary(f), [x, y]) => Some(f(*x, *y)),
            (NativeFunction::Variadic(f), values) => {
                let count = i32::try_from(values.len()).ok()?;
                // SAFETY: `values` holds exactly `count` initialised doubles.
                Some(unsafe { f(count, values.as_ptr()) })
            }
            _ => None,
        }
    }
}

macro_rules! unary {
    ($name:literal, $symbol:literal, $f:path) => {
        ExternalFunction {
            name: $name,
            symbol: $symbol,
            native: NativeFunction::Unary($f),
        }
    };
}

/// All functions callable from compiled expressions.
pub static EXTERNAL_FUNCTIONS: &[ExternalFunction] = &[
    unary!("fabs", "compiler_fabs", elementary::fabs),
    unary!("log", "compiler_log", elementary::log),
    unary!("exp", "compiler_exp", elementary::exp),
    unary!("floor", "compiler_floor", elementary::floor),
    unary!("ceil", "compiler_ceil", elementary::ceil),
    unary!("sqrt", "compiler_sqrt", elementary::sqrt),
    unary!("factorial", "compiler_factorial", elementary::compiler_factorial),
    ExternalFunction {
        name: "pow",
        symbol: "compiler_pow",
        native: NativeFunction::Binary(elementary::pow),
    },
    ExternalFunction {
        name: "arbitrary_log",
        symbol: "compiler_arbitrary_log",
        native: NativeFunction::Binary(elementary::compiler_arbitrary_log),
    },
    unary!("sin", "compiler_sin", trigonometric::sin),
    unary!("cos", "compiler_cos", trigonometric::cos),
    unary!("tan", "compiler_tan", trigonometric::tan),
    unary!("sec", "compiler_sec", trigonometric::sec),
    unary!("csc", "compiler_csc", trigonometric::csc),
    unary!("cot", "compiler_cot", trigonometric::cot),
    unary!("sinh", "compiler_sinh", trigonometric::sinh),
    unary!("cosh", "compiler_cosh", trigonometric::cosh),
    unary!("tanh", "compiler_tanh", trigonometric::tanh),
    unary!("sech", "compiler_sech", trigonometric::sech),
    unary!("csch", "compiler_csch", trigonometric::csch),
    unary!("coth", "compiler_coth", trigonometric::coth),
    unary!("asin", "compiler_asin", trigonometric::asin),
    unary!("acos", "compiler_acos", trigonometric::acos),
    unary!("atan", "compiler_atan", trigonometric::atan),
    unary!("asec", "compiler_asec", trigonometric::asec),
    unary!("acsc", "compiler_acsc", trigonometric::acsc),
    unary!("acot", "compiler_acot", trigonometric::acot),
    unary!("asinh", "compiler_asinh", trigonometric::asinh),
    unary!("acosh", "compiler_acosh", trigonometric::acosh),
    unary!("atanh", "compiler_atanh", trigonometric::atanh),
    unary!("asech", "compiler_asech", trigonometric::asech),
    unary!("acsch", "compiler_acsch", trigonometric::acsch),
    unary!("acoth", "compiler_acoth", trigonometric::acoth),
    ExternalFunction {
        name: "multi_min",
        symbol: "compiler_multi_min",
        native: NativeFunction::Variadic(aggregate::compiler_multi_min),
    },
    ExternalFunction {
        name: "multi_max",
        symbol: "compiler_multi_max",
        native: NativeFunction::Variadic(aggregate::compiler_multi_max),
    },
    ExternalFunction {
        name: "gcd_multi",
        symbol: "compiler_gcd_multi",
        native: NativeFunction::Variadic(aggregate::compiler_gcd_multi),
    },
    ExternalFunction {
        name: "lcm_multi",
        symbol: "compiler_lcm_multi",
        native: NativeFunction::Variadic(aggregate::compiler_lcm_multi),
    },
];

/// Looks up a table entry by exact name.
pub fn lookup(name: &str) -> Option<&'static ExternalFunction> {
    EXTERNAL_FUNCTIONS.iter().find(|function| function.name == name)
}

/// Registers the address of every table entry with a JIT builder.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for function in EXTERNAL_FUNCTIONS {
        builder.symbol(function.symbol, function.address());
    }
}

/// Declares a table entry as an import of `module`.
///
/// Declaring the same entry again returns the existing `FuncId`.
pub(crate) fn link(
    module: &mut dyn Module,
    function: &ExternalFunction,
) -> Result<FuncId, ModuleError> {
    let mut sig = module.make_signature();
    match function.native {
        NativeFunction::Unary(_) => sig.params.push(AbiParam::new(F64)),
        NativeFunction::Binary(_) => {
            sig.params.push(AbiParam::new(F64));
            sig.params.push(AbiParam::new(F64));
        }
        NativeFunction::Variadic(_) => {
            sig.params.push(AbiParam::new(I32));
            sig.params
                .push(AbiParam::new(module.target_config().pointer_type()));
        }
    }
    sig.returns.push(AbiParam::new(F64));

    module.declare_function(function.symbol, Linkage::Import, &sig)
}
