//! Error types for the cellsim crate.
//!
//! Every failure domain has its own enum:
//!
//! - `ConvertError`: errors while turning equation text into expression trees
//! - `BuilderError`: errors raised by the Cranelift back-end
//! - `CompileError`: fatal errors of one `Compiler::add_function*` call
//! - `MathError`: domain errors of the math primitive library
//! - `ConfigurationError`: invalid solver or simulation settings
//! - `IntegrationError`: fatal conditions reported while stepping
//! - `SolverError` / `SimulationError`: what the solver and controller surfaces return
//!
//! User-facing messages start with their category (`compile error`, `configuration error`,
//! `integration error`) so the kind of failure is visible without looking at internals.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur while converting evalexpr trees into our expression representation.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The text could not be parsed by evalexpr
    #[error("parse error: {0}")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// A statement is not of the form `name = expression`
    #[error("expected an assignment of the form `name = expression`, found {0}")]
    NotAnAssignment(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when a constant value is not numeric
    #[error("expected numeric constant, found {0}")]
    ConstOperator(String),
    /// Error when a variable is not found in the variable map
    #[error("variable not found: {0}")]
    VariableNotFound(String),
}

/// Errors that can occur during JIT compilation of expressions.
///
/// This enum represents the failure modes of turning an expression body into machine
/// code with Cranelift.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid code generator setting: {0}")]
    Settings(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Fatal error of a single `add_function` call.
///
/// `line` is the 1-based source line of the offending statement, or its position in the body
/// when the statement was built in code.
/// The compiler and every function compiled before stay usable.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("compile error at line {line}: unknown variable '{name}'")]
    UnknownVariable { line: usize, name: String },
    #[error("compile error at line {line}: '{name}' refers to {array}[{index}] but {array} has {len} entries")]
    IndexOutOfRange {
        line: usize,
        name: String,
        array: &'static str,
        index: u32,
        len: usize,
    },
    #[error("compile error at line {line}: unknown function '{name}'")]
    UnknownFunction { line: usize, name: String },
    #[error("compile error at line {line}: '{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        line: usize,
        name: String,
        expected: String,
        got: usize,
    },
    #[error("compile error at line {line}: '{name}' {message}")]
    VariadicCount {
        line: usize,
        name: String,
        message: String,
    },
    #[error("compile error at line {line}: cannot assign to read-only variable '{name}'")]
    ReadOnlyTarget { line: usize, name: String },
    #[error("compile error at line {line}: {source}")]
    Convert {
        line: usize,
        #[source]
        source: ConvertError,
    },
    #[error("compile error: {0}")]
    Builder(#[from] BuilderError),
}

impl CompileError {
    /// Line of the statement that caused the error, if it is tied to one.
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::UnknownVariable { line, .. }
            | CompileError::IndexOutOfRange { line, .. }
            | CompileError::UnknownFunction { line, .. }
            | CompileError::ArityMismatch { line, .. }
            | CompileError::VariadicCount { line, .. }
            | CompileError::ReadOnlyTarget { line, .. }
            | CompileError::Convert { line, .. } => Some(*line),
            CompileError::Builder(_) => None,
        }
    }
}

/// Domain errors of the math primitive library.
///
/// The C-callable entry points bound into compiled code turn these into NaN.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum MathError {
    #[error("{function} is undefined for {value}")]
    Domain { function: &'static str, value: f64 },
    #[error("{0} needs at least one argument")]
    EmptyArguments(&'static str),
}

/// Invalid solver or simulation settings. Raised before any stepping occurs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("configuration error: unknown solver property '{0}'")]
    UnknownProperty(String),
    #[error("configuration error: property '{name}' expects {expected}")]
    InvalidPropertyValue { name: String, expected: &'static str },
    #[error("configuration error: {name} must be strictly positive, got {value}")]
    NonPositiveTolerance { name: &'static str, value: f64 },
    #[error("configuration error: maximum step must be finite and non-negative, got {0}")]
    InvalidMaximumStep(f64),
    #[error("configuration error: maximum number of steps must be strictly positive")]
    InvalidMaximumNumberOfSteps,
    #[error("configuration error: step must be finite and strictly positive, got {0}")]
    InvalidStep(f64),
    #[error("configuration error: invalid integration range [{start}, {end}]")]
    InvalidRange { start: f64, end: f64 },
    #[error("configuration error: point interval must be finite and strictly positive, got {0}")]
    InvalidPointInterval(f64),
    #[error("configuration error: expected {expected} {array} value(s), got {got}")]
    ArrayLength {
        array: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Fatal conditions reported by an integrator. Recoverable issues never surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("integration error: at voi = {voi}, {steps} steps taken before reaching voi_end = {voi_end}")]
    TooMuchWork { voi: f64, voi_end: f64, steps: usize },
    #[error("integration error: at voi = {voi} and h = {step}, the corrector convergence test failed repeatedly")]
    ConvergenceFailure { voi: f64, step: f64 },
    #[error("integration error: at voi = {voi} and h = {step}, the error test failed repeatedly")]
    ErrorTestFailure { voi: f64, step: f64 },
    #[error("integration error: at voi = {voi}, the step size fell below the minimum of {minimum}")]
    StepTooSmall { voi: f64, minimum: f64 },
    #[error("integration error: the rates function returned a non-finite value at voi = {voi}")]
    NonFiniteRates { voi: f64 },
}

/// Errors returned by `OdeSolver` implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error("configuration error: solve called before initialize")]
    NotInitialized,
}

/// Errors returned synchronously by the simulation controller.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("cannot {action} a simulation that is {status}")]
    InvalidTransition { action: &'static str, status: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("failed to spawn the simulation worker: {0}")]
    Spawn(#[from] std::io::Error),
}
