//! Simulation engine for ODE models with natively compiled equations.
//!
//! Model equations are compiled to machine code with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift), integrated
//! with a variable-order BDF solver, and run on a worker thread that reports progress back to
//! a controller. Equation text is parsed with [evalexpr](https://github.com/ISibboI/evalexpr).
//!
//! # Features
//!
//! - JIT compilation of rates and algebraic equations into one native function per body
//! - Built-in math primitives (reciprocal and inverse trigonometry, arbitrary-base logarithm,
//!   multi-argument min/max/gcd/lcm, factorial)
//! - Stiff integration with error control, plus a fixed-step forward Euler solver
//! - Run, pause, resume and stop from a controlling thread, with throttled progress events
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cellsim::prelude::*;
//!
//! let description = ModelDescription {
//!     voi: "t".to_string(),
//!     constants: vec![Constant { name: "k".to_string(), value: 1.0 }],
//!     states: vec![State { name: "x".to_string(), rate: "dx".to_string(), initial: 1.0 }],
//!     rates: "dx = -k * x".to_string(),
//!     ..Default::default()
//! };
//!
//! let mut compiler = Compiler::new().unwrap();
//! let model = CompiledModel::compile(&description.parse().unwrap(), &mut compiler, "decay").unwrap();
//!
//! let configuration = SimulationConfiguration {
//!     voi_end: 1.0,
//!     point_interval: 0.1,
//!     ..Default::default()
//! };
//! let mut controller = SimulationController::new(Arc::new(model), configuration).unwrap();
//! controller.run().unwrap();
//! controller.wait_for_stop(Duration::from_secs(10));
//!
//! assert_eq!(controller.voi(), 1.0);
//! assert!((controller.states()[0] - (-1.0_f64).exp()).abs() < 1e-4);
//! ```

pub mod prelude {
    pub use crate::compiler::Compiler;
    pub use crate::convert::{parse_equations, variable_map, VariableMap};
    pub use crate::errors::{
        CompileError, ConfigurationError, IntegrationError, SimulationError, SolverError,
    };
    pub use crate::expr::{ArrayKind, Assignment, BinaryOp, Expr, UnaryOp, VarRef};
    pub use crate::issue::{Issue, IssueLevel};
    pub use crate::model::{
        CompiledModel, Constant, Model, ModelCache, ModelDescription, ModelType, State,
    };
    pub use crate::simulation::{
        RunStatus, SimulationConfiguration, SimulationController, SimulationEvent,
        SimulationPoint,
    };
    pub use crate::solver::{
        BdfSolver, ForwardEulerSolver, OdeSolver, SolverConfiguration, SolverData,
        SolverSettings,
    };
    pub use crate::types::{ArrayLayout, CompiledFunction, ComputeRatesFn};
}

/// JIT compilation functionality using Cranelift
pub(crate) mod builder;
/// Validation and compilation of function bodies
pub mod compiler;
/// Conversion from equation text to expression trees
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and simplification
pub mod expr;
/// Deferred compile diagnostics
pub mod issue;
/// Models and their compiled form
pub mod model;
/// Math primitives callable from compiled code
pub mod operators;
/// Simulation worker and controller
pub mod simulation;
/// ODE solver drivers
pub mod solver;
/// Callable types shared by the compiler and the solvers
pub mod types;
