//! The expression compiler: validates function bodies and compiles them into one JIT module.
//!
//! A [`Compiler`] owns a single Cranelift module. Functions are only ever added to it, so
//! every handle returned by [`Compiler::add_function`] stays valid, including after a newer
//! version of the same function has been compiled (model reload).
//!
//! # Example
//!
//! ```rust
//! use cellsim::prelude::*;
//!
//! let mut compiler = Compiler::new().unwrap();
//! let variables = variable_map("t", &["k"], &["x"], &["dx"], &[]);
//! let layout = ArrayLayout::new(1, 1, 0);
//! let rates = compiler
//!     .add_function_from_text("rates", "dx = -k * x", &variables, layout)
//!     .unwrap();
//!
//! let mut dx = [0.0];
//! rates.call(0.0, &[0.5], &mut dx, &[2.0], &mut []);
//! assert_eq!(dx[0], -1.0);
//! ```

use std::collections::HashMap;

use cranelift_jit::JITModule;
use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    builder,
    convert::{self, VariableMap},
    errors::CompileError,
    expr::{Assignment, BinaryOp, Expr, VarRef},
    issue::Issue,
    operators::{self, Arity},
    types::{ArrayLayout, CompiledFunction},
};

pub struct Compiler {
    module: JITModule,
    functions: HashMap<String, CompiledFunction>,
    issues: Vec<Issue>,
    serial: usize,
}

impl Compiler {
    /// Creates a compiler with a fresh JIT module for the host machine.
    pub fn new() -> Result<Self, CompileError> {
        let module = builder::create_module()?;
        info!("created compiler module");
        Ok(Self {
            module,
            functions: HashMap::new(),
            issues: Vec::new(),
            serial: 0,
        })
    }

    /// Compiles `body` into a native function named `name`.
    ///
    /// Statements run in order; a statement reading a rate or algebraic variable sees the
    /// value stored by an earlier statement. On error nothing is added to the module and
    /// [`parser_errors`](Self::parser_errors) lists every problem found.
    pub fn add_function(
        &mut self,
        name: &str,
        body: &[Assignment],
        layout: ArrayLayout,
    ) -> Result<CompiledFunction, CompileError> {
        self.issues.clear();

        let mut errors = Vec::new();
        for (i, assignment) in body.iter().enumerate() {
            check_assignment(line_of(i, assignment), assignment, &layout, &mut errors);
        }
        self.issues.extend(
            errors
                .iter()
                .map(|err| Issue::error(err.line().unwrap_or(0), err.to_string()))
                .unique(),
        );
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }

        let simplified: Vec<Assignment> = body
            .par_iter()
            .map(|assignment| assignment.with_value(assignment.value.simplify()))
            .collect();
        self.issues.extend(warnings(body, &simplified));

        let symbol = format!("{name}.{}", self.serial);
        self.serial += 1;
        let code = builder::build_function(&mut self.module, &symbol, &simplified)?;

        let function = CompiledFunction::new(name, layout, code);
        debug!(function = name, %symbol, statements = body.len(), "compiled function");
        self.functions.insert(name.to_string(), function.clone());
        Ok(function)
    }

    /// Parses `text` (see [`convert::parse_equations`]) and compiles the result.
    pub fn add_function_from_text(
        &mut self,
        name: &str,
        text: &str,
        variables: &VariableMap,
        layout: ArrayLayout,
    ) -> Result<CompiledFunction, CompileError> {
        match convert::parse_equations(text, variables) {
            Ok(body) => self.add_function(name, &body, layout),
            Err(err) => {
                self.issues.clear();
                self.issues
                    .push(Issue::error(err.line().unwrap_or(0), err.to_string()));
                Err(err)
            }
        }
    }

    /// Diagnostics of the most recent `add_function*` call.
    pub fn parser_errors(&self) -> &[Issue] {
        &self.issues
    }

    /// The most recent function compiled under `name`.
    pub fn function(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.get(name)
    }
}

fn check_var(line: usize, var: &VarRef, layout: &ArrayLayout, errors: &mut Vec<CompileError>) {
    if let Some(len) = layout.len(var.array) {
        if var.index as usize >= len {
            errors.push(CompileError::IndexOutOfRange {
                line,
                name: var.name.clone(),
                array: var.array.name(),
                index: var.index,
                len,
            });
        }
    }
}

fn check_call(line: usize, name: &str, args: &[std::sync::Arc<Expr>], errors: &mut Vec<CompileError>) {
    let Some(function) = operators::lookup(name) else {
        errors.push(CompileError::UnknownFunction {
            line,
            name: name.to_string(),
        });
        return;
    };

    match function.arity() {
        Arity::Fixed(arity) if args.len() != arity => errors.push(CompileError::ArityMismatch {
            line,
            name: name.to_string(),
            expected: arity.to_string(),
            got: args.len(),
        }),
        Arity::Fixed(_) => {}
        Arity::Variadic => {
            let message = match args.first().map(|count| count.simplify().as_const()) {
                None => Some("expects a count followed by that many arguments".to_string()),
                Some(None) => Some("expects a literal count as its first argument".to_string()),
                Some(Some(count)) if count.fract() != 0.0 || count < 1.0 => {
                    Some(format!("expects a positive integral count, got {count}"))
                }
                Some(Some(count)) if count as usize != args.len() - 1 => Some(format!(
                    "was given a count of {count} but {} value(s)",
                    args.len() - 1
                )),
                Some(Some(_)) => None,
            };
            if let Some(message) = message {
                errors.push(CompileError::VariadicCount {
                    line,
                    name: name.to_string(),
                    message,
                });
            }
        }
    }
}

/// Source line of a statement, or its 1-based position when it has none.
fn line_of(index: usize, assignment: &Assignment) -> usize {
    assignment.line.unwrap_or(index + 1)
}

fn check_assignment(
    line: usize,
    assignment: &Assignment,
    layout: &ArrayLayout,
    errors: &mut Vec<CompileError>,
) {
    let target = &assignment.target;
    if target.array.is_writable() {
        check_var(line, target, layout, errors);
    } else {
        errors.push(CompileError::ReadOnlyTarget {
            line,
            name: target.name.clone(),
        });
    }

    assignment.value.visit(&mut |node| match node {
        Expr::Var(var) => check_var(line, var, layout, errors),
        Expr::Call(name, args) => check_call(line, name, args, errors),
        _ => {}
    });
}

/// Non-fatal findings: repeated targets, literal division by zero, statements that always
/// evaluate to NaN.
fn warnings(body: &[Assignment], simplified: &[Assignment]) -> Vec<Issue> {
    let mut issues = Vec::new();
    let mut first_line: HashMap<&VarRef, usize> = HashMap::new();

    for (i, (assignment, simplified)) in body.iter().zip(simplified).enumerate() {
        let line = line_of(i, assignment);
        if let Some(first) = first_line.get(&assignment.target) {
            issues.push(Issue::warning(
                line,
                format!(
                    "'{}' is assigned more than once (first at line {first})",
                    assignment.target.name
                ),
            ));
        } else {
            first_line.insert(&assignment.target, line);
        }

        let mut divides_by_zero = false;
        assignment.value.visit(&mut |node| {
            if let Expr::Binary(BinaryOp::Div, _, rhs) = node {
                divides_by_zero |= rhs.as_const() == Some(0.0);
            }
        });
        if divides_by_zero {
            issues.push(Issue::warning(line, "division by zero"));
        }

        if simplified.value.as_const().is_some_and(f64::is_nan) {
            issues.push(Issue::warning(
                line,
                format!("'{}' always evaluates to NaN", assignment.target.name),
            ));
        }
    }
    issues
}
