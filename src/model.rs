//! Models as handed over by the model loader, and their compiled form.
//!
//! A [`Model`] carries initial values and the two function bodies of a model: the rates
//! function, which the solvers call, and an optional variables function computing the
//! algebraic variables the rates do not need. [`CompiledModel`] is the result of compiling
//! both. [`ModelCache`] keeps one compiled model per file and forgets it when the file
//! changes.
//!
//! The loader also reports what kind of system the equations form. Only explicit ODE models
//! can be simulated: a DAE model, or one whose algebraic variables form a non-linear system
//! that needs an NLA solver, compiles fine but is refused by the simulation controller.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    compiler::Compiler,
    convert::{parse_equations, variable_map, VariableMap},
    errors::CompileError,
    expr::Assignment,
    types::{ArrayLayout, CompiledFunction, ComputeRatesFn},
};

/// Kind of equation system a model forms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Rates are explicit functions of the states.
    #[default]
    Ode,
    /// Some equations are implicit algebraic constraints.
    Dae,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Ode => write!(f, "ODE"),
            ModelType::Dae => write!(f, "DAE"),
        }
    }
}

/// A model as handed over by the loader: initial values and function bodies.
#[derive(Debug, Clone, Default)]
pub struct Model {
    constants: Vec<f64>,
    states: Vec<f64>,
    algebraic: usize,
    rates: Vec<Assignment>,
    variables: Vec<Assignment>,
    model_type: ModelType,
    needs_nla_solver: bool,
}

impl Model {
    /// Creates an ODE model with empty function bodies.
    ///
    /// # Arguments
    /// * `constants` - Initial values of the constants
    /// * `states` - Initial values of the states
    /// * `algebraic` - Number of algebraic variables
    pub fn new(constants: Vec<f64>, states: Vec<f64>, algebraic: usize) -> Self {
        Self {
            constants,
            states,
            algebraic,
            ..Default::default()
        }
    }

    /// Sets the rates function body. It must assign every rate.
    pub fn with_rates(mut self, body: Vec<Assignment>) -> Self {
        self.rates = body;
        self
    }

    /// Sets the body computing the algebraic variables the rates do not need.
    pub fn with_variables(mut self, body: Vec<Assignment>) -> Self {
        self.variables = body;
        self
    }

    /// Records the kind of system and whether its algebraic part needs an NLA solver.
    pub fn with_model_type(mut self, model_type: ModelType, needs_nla_solver: bool) -> Self {
        self.model_type = model_type;
        self.needs_nla_solver = needs_nla_solver;
        self
    }

    /// Array lengths the model's functions are compiled against.
    pub fn layout(&self) -> ArrayLayout {
        ArrayLayout::new(self.constants.len(), self.states.len(), self.algebraic)
    }

    /// Initial values of the constants.
    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    /// Initial values of the states.
    pub fn states(&self) -> &[f64] {
        &self.states
    }

    /// Statements of the rates function.
    pub fn rates(&self) -> &[Assignment] {
        &self.rates
    }

    /// Statements of the variables function; empty when the model has none.
    pub fn variables(&self) -> &[Assignment] {
        &self.variables
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn needs_nla_solver(&self) -> bool {
        self.needs_nla_solver
    }
}

/// A named constant with its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub value: f64,
}

/// A state variable, the name of its rate and its initial value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub rate: String,
    pub initial: f64,
}

/// Textual model description, as produced by the model loader.
///
/// ```rust
/// use cellsim::model::ModelDescription;
///
/// let description: ModelDescription = serde_json::from_str(r#"{
///     "voi": "t",
///     "constants": [{ "name": "k", "value": 0.5 }],
///     "states": [{ "name": "x", "rate": "dx", "initial": 2.0 }],
///     "rates": "dx = -k * x"
/// }"#).unwrap();
/// let model = description.parse().unwrap();
/// assert_eq!(model.states(), &[2.0]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelDescription {
    pub voi: String,
    pub constants: Vec<Constant>,
    pub states: Vec<State>,
    pub algebraic: Vec<String>,
    /// Body of the rates function.
    pub rates: String,
    /// Body of the variables function; may be empty.
    pub variables: String,
    pub model_type: ModelType,
    /// Whether the algebraic variables form a non-linear system.
    pub needs_nla_solver: bool,
}

impl ModelDescription {
    /// Maps every name of the description to its slot.
    ///
    /// Rates take the index of their state; all other names follow declaration order.
    pub fn variable_map(&self) -> VariableMap {
        let constants: Vec<&str> = self.constants.iter().map(|c| c.name.as_str()).collect();
        let states: Vec<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
        let rates: Vec<&str> = self.states.iter().map(|s| s.rate.as_str()).collect();
        let algebraic: Vec<&str> = self.algebraic.iter().map(String::as_str).collect();
        variable_map(&self.voi, &constants, &states, &rates, &algebraic)
    }

    /// Parses both function bodies.
    ///
    /// # Returns
    /// The model, or the first error of the rates body, then of the variables body
    pub fn parse(&self) -> Result<Model, CompileError> {
        let variables = self.variable_map();
        let model = Model::new(
            self.constants.iter().map(|c| c.value).collect(),
            self.states.iter().map(|s| s.initial).collect(),
            self.algebraic.len(),
        );
        Ok(model
            .with_rates(parse_equations(&self.rates, &variables)?)
            .with_variables(parse_equations(&self.variables, &variables)?)
            .with_model_type(self.model_type, self.needs_nla_solver))
    }
}

/// A model whose functions have been compiled to native code.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    layout: ArrayLayout,
    constants: Vec<f64>,
    states: Vec<f64>,
    compute_rates: CompiledFunction,
    compute_variables: Option<CompiledFunction>,
    model_type: ModelType,
    needs_nla_solver: bool,
}

impl CompiledModel {
    /// Compiles the model's functions as `<name>.rates` and `<name>.variables`.
    ///
    /// # Arguments
    /// * `model` - The model to compile
    /// * `compiler` - Compiler whose module receives the functions
    /// * `name` - Prefix of the function names, usually the model's file
    ///
    /// # Returns
    /// The compiled model, or the first error of either body
    pub fn compile(model: &Model, compiler: &mut Compiler, name: &str) -> Result<Self, CompileError> {
        let layout = model.layout();
        let compute_rates = compiler.add_function(&format!("{name}.rates"), &model.rates, layout)?;
        let compute_variables = if model.variables.is_empty() {
            None
        } else {
            Some(compiler.add_function(&format!("{name}.variables"), &model.variables, layout)?)
        };
        Ok(Self {
            layout,
            constants: model.constants.clone(),
            states: model.states.clone(),
            compute_rates,
            compute_variables,
            model_type: model.model_type,
            needs_nla_solver: model.needs_nla_solver,
        })
    }

    /// Array lengths the compiled functions expect.
    pub fn layout(&self) -> ArrayLayout {
        self.layout
    }

    /// Initial values of the constants.
    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    /// Initial values of the states.
    pub fn states(&self) -> &[f64] {
        &self.states
    }

    /// The compiled rates function.
    pub fn compute_rates(&self) -> &CompiledFunction {
        &self.compute_rates
    }

    /// The rates function as a solver callback.
    pub fn compute_rates_fn(&self) -> ComputeRatesFn {
        self.compute_rates.as_compute_rates()
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn needs_nla_solver(&self) -> bool {
        self.needs_nla_solver
    }

    /// Why the model cannot be simulated by the available solvers, if it cannot.
    pub fn unsupported_reason(&self) -> Option<String> {
        if self.model_type == ModelType::Dae {
            Some("DAE models need a DAE solver".to_string())
        } else if self.needs_nla_solver {
            Some("the algebraic variables need a non-linear algebraic solver".to_string())
        } else {
            None
        }
    }

    /// Runs the variables function, if the model has one.
    pub fn compute_variables(
        &self,
        voi: f64,
        constants: &[f64],
        rates: &mut [f64],
        states: &[f64],
        algebraic: &mut [f64],
    ) {
        if let Some(function) = &self.compute_variables {
            function.call(voi, constants, rates, states, algebraic);
        }
    }
}

/// Compiled models keyed by the file they were loaded from.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: HashMap<PathBuf, Arc<CompiledModel>>,
}

impl ModelCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached model for `path`, compiling the one returned by `load` on a miss.
    pub fn get_or_compile<F>(
        &mut self,
        path: impl AsRef<Path>,
        compiler: &mut Compiler,
        load: F,
    ) -> Result<Arc<CompiledModel>, CompileError>
    where
        F: FnOnce() -> Result<Model, CompileError>,
    {
        let path = path.as_ref();
        if let Some(model) = self.models.get(path) {
            return Ok(Arc::clone(model));
        }

        let model = load()?;
        let compiled = Arc::new(CompiledModel::compile(
            &model,
            compiler,
            &path.display().to_string(),
        )?);
        debug!(path = %path.display(), "compiled model");
        self.models.insert(path.to_path_buf(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// The cached model for `path`, if it is still valid.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<CompiledModel>> {
        self.models.get(path.as_ref()).cloned()
    }

    /// Drops the compiled model of a changed file. Running simulations keep their copy.
    pub fn invalidate(&mut self, path: impl AsRef<Path>) -> bool {
        let removed = self.models.remove(path.as_ref()).is_some();
        if removed {
            debug!(path = %path.as_ref().display(), "invalidated model");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
