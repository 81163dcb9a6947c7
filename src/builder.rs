//! This module lowers function bodies to native code with Cranelift.
//!
//! The main entry points are:
//! - `create_module()` - Creates a JIT module with the external function table linked in
//! - `build_function()` - Compiles one function body into that module
//!
//! Every compiled function has the signature
//! `extern "C" fn(voi: f64, constants: *const f64, rates: *mut f64, states: *const f64, algebraic: *mut f64)`.
//!
//! Lowering is a single pass over the assignments with value numbering: structurally equal
//! subexpressions, and nodes shared through `Arc`, are emitted once per function.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    errors::BuilderError,
    expr::{ArrayKind, Assignment, BinaryOp, Expr, UnaryOp},
    operators::{self, Arity},
    types::RawFunction,
};
use cranelift::prelude::*;
use cranelift_codegen::ir::{FuncRef, Signature, StackSlotData, StackSlotKind};
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;

/// Integral exponents in this range are expanded into multiplications.
const MAX_EXPANDED_POWER: f64 = 16.0;

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// This function detects the host machine architecture and configures appropriate
/// compilation flags for optimal code generation.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A flag is rejected or code generation configuration fails
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    // Get target triple to detect architecture
    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    let flag = if is_x86 { "true" } else { "false" };
    let flags = [
        ("use_colocated_libcalls", flag),
        ("is_pic", flag),
        ("opt_level", "speed"),
        (
            "enable_verifier",
            if cfg!(debug_assertions) { "true" } else { "false" },
        ),
    ];
    for (name, value) in flags {
        flag_builder
            .set(name, value)
            .map_err(|err| BuilderError::Settings(format!("{name}={value}: {err}")))?;
    }

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with every external function table symbol registered.
///
/// The module is append-only: functions are added with [`build_function`] and stay valid,
/// together with their code memory, for the rest of the process.
///
/// # Errors
/// Returns a BuilderError if no ISA can be created for the host
pub(crate) fn create_module() -> Result<JITModule, BuilderError> {
    let isa = create_isa()?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);
    Ok(JITModule::new(builder))
}

/// Signature shared by every compiled function.
///
/// One `f64` for the variable of integration followed by four pointers, in the order
/// constants, rates, states, algebraic.
fn function_signature(module: &JITModule) -> Signature {
    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F64));
    for _ in 0..4 {
        sig.params.push(AbiParam::new(pointer));
    }
    sig
}

/// Compiles a function body into `module` under `symbol` and finalizes it.
///
/// The body must already be validated: every variable in range, every call bound to a
/// known table entry with a matching argument count, every target writable.
///
/// # Arguments
/// * `module` - The JIT module receiving the function
/// * `symbol` - Exported name; must not be declared in `module` yet
/// * `body` - Statements lowered in order, each ending with a store to its target
///
/// # Returns
/// A pointer to the finalized native code
///
/// # Errors
/// Returns a BuilderError if:
/// - Function or import declaration fails
/// - Function definition fails
/// - Module finalization fails
pub(crate) fn build_function(
    module: &mut JITModule,
    symbol: &str,
    body: &[Assignment],
) -> Result<RawFunction, BuilderError> {
    let mut ctx: Context = module.make_context();
    ctx.func.signature = function_signature(module);

    let func_id = module
        .declare_function(symbol, Linkage::Export, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    let mut builder_context = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);
        let params = builder.block_params(entry_block).to_vec();

        let mut lowering = Lowering::new(builder, module, &params);
        for assignment in body {
            lowering.assign(assignment)?;
        }
        lowering.finish();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    // SAFETY: The function was declared with `function_signature`, which matches
    // `RawFunction`, and JIT code memory is never freed while the module lives on.
    let code = unsafe {
        std::mem::transmute::<*const u8, RawFunction>(module.get_finalized_function(func_id))
    };
    Ok(code)
}

/// Value-numbering key: one emitted value per distinct key.
///
/// Operands are the already emitted Cranelift values, so two subexpressions share a key
/// exactly when they are structurally equal after lowering their children.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Const(u64),
    Load(ArrayKind, u32),
    Unary(UnaryOp, Value),
    Binary(BinaryOp, Value, Value),
    Powi(Value, i64),
    Call(&'static str, Vec<Value>),
}

/// State of lowering one function body.
///
/// Everything lives in the single entry block, so an emitted value dominates every later
/// use and can be reused freely until a store changes the slot it was loaded from.
struct Lowering<'a> {
    builder: FunctionBuilder<'a>,
    module: &'a mut JITModule,
    /// Entry block parameters.
    voi: Value,
    constants: Value,
    rates: Value,
    states: Value,
    algebraic: Value,
    values: HashMap<NodeKey, Value>,
    /// Nodes already lowered, by address. Cleared on every store.
    lowered: HashMap<*const Expr, Value>,
    /// External functions already declared in this function.
    imports: HashMap<&'static str, FuncRef>,
}

impl<'a> Lowering<'a> {
    fn new(builder: FunctionBuilder<'a>, module: &'a mut JITModule, params: &[Value]) -> Self {
        Self {
            builder,
            module,
            voi: params[0],
            constants: params[1],
            rates: params[2],
            states: params[3],
            algebraic: params[4],
            values: HashMap::new(),
            lowered: HashMap::new(),
            imports: HashMap::new(),
        }
    }

    /// Base pointer of an array; the variable of integration has none.
    fn array_pointer(&self, array: ArrayKind) -> Option<Value> {
        match array {
            ArrayKind::Voi => None,
            ArrayKind::Constants => Some(self.constants),
            ArrayKind::Rates => Some(self.rates),
            ArrayKind::States => Some(self.states),
            ArrayKind::Algebraic => Some(self.algebraic),
        }
    }

    /// Lowers the right-hand side and stores it into the target slot.
    ///
    /// # Errors
    /// Returns a BuilderError if the target is the variable of integration or its offset
    /// does not fit an `i32`
    fn assign(&mut self, assignment: &Assignment) -> Result<(), BuilderError> {
        let value = self.lower(&assignment.value)?;
        let target = &assignment.target;
        let pointer = self.array_pointer(target.array).ok_or_else(|| {
            BuilderError::FunctionError(format!("cannot store into {}", target.name))
        })?;
        let offset = slot_offset(target.index)?;
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, pointer, offset);

        // Later reads of the slot see the stored value; nodes lowered by address may have
        // read the old one.
        self.values
            .insert(NodeKey::Load(target.array, target.index), value);
        self.lowered.clear();
        Ok(())
    }

    /// Terminates the entry block and releases the builder.
    fn finish(mut self) {
        self.builder.ins().return_(&[]);
        self.builder.finalize();
    }

    /// Lowers an expression, reusing the value of a node seen before.
    ///
    /// Nodes are looked up by address first, which makes a shared DAG cost one visit per
    /// node, and then by [`NodeKey`], which catches equal subtrees built separately.
    ///
    /// # Returns
    /// The Cranelift value holding the result of `expr`
    fn lower(&mut self, expr: &Arc<Expr>) -> Result<Value, BuilderError> {
        let address = Arc::as_ptr(expr);
        if let Some(value) = self.lowered.get(&address) {
            return Ok(*value);
        }

        let key = match expr.as_ref() {
            Expr::Const(value) => NodeKey::Const(value.to_bits()),
            Expr::Var(var) => NodeKey::Load(var.array, var.index),
            Expr::Unary(op, operand) => NodeKey::Unary(*op, self.lower(operand)?),
            Expr::Binary(BinaryOp::Pow, base, exponent) => match exponent.as_const() {
                Some(e) if e.fract() == 0.0 && e.abs() <= MAX_EXPANDED_POWER => {
                    NodeKey::Powi(self.lower(base)?, e as i64)
                }
                _ => NodeKey::Binary(BinaryOp::Pow, self.lower(base)?, self.lower(exponent)?),
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.lower(lhs)?;
                let rhs = self.lower(rhs)?;
                NodeKey::Binary(*op, lhs, rhs)
            }
            Expr::Call(name, args) => {
                let function = operators::lookup(name).ok_or_else(|| {
                    BuilderError::FunctionError(format!("unknown function {name}"))
                })?;
                // The leading count of a variadic call is implied by the argument list.
                let args = match function.arity() {
                    Arity::Fixed(_) => args.as_slice(),
                    Arity::Variadic => args.get(1..).unwrap_or_default(),
                };
                let values = args
                    .iter()
                    .map(|arg| self.lower(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                NodeKey::Call(function.name, values)
            }
        };

        let value = match self.values.get(&key) {
            Some(value) => *value,
            None => {
                let value = self.emit(&key)?;
                self.values.insert(key, value);
                value
            }
        };
        self.lowered.insert(address, value);
        Ok(value)
    }

    /// Emits the instructions for a key whose operands are already lowered.
    fn emit(&mut self, key: &NodeKey) -> Result<Value, BuilderError> {
        let value = match key {
            NodeKey::Const(bits) => self.builder.ins().f64const(f64::from_bits(*bits)),
            NodeKey::Load(ArrayKind::Voi, _) => self.voi,
            NodeKey::Load(array, index) => {
                let pointer = self.array_pointer(*array).unwrap_or(self.constants);
                let offset = slot_offset(*index)?;
                self.builder
                    .ins()
                    .load(types::F64, MemFlags::trusted(), pointer, offset)
            }
            NodeKey::Unary(op, operand) => match op {
                UnaryOp::Neg => self.builder.ins().fneg(*operand),
                UnaryOp::Abs => self.builder.ins().fabs(*operand),
                UnaryOp::Sqrt => self.builder.ins().sqrt(*operand),
                UnaryOp::Not => {
                    let zero = self.builder.ins().f64const(0.0);
                    let condition = self.builder.ins().fcmp(FloatCC::Equal, *operand, zero);
                    self.truth(condition)
                }
            },
            NodeKey::Binary(op, lhs, rhs) => self.emit_binary(*op, *lhs, *rhs)?,
            NodeKey::Powi(base, exponent) => {
                generate_optimized_power(&mut self.builder, *base, *exponent)
            }
            NodeKey::Call(name, args) => self.emit_call(name, args)?,
        };
        Ok(value)
    }

    /// Emits arithmetic, comparison or logic on two values.
    ///
    /// Comparisons and logic produce `1.0` or `0.0`; logic treats non-zero as true. A
    /// non-literal exponent calls the table's `pow`.
    fn emit_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, BuilderError> {
        let condition = match op {
            BinaryOp::Add => return Ok(self.builder.ins().fadd(lhs, rhs)),
            BinaryOp::Sub => return Ok(self.builder.ins().fsub(lhs, rhs)),
            BinaryOp::Mul => return Ok(self.builder.ins().fmul(lhs, rhs)),
            BinaryOp::Div => return Ok(self.builder.ins().fdiv(lhs, rhs)),
            BinaryOp::Pow => return self.emit_call("pow", &[lhs, rhs]),
            BinaryOp::Lt => Some(FloatCC::LessThan),
            BinaryOp::Le => Some(FloatCC::LessThanOrEqual),
            BinaryOp::Gt => Some(FloatCC::GreaterThan),
            BinaryOp::Ge => Some(FloatCC::GreaterThanOrEqual),
            BinaryOp::Eq => Some(FloatCC::Equal),
            BinaryOp::Ne => Some(FloatCC::NotEqual),
            BinaryOp::And | BinaryOp::Or => None,
        };

        let condition = match condition {
            Some(cc) => self.builder.ins().fcmp(cc, lhs, rhs),
            None => {
                let zero = self.builder.ins().f64const(0.0);
                let lhs = self.builder.ins().fcmp(FloatCC::NotEqual, lhs, zero);
                let rhs = self.builder.ins().fcmp(FloatCC::NotEqual, rhs, zero);
                if op == BinaryOp::And {
                    self.builder.ins().band(lhs, rhs)
                } else {
                    self.builder.ins().bor(lhs, rhs)
                }
            }
        };
        Ok(self.truth(condition))
    }

    /// Maps a comparison result to 1.0 or 0.0.
    fn truth(&mut self, condition: Value) -> Value {
        let one = self.builder.ins().f64const(1.0);
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().select(condition, one, zero)
    }

    /// Calls an external table function, declaring it in the function on first use.
    ///
    /// # Arguments
    /// * `name` - Table name of the function
    /// * `args` - Argument values; for a variadic function, without the leading count
    ///
    /// # Errors
    /// Returns a BuilderError if the name is not in the table or the import cannot be
    /// declared
    fn emit_call(&mut self, name: &str, args: &[Value]) -> Result<Value, BuilderError> {
        let function = operators::lookup(name)
            .ok_or_else(|| BuilderError::FunctionError(format!("unknown function {name}")))?;

        let func_ref = match self.imports.get(function.name) {
            Some(func_ref) => *func_ref,
            None => {
                let func_id = operators::link(&mut *self.module, function)
                    .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;
                let func_ref = self
                    .module
                    .declare_func_in_func(func_id, self.builder.func);
                self.imports.insert(function.name, func_ref);
                func_ref
            }
        };

        let call = match function.arity() {
            Arity::Fixed(_) => self.builder.ins().call(func_ref, args),
            Arity::Variadic => {
                // Spill the values to the stack and pass (count, pointer).
                let size = u32::try_from(args.len() * 8).map_err(|_| {
                    BuilderError::FunctionError(format!("too many arguments for {name}"))
                })?;
                let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    size,
                    3,
                ));
                for (i, arg) in args.iter().enumerate() {
                    self.builder.ins().stack_store(*arg, slot, (i * 8) as i32);
                }
                let pointer_type = self.module.target_config().pointer_type();
                let pointer = self.builder.ins().stack_addr(pointer_type, slot, 0);
                let count = self.builder.ins().iconst(types::I32, args.len() as i64);
                self.builder.ins().call(func_ref, &[count, pointer])
            }
        };
        Ok(self.builder.inst_results(call)[0])
    }
}

/// Byte offset of slot `index` in an `f64` array.
fn slot_offset(index: u32) -> Result<i32, BuilderError> {
    i32::try_from(u64::from(index) * 8)
        .map_err(|_| BuilderError::FunctionError(format!("variable index {index} is too large")))
}

/// Generates optimized machine code for raising a value to an integer power.
///
/// Small exponents use hand-picked multiplication chains, other exponents use binary
/// exponentiation; negative exponents take the reciprocal.
fn generate_optimized_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        3 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, base)
        }
        4 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, square)
        }
        -1 => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, base)
        }
        _ => {
            let mut result = None;
            let mut current_base = base;
            let mut remaining = exp.unsigned_abs();

            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = Some(match result {
                        Some(acc) => builder.ins().fmul(acc, current_base),
                        None => current_base,
                    });
                }
                if remaining > 1 {
                    current_base = builder.ins().fmul(current_base, current_base);
                }
                remaining >>= 1;
            }

            let result = result.unwrap_or(base);
            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}
