//! Expression trees for model equations.
//!
//! An equation body is a list of [`Assignment`]s, each storing an [`Expr`] into a rate or an
//! algebraic variable. Children are reference counted so the same subexpression can appear
//! in several places (a DAG); trees are never mutated once built, simplification returns a
//! new tree and keeps untouched subtrees shared.

use std::fmt;
use std::sync::Arc;

use crate::operators::{self, Arity};

/// The array a variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArrayKind {
    /// The variable of integration. Not an array; the index is ignored.
    Voi,
    Constants,
    Rates,
    States,
    Algebraic,
}

impl ArrayKind {
    /// Compiled code may only store into rates and algebraic variables.
    pub fn is_writable(self) -> bool {
        matches!(self, ArrayKind::Rates | ArrayKind::Algebraic)
    }

    pub fn name(self) -> &'static str {
        match self {
            ArrayKind::Voi => "voi",
            ArrayKind::Constants => "constants",
            ArrayKind::Rates => "rates",
            ArrayKind::States => "states",
            ArrayKind::Algebraic => "algebraic",
        }
    }
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference to a model variable: its name and its slot in one of the arrays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub name: String,
    pub array: ArrayKind,
    pub index: u32,
}

impl VarRef {
    pub fn new(name: impl Into<String>, array: ArrayKind, index: u32) -> Self {
        Self {
            name: name.into(),
            array,
            index,
        }
    }

    pub fn voi(name: impl Into<String>) -> Self {
        Self::new(name, ArrayKind::Voi, 0)
    }

    pub fn constant(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, ArrayKind::Constants, index)
    }

    pub fn state(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, ArrayKind::States, index)
    }

    pub fn rate(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, ArrayKind::Rates, index)
    }

    pub fn algebraic(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, ArrayKind::Algebraic, index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    /// Logical negation: 1 when the operand is zero, 0 otherwise.
    Not,
}

impl UnaryOp {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Not => truth(x == 0.0),
        }
    }
}

/// Binary operators. Comparisons and logical operators yield 1 or 0; an operand counts as
/// true when it is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Lt => truth(a < b),
            BinaryOp::Le => truth(a <= b),
            BinaryOp::Gt => truth(a > b),
            BinaryOp::Ge => truth(a >= b),
            BinaryOp::Eq => truth(a == b),
            BinaryOp::Ne => truth(a != b),
            BinaryOp::And => truth(a != 0.0 && b != 0.0),
            BinaryOp::Or => truth(a != 0.0 || b != 0.0),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

fn truth(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a model variable
    Var(VarRef),
    Unary(UnaryOp, Arc<Expr>),
    Binary(BinaryOp, Arc<Expr>, Arc<Expr>),
    /// A call into the external function table. Variadic functions take their argument
    /// count as the first argument.
    Call(String, Vec<Arc<Expr>>),
}

impl Expr {
    pub fn constant(value: f64) -> Arc<Expr> {
        Arc::new(Expr::Const(value))
    }

    pub fn var(var: VarRef) -> Arc<Expr> {
        Arc::new(Expr::Var(var))
    }

    pub fn unary(op: UnaryOp, operand: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Unary(op, operand))
    }

    pub fn binary(op: BinaryOp, lhs: Arc<Expr>, rhs: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Binary(op, lhs, rhs))
    }

    pub fn call(name: impl Into<String>, args: Vec<Arc<Expr>>) -> Arc<Expr> {
        Arc::new(Expr::Call(name.into(), args))
    }

    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Calls `f` on every node, parents before children. Shared nodes are visited once per
    /// occurrence.
    pub fn visit<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Unary(_, operand) => operand.visit(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Call(_, args) => args.iter().for_each(|arg| arg.visit(f)),
        }
    }

    /// Simplifies the expression.
    ///
    /// Folds operators whose operands are all literals, including calls into the external
    /// function table, and applies the identities `x + 0`, `0 + x`, `x - 0`, `x * 1`,
    /// `1 * x`, `x / 1` and `--x`. Nothing that could change a NaN or infinite result is
    /// rewritten, so `x * 0` is kept. Unchanged subtrees are returned as-is.
    pub fn simplify(self: &Arc<Self>) -> Arc<Expr> {
        match self.as_ref() {
            Expr::Const(_) | Expr::Var(_) => Arc::clone(self),

            Expr::Unary(op, operand) => {
                let operand_s = operand.simplify();
                if let Some(value) = operand_s.as_const() {
                    return Expr::constant(op.apply(value));
                }
                match (op, operand_s.as_ref()) {
                    (UnaryOp::Neg, Expr::Unary(UnaryOp::Neg, inner)) => Arc::clone(inner),
                    _ if Arc::ptr_eq(operand, &operand_s) => Arc::clone(self),
                    _ => Expr::unary(*op, operand_s),
                }
            }

            Expr::Binary(op, lhs, rhs) => {
                let lhs_s = lhs.simplify();
                let rhs_s = rhs.simplify();
                match (op, lhs_s.as_const(), rhs_s.as_const()) {
                    (_, Some(a), Some(b)) => Expr::constant(op.apply(a, b)),
                    (BinaryOp::Add, _, Some(b)) if b == 0.0 => lhs_s,
                    (BinaryOp::Add, Some(a), _) if a == 0.0 => rhs_s,
                    (BinaryOp::Sub, _, Some(b)) if b == 0.0 => lhs_s,
                    (BinaryOp::Mul, _, Some(b)) if b == 1.0 => lhs_s,
                    (BinaryOp::Mul, Some(a), _) if a == 1.0 => rhs_s,
                    (BinaryOp::Div, _, Some(b)) if b == 1.0 => lhs_s,
                    (BinaryOp::Pow, _, Some(b)) if b == 1.0 => lhs_s,
                    _ if Arc::ptr_eq(lhs, &lhs_s) && Arc::ptr_eq(rhs, &rhs_s) => Arc::clone(self),
                    _ => Expr::binary(*op, lhs_s, rhs_s),
                }
            }

            Expr::Call(name, args) => {
                let args_s: Vec<Arc<Expr>> = args.iter().map(|arg| arg.simplify()).collect();
                if let Some(value) = fold_call(name, &args_s) {
                    return Expr::constant(value);
                }
                if args.iter().zip(&args_s).all(|(a, b)| Arc::ptr_eq(a, b)) {
                    Arc::clone(self)
                } else {
                    Expr::call(name.clone(), args_s)
                }
            }
        }
    }
}

/// Evaluates a call whose arguments are all literals.
fn fold_call(name: &str, args: &[Arc<Expr>]) -> Option<f64> {
    let function = operators::lookup(name)?;
    let values: Vec<f64> = args.iter().map(|arg| arg.as_const()).collect::<Option<_>>()?;
    match function.arity() {
        Arity::Fixed(_) => function.evaluate(&values),
        Arity::Variadic => {
            let (count, rest) = values.split_first()?;
            if *count < 1.0 || *count != rest.len() as f64 {
                return None;
            }
            function.evaluate(rest)
        }
    }
}

/// Implements string formatting for expressions.
///
/// Binary operations are wrapped in parentheses, so the output always parses back to the
/// same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(var) => write!(f, "{}", var.name),
            Expr::Unary(UnaryOp::Neg, operand) => write!(f, "-({operand})"),
            Expr::Unary(UnaryOp::Abs, operand) => write!(f, "abs({operand})"),
            Expr::Unary(UnaryOp::Sqrt, operand) => write!(f, "sqrt({operand})"),
            Expr::Unary(UnaryOp::Not, operand) => write!(f, "!({operand})"),
            Expr::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One statement of a function body: `target = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: VarRef,
    pub value: Arc<Expr>,
    /// 1-based line of the source text the statement came from, when there is one.
    pub line: Option<usize>,
}

impl Assignment {
    pub fn new(target: VarRef, value: Arc<Expr>) -> Self {
        Self {
            target,
            value,
            line: None,
        }
    }

    /// Records the source line of the statement.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    /// The same statement with a different right-hand side.
    pub fn with_value(&self, value: Arc<Expr>) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.target.name, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Arc<Expr> {
        Expr::var(VarRef::state("x", 0))
    }

    #[test]
    fn test_simplify() {
        // 2 + 3 → 5
        assert_eq!(
            *Expr::binary(BinaryOp::Add, Expr::constant(2.0), Expr::constant(3.0)).simplify(),
            Expr::Const(5.0)
        );

        // x + 0 → x
        assert_eq!(
            *Expr::binary(BinaryOp::Add, x(), Expr::constant(0.0)).simplify(),
            *x()
        );

        // 1 * x → x
        assert_eq!(
            *Expr::binary(BinaryOp::Mul, Expr::constant(1.0), x()).simplify(),
            *x()
        );

        // x / 1 → x
        assert_eq!(
            *Expr::binary(BinaryOp::Div, x(), Expr::constant(1.0)).simplify(),
            *x()
        );

        // --x → x
        assert_eq!(
            *Expr::unary(UnaryOp::Neg, Expr::unary(UnaryOp::Neg, x())).simplify(),
            *x()
        );
    }

    #[test]
    fn test_simplify_keeps_nan_sensitive_forms() {
        // x * 0 is NaN for infinite x, so it must survive
        let product = Expr::binary(BinaryOp::Mul, x(), Expr::constant(0.0));
        assert_eq!(product.simplify(), product);

        let quotient = Expr::binary(BinaryOp::Div, x(), x());
        assert!(Arc::ptr_eq(&quotient.simplify(), &quotient));
    }

    #[test]
    fn test_simplify_nested_constants() {
        // (2 * 3) + x → 6 + x
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Mul, Expr::constant(2.0), Expr::constant(3.0)),
            x(),
        );
        assert_eq!(
            *expr.simplify(),
            Expr::Binary(BinaryOp::Add, Expr::constant(6.0), x())
        );

        // comparisons fold to 1/0
        let expr = Expr::binary(BinaryOp::Lt, Expr::constant(1.0), Expr::constant(2.0));
        assert_eq!(*expr.simplify(), Expr::Const(1.0));
    }

    #[test]
    fn test_simplify_calls() {
        let expr = Expr::call("multi_max", vec![
            Expr::constant(3.0),
            Expr::constant(3.0),
            Expr::constant(1.0),
            Expr::constant(2.0),
        ]);
        assert_eq!(*expr.simplify(), Expr::Const(3.0));

        let expr = Expr::call("factorial", vec![Expr::constant(-1.0)]);
        assert!(expr.simplify().as_const().unwrap().is_nan());

        // wrong count and unknown functions are left for the compiler to report
        let expr = Expr::call("multi_min", vec![Expr::constant(2.0), Expr::constant(1.0)]);
        assert!(matches!(*expr.simplify(), Expr::Call(..)));
        let expr = Expr::call("nope", vec![Expr::constant(1.0)]);
        assert!(matches!(*expr.simplify(), Expr::Call(..)));
    }

    #[test]
    fn test_simplify_preserves_sharing() {
        let shared = Expr::binary(BinaryOp::Mul, x(), x());
        let expr = Expr::binary(BinaryOp::Add, Arc::clone(&shared), Arc::clone(&shared));
        let simplified = expr.simplify();
        match simplified.as_ref() {
            Expr::Binary(_, lhs, rhs) => {
                assert!(Arc::ptr_eq(lhs, &shared));
                assert!(Arc::ptr_eq(rhs, &shared));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_visit() {
        let shared = Expr::binary(BinaryOp::Mul, x(), Expr::constant(2.0));
        let expr = Expr::call("pow", vec![Arc::clone(&shared), shared]);
        let mut vars = 0;
        expr.visit(&mut |node| {
            if matches!(node, Expr::Var(_)) {
                vars += 1;
            }
        });
        assert_eq!(vars, 2);
    }

    #[test]
    fn test_display() {
        let expr = Expr::binary(
            BinaryOp::Sub,
            Expr::unary(UnaryOp::Abs, x()),
            Expr::call("arbitrary_log", vec![x(), Expr::constant(2.0)]),
        );
        assert_eq!(expr.to_string(), "(abs(x) - arbitrary_log(x, 2))");

        let assignment = Assignment::new(
            VarRef::rate("dx", 0),
            Expr::unary(UnaryOp::Neg, x()),
        );
        assert_eq!(assignment.to_string(), "dx = -(x)");
    }

    #[test]
    fn test_operator_semantics() {
        assert_eq!(BinaryOp::And.apply(2.0, 0.0), 0.0);
        assert_eq!(BinaryOp::Or.apply(0.0, -1.0), 1.0);
        assert_eq!(BinaryOp::Ne.apply(f64::NAN, f64::NAN), 1.0);
        assert_eq!(UnaryOp::Not.apply(0.0), 1.0);
        assert_eq!(UnaryOp::Not.apply(3.0), 0.0);
        assert!(ArrayKind::Rates.is_writable());
        assert!(!ArrayKind::States.is_writable());
    }
}
