//! Conversion of equation text into expression trees.
//!
//! A function body is written as statements of the form `name = expression`, separated by
//! `;` or newlines. Each statement is parsed with evalexpr and its tree is mapped onto our
//! own representation, resolving identifiers through a [`VariableMap`] supplied by the model
//! loader.
//!
//! The main entry point is [`parse_equations`]; [`build_ast`] converts a single evalexpr node.

use std::collections::HashMap;
use std::sync::Arc;

use evalexpr::{build_operator_tree, DefaultNumericTypes, Node, Operator};

use crate::{
    errors::{CompileError, ConvertError},
    expr::{ArrayKind, Assignment, BinaryOp, Expr, UnaryOp, VarRef},
};

/// Maps variable names to the slot they occupy.
pub type VariableMap = HashMap<String, VarRef>;

/// Builds a variable map from per-array name lists. Indices follow list order.
pub fn variable_map(
    voi: &str,
    constants: &[&str],
    states: &[&str],
    rates: &[&str],
    algebraic: &[&str],
) -> VariableMap {
    let mut map = VariableMap::new();
    map.insert(voi.to_string(), VarRef::voi(voi));
    for (array, names) in [
        (ArrayKind::Constants, constants),
        (ArrayKind::States, states),
        (ArrayKind::Rates, rates),
        (ArrayKind::Algebraic, algebraic),
    ] {
        for (index, name) in names.iter().enumerate() {
            map.insert(name.to_string(), VarRef::new(*name, array, index as u32));
        }
    }
    map
}

/// Parses a function body into assignments.
///
/// Statements are separated by newlines or `;`, and empty statements are skipped. Every
/// assignment records the 1-based text line it was written on, and parse errors report that
/// same line, so several statements sharing a line share its number.
///
/// # Arguments
/// * `text` - The function body, e.g. `"dx = -k * x; dy = k * x"`
/// * `variables` - Name to slot mapping used to resolve every identifier
///
/// # Returns
/// The statements in source order, or the first error found
pub fn parse_equations(
    text: &str,
    variables: &VariableMap,
) -> Result<Vec<Assignment>, CompileError> {
    text.lines()
        .enumerate()
        .flat_map(|(i, line)| line.split(';').map(move |statement| (i + 1, statement.trim())))
        .filter(|(_, statement)| !statement.is_empty())
        .map(|(line, statement)| {
            parse_statement(statement, variables)
                .map(|assignment| assignment.at_line(line))
                .map_err(|source| match source {
                    ConvertError::VariableNotFound(name) => {
                        CompileError::UnknownVariable { line, name }
                    }
                    source => CompileError::Convert { line, source },
                })
        })
        .collect()
}

fn parse_statement(statement: &str, variables: &VariableMap) -> Result<Assignment, ConvertError> {
    let tree = build_operator_tree::<DefaultNumericTypes>(statement)?;
    let node = unwrap_root(&tree);

    match node.operator() {
        Operator::Assign => {
            let children = node.children();
            let target = match children.first().map(|child| child.operator()) {
                Some(Operator::VariableIdentifierWrite { identifier }) => variables
                    .get(identifier.as_str())
                    .cloned()
                    .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string()))?,
                _ => return Err(ConvertError::NotAnAssignment(statement.to_string())),
            };
            let value = children
                .get(1)
                .ok_or_else(|| ConvertError::NotAnAssignment(statement.to_string()))?;
            Ok(Assignment::new(target, build_ast(value, variables)?))
        }
        _ => Err(ConvertError::NotAnAssignment(statement.to_string())),
    }
}

/// Skips root nodes that only wrap a single child (parentheses).
fn unwrap_root(mut node: &Node) -> &Node {
    while matches!(node.operator(), Operator::RootNode) && node.children().len() == 1 {
        node = &node.children()[0];
    }
    node
}

/// Converts an evalexpr AST node into our expression representation.
///
/// # Supported operations
/// * Arithmetic: `+`, `-`, `*`, `/`, `^`, unary `-`
/// * Comparisons `<`, `<=`, `>`, `>=`, `==`, `!=` and logic `&&`, `||`, `!`
/// * `abs(x)` and `sqrt(x)` as native operations; any other function becomes a call into
///   the external function table, checked later by the compiler
/// * Integer and float constants, variables from `var_map`
pub fn build_ast(node: &Node, var_map: &VariableMap) -> Result<Arc<Expr>, ConvertError> {
    let children = node.children();
    let binary = |op: BinaryOp| -> Result<Arc<Expr>, ConvertError> {
        match children {
            [lhs, rhs] => Ok(Expr::binary(op, build_ast(lhs, var_map)?, build_ast(rhs, var_map)?)),
            _ => Err(ConvertError::UnsupportedOperator(format!("{:?}", node.operator()))),
        }
    };

    match node.operator() {
        // Addition and multiplication may carry more than two children
        Operator::Add | Operator::Mul => {
            let op = if matches!(node.operator(), Operator::Add) {
                BinaryOp::Add
            } else {
                BinaryOp::Mul
            };
            let (first, rest) = children
                .split_first()
                .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{:?}", node.operator())))?;
            rest.iter().try_fold(build_ast(first, var_map)?, |acc, child| {
                Ok(Expr::binary(op, acc, build_ast(child, var_map)?))
            })
        }
        Operator::Sub => binary(BinaryOp::Sub),
        Operator::Div => binary(BinaryOp::Div),
        Operator::Exp => binary(BinaryOp::Pow),
        Operator::Lt => binary(BinaryOp::Lt),
        Operator::Leq => binary(BinaryOp::Le),
        Operator::Gt => binary(BinaryOp::Gt),
        Operator::Geq => binary(BinaryOp::Ge),
        Operator::Eq => binary(BinaryOp::Eq),
        Operator::Neq => binary(BinaryOp::Ne),
        Operator::And => binary(BinaryOp::And),
        Operator::Or => binary(BinaryOp::Or),
        Operator::Neg | Operator::Not => {
            let op = if matches!(node.operator(), Operator::Neg) {
                UnaryOp::Neg
            } else {
                UnaryOp::Not
            };
            match children {
                [operand] => Ok(Expr::unary(op, build_ast(operand, var_map)?)),
                _ => Err(ConvertError::UnsupportedOperator(format!("{:?}", node.operator()))),
            }
        }
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::constant(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::constant(*i as f64)),
            evalexpr::Value::Boolean(b) => Ok(Expr::constant(if *b { 1.0 } else { 0.0 })),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => var_map
            .get(identifier.as_str())
            .map(|var| Expr::var(var.clone()))
            .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string())),
        Operator::FunctionIdentifier { identifier } => {
            let args = match children.first().map(unwrap_root) {
                None => Vec::new(),
                Some(arg) => match arg.operator() {
                    Operator::Tuple => arg
                        .children()
                        .iter()
                        .map(|child| build_ast(child, var_map))
                        .collect::<Result<Vec<_>, _>>()?,
                    Operator::RootNode if arg.children().is_empty() => Vec::new(),
                    _ => vec![build_ast(arg, var_map)?],
                },
            };
            match (identifier.as_str(), args.as_slice()) {
                ("abs", [operand]) => Ok(Expr::unary(UnaryOp::Abs, Arc::clone(operand))),
                ("sqrt", [operand]) => Ok(Expr::unary(UnaryOp::Sqrt, Arc::clone(operand))),
                (name, _) => Ok(Expr::call(name, args)),
            }
        }
        Operator::RootNode => match children {
            [child] => build_ast(child, var_map),
            _ => Err(ConvertError::UnsupportedOperator(format!(
                "expected a single expression, found {} children",
                children.len()
            ))),
        },
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variables() -> VariableMap {
        variable_map("t", &["k", "base"], &["x", "y"], &["dx", "dy"], &["z"])
    }

    #[test]
    fn test_parse_equations() {
        let body = parse_equations("dx = -k * x; dy = k * x\nz = x + y", &variables()).unwrap();
        assert_eq!(body.len(), 3);
        assert_eq!(body[0].target, VarRef::rate("dx", 0));
        assert_eq!(body[1].target, VarRef::rate("dy", 1));
        assert_eq!(body[2].target, VarRef::algebraic("z", 0));
        assert_eq!(body[2].value.to_string(), "(x + y)");
    }

    #[test]
    fn test_skips_empty_statements() {
        let body = parse_equations("\n dx = 1;;\n\n dy = 2; ", &variables()).unwrap();
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_functions() {
        let body = parse_equations(
            "z = abs(x) + sqrt(y) + arbitrary_log(x, base) + multi_min(3, x, y, k)",
            &variables(),
        )
        .unwrap();
        let mut calls = Vec::new();
        let mut unary = 0;
        body[0].value.visit(&mut |node| match node {
            Expr::Call(name, args) => calls.push((name.clone(), args.len())),
            Expr::Unary(UnaryOp::Abs | UnaryOp::Sqrt, _) => unary += 1,
            _ => {}
        });
        assert_eq!(unary, 2);
        assert_eq!(
            calls,
            vec![("arbitrary_log".to_string(), 2), ("multi_min".to_string(), 4)]
        );
    }

    #[test]
    fn test_power_and_comparison() {
        let body = parse_equations("z = (x > 1) * x^2", &variables()).unwrap();
        assert_eq!(body[0].value.to_string(), "((x > 1) * (x ^ 2))");
    }

    #[test]
    fn test_unknown_variable_reports_line() {
        let err = parse_equations("dx = 1\ndy = q * 2", &variables()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownVariable { line: 2, ref name } if name == "q"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_lines_follow_source_text() {
        let err = parse_equations("dx = 1; dy = q * 2", &variables()).unwrap_err();
        assert_eq!(err.line(), Some(1));

        let body = parse_equations("dx = 1; dy = 2\n\n  z = x;\n", &variables()).unwrap();
        let lines: Vec<_> = body.iter().map(|assignment| assignment.line).collect();
        assert_eq!(lines, vec![Some(1), Some(1), Some(3)]);

        let err = parse_equations("dx = 1\n\ndy = (x +", &variables()).unwrap_err();
        assert!(err.to_string().starts_with("compile error at line 3"));
    }

    #[test]
    fn test_not_an_assignment() {
        let err = parse_equations("x + 1", &variables()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Convert {
                line: 1,
                source: ConvertError::NotAnAssignment(_)
            }
        ));
    }

    #[test]
    fn test_parse_error() {
        let err = parse_equations("dx = (x +", &variables()).unwrap_err();
        assert!(err.to_string().starts_with("compile error at line 1"));
    }
}
