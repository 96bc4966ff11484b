//! Runtime evaluation of `where` conditions

use quiver_graph::{Edge, Node, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::EqlError;
use crate::Result;

/// The entities an expression is evaluated against: the current step's
/// node and, for traversal steps, the edge traveled over.
pub struct EvalContext<'a> {
    pub node: Option<&'a Node>,
    pub edge: Option<&'a Edge>,
}

/// Evaluate a condition to a boolean.
pub fn eval_condition(expr: &Expr, ctx: &EvalContext) -> Result<bool> {
    truthy(&eval(expr, ctx)?)
}

/// Evaluate an expression to a value.
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, ctx)?);
            }
            Ok(Value::List(values))
        }
        Expr::Attr { path } => Ok(resolve_attr(path, ctx)),
        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value)?)),
                UnaryOp::Neg => match value {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EqlError::Construct(format!(
                        "cannot negate {}",
                        other.canonical_string()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, ctx)?;
            let rhs = eval(right, ctx)?;
            eval_binary(*op, &lhs, &rhs)
        }
    }
}

/// Resolve an attribute path. A leading `e` segment addresses the
/// current edge; nested segments descend into map values. Missing
/// attributes evaluate to NULL.
fn resolve_attr(path: &[String], ctx: &EvalContext) -> Value {
    let (start, rest) = if path.len() > 1 && path[0] == "e" {
        match ctx.edge {
            Some(edge) => (edge.node().attr(&path[1]).cloned(), &path[2..]),
            None => (None, &path[2..]),
        }
    } else {
        match ctx.node {
            Some(node) => (node.attr(&path[0]).cloned(), &path[1..]),
            None => (None, &path[1..]),
        }
    };

    let mut value = match start {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in rest {
        value = match value {
            Value::Map(mut map) => map.remove(segment).unwrap_or(Value::Null),
            _ => return Value::Null,
        };
    }
    value
}

fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add
        | BinaryOp::Sub
        | BinaryOp::Mul
        | BinaryOp::Div
        | BinaryOp::IntDiv
        | BinaryOp::Mod => arithmetic(op, lhs, rhs),

        BinaryOp::Gt => Ok(Value::Bool(
            ordered(lhs, rhs) == Some(std::cmp::Ordering::Greater),
        )),
        BinaryOp::Lt => Ok(Value::Bool(
            ordered(lhs, rhs) == Some(std::cmp::Ordering::Less),
        )),
        BinaryOp::Ge => Ok(Value::Bool(matches!(
            ordered(lhs, rhs),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ))),
        BinaryOp::Le => Ok(Value::Bool(matches!(
            ordered(lhs, rhs),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ))),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::Neq => Ok(Value::Bool(!values_equal(lhs, rhs))),

        BinaryOp::And => Ok(Value::Bool(truthy(lhs)? && truthy(rhs)?)),
        BinaryOp::Or => Ok(Value::Bool(truthy(lhs)? || truthy(rhs)?)),

        BinaryOp::In => Ok(Value::Bool(list_contains(rhs, lhs)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!list_contains(rhs, lhs)?)),

        BinaryOp::Contains => Ok(Value::Bool(
            lhs.canonical_string().contains(&rhs.canonical_string()),
        )),
        BinaryOp::ContainsNot => Ok(Value::Bool(
            !lhs.canonical_string().contains(&rhs.canonical_string()),
        )),
        BinaryOp::BeginsWith => Ok(Value::Bool(
            lhs.canonical_string().starts_with(&rhs.canonical_string()),
        )),
        BinaryOp::EndsWith => Ok(Value::Bool(
            lhs.canonical_string().ends_with(&rhs.canonical_string()),
        )),
        BinaryOp::Like => Ok(Value::Bool(glob_match(
            &rhs.canonical_string().to_lowercase(),
            &lhs.canonical_string().to_lowercase(),
        ))),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    let (Some(l), Some(r)) = (numeric(lhs), numeric(rhs)) else {
        return Err(EqlError::Construct(format!(
            "operands of {} must be numbers, got {} and {}",
            op.symbol(),
            lhs.canonical_string(),
            rhs.canonical_string()
        )));
    };

    // Integer operands stay integers except for true division.
    if let (Some(li), Some(ri)) = (integer(lhs), integer(rhs)) {
        match op {
            BinaryOp::Add => return Ok(Value::Int(li + ri)),
            BinaryOp::Sub => return Ok(Value::Int(li - ri)),
            BinaryOp::Mul => return Ok(Value::Int(li * ri)),
            BinaryOp::IntDiv if ri != 0 => return Ok(Value::Int(li / ri)),
            BinaryOp::Mod if ri != 0 => return Ok(Value::Int(li % ri)),
            BinaryOp::IntDiv | BinaryOp::Mod => {
                return Err(EqlError::Construct("division by zero".to_string()))
            }
            _ => {}
        }
    }

    match op {
        BinaryOp::Add => Ok(Value::Float(l + r)),
        BinaryOp::Sub => Ok(Value::Float(l - r)),
        BinaryOp::Mul => Ok(Value::Float(l * r)),
        BinaryOp::Div => {
            if r == 0.0 {
                Err(EqlError::Construct("division by zero".to_string()))
            } else {
                Ok(Value::Float(l / r))
            }
        }
        BinaryOp::IntDiv => Ok(Value::Int((l / r) as i64)),
        BinaryOp::Mod => Ok(Value::Float(l % r)),
        _ => unreachable!("arithmetic called with non-arithmetic op"),
    }
}

/// Numeric view of a value; numeric strings convert.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EqlError::Construct(format!(
            "condition evaluated to {} instead of a boolean",
            other.canonical_string()
        ))),
    }
}

/// Equality with numeric coercion: `3 = 3.0` and `"3" = 3` hold.
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    if let (Some(l), Some(r)) = (numeric(lhs), numeric(rhs)) {
        return l == r;
    }
    lhs.canonical_string() == rhs.canonical_string()
}

/// Ordering for the comparison operators. NULL compares with nothing,
/// so any comparison involving it is false.
fn ordered(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    if lhs.is_null() || rhs.is_null() {
        return None;
    }
    Some(compare(lhs, rhs))
}

/// Total order used by result sorting: numeric when both sides are
/// numbers, canonical string order otherwise.
pub fn compare(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    if let (Some(l), Some(r)) = (numeric(lhs), numeric(rhs)) {
        return l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal);
    }
    lhs.canonical_string().cmp(&rhs.canonical_string())
}

fn list_contains(list: &Value, item: &Value) -> Result<bool> {
    match list {
        Value::List(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        other => Err(EqlError::Construct(format!(
            "right side of in/notin must be a list, got {}",
            other.canonical_string()
        ))),
    }
}

/// Case-insensitive glob match: `*` matches any run, `?` one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    fn matches(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..]))
            }
            (Some('?'), Some(_)) => matches(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => matches(&p[1..], &t[1..]),
            _ => false,
        }
    }
    matches(&p, &t)
}
