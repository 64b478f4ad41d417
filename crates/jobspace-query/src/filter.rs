//! Filter expressions over parameter and job documents.
//!
//! Supported forms, evaluated against a document with dotted or nested
//! key-path resolution:
//!
//! - `{"k.path": v}` — equality after resolving the key path; a missing
//!   path never matches
//! - `{"k.path": {"$op": v}}` — comparison operators
//! - `{"k.path.$op": v}` — operator-suffix shorthand, same semantics
//! - `{"$and": [f, ...]}` / `{"$or": [f, ...]}` — the operand must be a
//!   sequence; a mapping operand is rejected even though it could be
//!   iterated, to catch misuse
//! - `{"$not": f}` — negation
//!
//! Empty `$and` is vacuously true, empty `$or` vacuously false, and
//! logical operators nest arbitrarily. Negative operators (`$ne`, `$nin`,
//! `$not`) are complements, so documents lacking the key path match them.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Errors raised while parsing a filter expression.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter expression must be a mapping, got {0}")]
    NotAMapping(String),

    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),

    /// The argument to `$and`/`$or` must be a sequence (e.g. a list).
    #[error("the operand of '{0}' must be a sequence")]
    LogicalOperandNotSequence(String),

    #[error("invalid operand for '{op}': {reason}")]
    BadOperand { op: String, reason: String },

    #[error("invalid regular expression '{pattern}'")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Exists,
    Regex,
    Type,
}

#[derive(Debug)]
struct Cmp {
    path: String,
    op: Op,
    operand: Value,
    /// Compiled pattern, present iff `op` is `Regex`.
    pattern: Option<Regex>,
}

#[derive(Debug)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Cmp(Cmp),
}

/// A parsed, validated filter expression.
#[derive(Debug)]
pub struct Filter {
    expr: Expr,
}

impl Filter {
    /// Parse a filter from its JSON representation. `None` (or an empty
    /// mapping) matches every document.
    pub fn parse(filter: Option<&Value>) -> Result<Self, FilterError> {
        let expr = match filter {
            None => Expr::And(Vec::new()),
            Some(value) => parse_expr(value)?,
        };
        Ok(Self { expr })
    }

    /// Whether `doc` satisfies the filter. Evaluation short-circuits.
    pub fn matches(&self, doc: &Value) -> bool {
        eval(&self.expr, doc)
    }
}

fn parse_expr(value: &Value) -> Result<Expr, FilterError> {
    let Some(map) = value.as_object() else {
        return Err(FilterError::NotAMapping(value.to_string()));
    };
    let mut clauses = Vec::with_capacity(map.len());
    for (key, operand) in map {
        clauses.extend(parse_clause(key, operand)?);
    }
    // A multi-entry mapping is an implicit conjunction.
    if clauses.len() == 1 {
        Ok(clauses.pop().expect("one clause"))
    } else {
        Ok(Expr::And(clauses))
    }
}

fn parse_clause(key: &str, operand: &Value) -> Result<Vec<Expr>, FilterError> {
    match key {
        "$and" | "$or" => {
            let Some(items) = operand.as_array() else {
                return Err(FilterError::LogicalOperandNotSequence(key.to_owned()));
            };
            let exprs = items.iter().map(parse_expr).collect::<Result<Vec<_>, _>>()?;
            Ok(vec![if key == "$and" {
                Expr::And(exprs)
            } else {
                Expr::Or(exprs)
            }])
        }
        "$not" => Ok(vec![Expr::Not(Box::new(parse_expr(operand)?))]),
        _ if key.starts_with('$') => Err(FilterError::UnknownOperator(key.to_owned())),
        _ => parse_key_clause(key, operand),
    }
}

fn parse_key_clause(key: &str, operand: &Value) -> Result<Vec<Expr>, FilterError> {
    // Operator-suffix shorthand: `{"k.path.$op": v}`.
    if let Some((path, op_name)) = key.rsplit_once('.') {
        if op_name.starts_with('$') {
            return Ok(vec![Expr::Cmp(parse_cmp(path, op_name, operand)?)]);
        }
    }
    // A mapping operand whose keys are all operators is the nested form;
    // any other value is matched by structural equality.
    if let Some(ops) = operand.as_object() {
        if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) {
            return ops
                .iter()
                .map(|(op_name, op_operand)| {
                    parse_cmp(key, op_name, op_operand).map(Expr::Cmp)
                })
                .collect();
        }
    }
    Ok(vec![Expr::Cmp(Cmp {
        path: key.to_owned(),
        op: Op::Eq,
        operand: operand.clone(),
        pattern: None,
    })])
}

fn parse_cmp(path: &str, op_name: &str, operand: &Value) -> Result<Cmp, FilterError> {
    let op = match op_name {
        "$eq" => Op::Eq,
        "$ne" => Op::Ne,
        "$lt" => Op::Lt,
        "$lte" => Op::Lte,
        "$gt" => Op::Gt,
        "$gte" => Op::Gte,
        "$in" => Op::In,
        "$nin" => Op::Nin,
        "$exists" => Op::Exists,
        "$regex" => Op::Regex,
        "$type" => Op::Type,
        other => return Err(FilterError::UnknownOperator(other.to_owned())),
    };
    match op {
        Op::In | Op::Nin => {
            if !operand.is_array() {
                return Err(FilterError::BadOperand {
                    op: op_name.to_owned(),
                    reason: "expected a sequence of candidate values".to_owned(),
                });
            }
        }
        Op::Exists => {
            if !operand.is_boolean() {
                return Err(FilterError::BadOperand {
                    op: op_name.to_owned(),
                    reason: "expected a boolean".to_owned(),
                });
            }
        }
        Op::Regex | Op::Type => {
            if !operand.is_string() {
                return Err(FilterError::BadOperand {
                    op: op_name.to_owned(),
                    reason: "expected a string".to_owned(),
                });
            }
        }
        _ => {}
    }
    let pattern = if op == Op::Regex {
        let source = operand.as_str().expect("validated above");
        Some(Regex::new(source).map_err(|err| FilterError::BadRegex {
            pattern: source.to_owned(),
            source: err,
        })?)
    } else {
        None
    };
    Ok(Cmp {
        path: path.to_owned(),
        op,
        operand: operand.clone(),
        pattern,
    })
}

fn eval(expr: &Expr, doc: &Value) -> bool {
    match expr {
        Expr::And(clauses) => clauses.iter().all(|c| eval(c, doc)),
        Expr::Or(clauses) => clauses.iter().any(|c| eval(c, doc)),
        Expr::Not(inner) => !eval(inner, doc),
        Expr::Cmp(cmp) => eval_cmp(cmp, doc),
    }
}

fn eval_cmp(cmp: &Cmp, doc: &Value) -> bool {
    let resolved = resolve_path(doc, &cmp.path);
    match cmp.op {
        Op::Eq => resolved.is_some_and(|v| values_eq(v, &cmp.operand)),
        Op::Ne => !resolved.is_some_and(|v| values_eq(v, &cmp.operand)),
        Op::Lt => ordering_matches(resolved, &cmp.operand, |o| o == Ordering::Less),
        Op::Lte => ordering_matches(resolved, &cmp.operand, |o| o != Ordering::Greater),
        Op::Gt => ordering_matches(resolved, &cmp.operand, |o| o == Ordering::Greater),
        Op::Gte => ordering_matches(resolved, &cmp.operand, |o| o != Ordering::Less),
        Op::In => resolved.is_some_and(|v| in_candidates(v, &cmp.operand)),
        Op::Nin => !resolved.is_some_and(|v| in_candidates(v, &cmp.operand)),
        Op::Exists => {
            let expected = cmp.operand.as_bool().expect("validated at parse time");
            resolved.is_some() == expected
        }
        Op::Regex => resolved
            .and_then(Value::as_str)
            .zip(cmp.pattern.as_ref())
            .is_some_and(|(s, pattern)| pattern.is_match(s)),
        Op::Type => resolved.is_some_and(|v| {
            cmp.operand.as_str().expect("validated at parse time") == type_name(v)
        }),
    }
}

fn ordering_matches(
    resolved: Option<&Value>,
    operand: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    resolved
        .and_then(|v| compare_values(v, operand))
        .is_some_and(accept)
}

fn in_candidates(value: &Value, candidates: &Value) -> bool {
    candidates
        .as_array()
        .expect("validated at parse time")
        .iter()
        .any(|candidate| values_eq(value, candidate))
}

/// Resolve a dotted key path by nested traversal, falling back to a
/// literal dotted top-level key.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = doc;
    let mut resolved = true;
    for segment in path.split('.') {
        match node.as_object().and_then(|m| m.get(segment)) {
            Some(next) => node = next,
            None => {
                resolved = false;
                break;
            }
        }
    }
    if resolved {
        return Some(node);
    }
    doc.as_object().and_then(|m| m.get(path))
}

/// Structural equality with type-insensitive numeric comparison
/// (`1 == 1.0`).
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_eq(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(i, j)| values_eq(i, j))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_eq(v, w)))
        }
        _ => a == b,
    }
}

fn numbers_eq(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (as_i128(x), as_i128(y)) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_i128(n: &serde_json::Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i128::from(i));
    }
    n.as_u64().map(i128::from)
}

/// Ordering for the comparison operators: number/number and
/// string/string only. Any other pairing does not match.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (as_i128(x), as_i128(y)) {
                return Some(i.cmp(&j));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y)),
        _ => None,
    }
}

/// The `$type` name of a value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
