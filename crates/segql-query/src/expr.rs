//! Expression evaluation over decoded records

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use segql_core::Record;

use crate::error::SqlError;
use crate::types::{Column, ColumnRef, CompareOp, Expr, Filter, TableRef};

/// Per-row evaluation failures. These never abort a query: projections turn
/// them into NULL, predicates into "no match".
#[derive(Debug, Error)]
pub(crate) enum EvalError {
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("unknown qualifier: {0}")]
    UnknownQualifier(String),

    #[error("{0} is not a per-row expression")]
    NotScalar(String),
}

/// A candidate row: one record, or a joined pair.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalRow<'a> {
    pub left: &'a Record,
    pub right: Option<&'a Record>,
}

impl<'a> EvalRow<'a> {
    pub fn single(left: &'a Record) -> Self {
        Self { left, right: None }
    }

    pub fn pair(left: &'a Record, right: &'a Record) -> Self {
        Self {
            left,
            right: Some(right),
        }
    }
}

/// The tables visible to column qualifiers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope<'s> {
    pub left: &'s TableRef,
    pub right: Option<&'s TableRef>,
}

impl<'s> Scope<'s> {
    fn side(&self, qualifier: &str) -> Option<bool> {
        // Aliases shadow topic names so a self-join stays addressable.
        if self.left.alias.as_deref() == Some(qualifier) {
            return Some(false);
        }
        if let Some(right) = self.right {
            if right.alias.as_deref() == Some(qualifier) {
                return Some(true);
            }
        }
        if self.left.topic == qualifier {
            return Some(false);
        }
        match self.right {
            Some(right) if right.topic == qualifier => Some(true),
            _ => None,
        }
    }

    fn resolve<'a>(&self, column: &ColumnRef, row: EvalRow<'a>) -> Result<&'a Record, EvalError> {
        match column.qualifier.as_deref() {
            None => Ok(row.left),
            Some(q) => match self.side(q) {
                Some(false) => Ok(row.left),
                Some(true) => row
                    .right
                    .ok_or_else(|| EvalError::UnknownQualifier(q.to_string())),
                None => Err(EvalError::UnknownQualifier(q.to_string())),
            },
        }
    }

    /// Which side `expr` is qualified to: `Some(false)` left, `Some(true)`
    /// right, `None` when unqualified or unknown.
    pub fn side_of(&self, expr: &Expr) -> Option<bool> {
        let column = match expr {
            Expr::Column(c) => c,
            Expr::JsonValue { source, .. } => source,
            _ => return None,
        };
        column.qualifier.as_deref().and_then(|q| self.side(q))
    }

    /// Check every qualifier in `expr` names a visible table.
    pub fn validate(&self, expr: &Expr) -> Result<(), SqlError> {
        let column = match expr {
            Expr::Column(c) => c,
            Expr::JsonValue { source, .. } => source,
            Expr::Aggregate { arg: Some(arg), .. } => return self.validate(arg),
            Expr::Aggregate { arg: None, .. } | Expr::Literal(_) | Expr::Named(_) => return Ok(()),
        };
        match column.qualifier.as_deref() {
            Some(q) if self.side(q).is_none() => Err(SqlError::InvalidQuery(format!(
                "unknown table or alias: {}",
                q
            ))),
            _ => Ok(()),
        }
    }
}

/// Evaluate a per-row expression.
pub(crate) fn eval(expr: &Expr, scope: &Scope<'_>, row: EvalRow<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Column(c) => Ok(column_value(scope.resolve(c, row)?, c.column)),
        Expr::JsonValue { source, path } => {
            let record = scope.resolve(source, row)?;
            let bytes = match source.column {
                Column::Key => record.key.as_deref(),
                Column::Value => record.value.as_deref(),
                _ => {
                    let text = render(&column_value(record, source.column)).unwrap_or_default();
                    return json_value(Some(text.as_bytes()), path);
                }
            };
            json_value(bytes, path)
        }
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Aggregate { .. } | Expr::Named(_) => Err(EvalError::NotScalar(expr.to_string())),
    }
}

pub(crate) fn column_value(record: &Record, column: Column) -> Value {
    match column {
        Column::Topic => Value::String(record.topic.clone()),
        Column::Partition => Value::Number(record.partition.into()),
        Column::Offset => Value::Number(record.offset.into()),
        Column::Timestamp => Value::Number(record.timestamp.into()),
        Column::Key => bytes_to_value(record.key.as_deref()),
        Column::Value => bytes_to_value(record.value.as_deref()),
    }
}

fn bytes_to_value(bytes: Option<&[u8]>) -> Value {
    bytes
        .map(|b| Value::String(String::from_utf8_lossy(b).into_owned()))
        .unwrap_or(Value::Null)
}

/// `json_value(bytes, path)`. An absent payload is NULL; a payload that is not
/// JSON is an error.
pub(crate) fn json_value(bytes: Option<&[u8]>, path: &str) -> Result<Value, EvalError> {
    let Some(bytes) = bytes else {
        return Ok(Value::Null);
    };
    let json: Value =
        serde_json::from_slice(bytes).map_err(|e| EvalError::MalformedJson(e.to_string()))?;
    Ok(extract_json_path(&json, path))
}

/// Extract a value from JSON using a simple path ($.field.subfield, $.items.0)
fn extract_json_path(json: &Value, path: &str) -> Value {
    let path = path.trim_start_matches('$').trim_start_matches('.');

    let mut current = json;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let next = match current {
            Value::Object(map) => map.get(part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|idx| arr.get(idx)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used by ORDER BY, GROUP BY output and MIN/MAX.
///
/// NULL sorts first; numbers compare numerically; mixed types order by kind.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x.cmp(&y);
            }
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ => match type_rank(a).cmp(&type_rank(b)) {
            Ordering::Equal => a.to_string().cmp(&b.to_string()),
            other => other,
        },
    }
}

/// Lexicographic comparison of key tuples.
pub(crate) fn compare_tuples(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| compare_values(x, y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

/// Hashable form of a join key. NULL never joins.
pub(crate) fn join_key(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(format!("s:{}", s)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(format!("n:{}", i)),
            None => n.as_f64().map(|f| format!("n:{}", f)),
        },
        Value::Bool(b) => Some(format!("b:{}", b)),
        other => Some(format!("j:{}", other)),
    }
}

/// Text form written to the result sink. NULL stays `None`.
pub(crate) fn render(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// WHERE conjunct. NULL and evaluation errors never match.
pub(crate) fn matches_filter(filter: &Filter, scope: &Scope<'_>, row: EvalRow<'_>) -> bool {
    let value = match eval(&filter.expr, scope, row) {
        Ok(Value::Null) | Err(_) => return false,
        Ok(v) => v,
    };
    if filter.value.is_null() || type_rank(&value) != type_rank(&filter.value) {
        return filter.op == CompareOp::NotEq && !filter.value.is_null();
    }
    let ord = compare_values(&value, &filter.value);
    match filter.op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::NotEq => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::LtEq => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::GtEq => ord != Ordering::Less,
    }
}
