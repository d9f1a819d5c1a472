//! Parsed statement model and result structures
//!
//! The SQL text parser lives outside this crate; it produces a
//! [`SelectStatement`]. The builder methods here construct the same
//! structure directly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlError;

/// Synthetic record columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Topic,
    Partition,
    Offset,
    Timestamp,
    Key,
    Value,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Topic => "_topic",
            Column::Partition => "_partition",
            Column::Offset => "_offset",
            Column::Timestamp => "_ts",
            Column::Key => "_key",
            Column::Value => "_value",
        }
    }

    fn data_type(&self) -> &'static str {
        match self {
            Column::Partition => "integer",
            Column::Offset | Column::Timestamp => "bigint",
            Column::Topic | Column::Key | Column::Value => "text",
        }
    }
}

impl FromStr for Column {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "_topic" => Ok(Column::Topic),
            "_partition" => Ok(Column::Partition),
            "_offset" => Ok(Column::Offset),
            "_ts" | "_timestamp" => Ok(Column::Timestamp),
            "_key" => Ok(Column::Key),
            "_value" => Ok(Column::Value),
            other => Err(SqlError::InvalidQuery(format!("unknown column: {}", other))),
        }
    }
}

/// A column, optionally qualified by a topic name or alias
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: Column,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.column.name()),
            None => write!(f, "{}", self.column.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Avg => "avg",
        }
    }
}

/// Scalar and aggregate expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A synthetic column such as `_offset` or `o._value`
    Column(ColumnRef),
    /// `json_value(column, '$.path')`
    JsonValue { source: ColumnRef, path: String },
    /// A constant
    Literal(serde_json::Value),
    /// `COUNT(*)` when `arg` is `None`, otherwise `FUNC(arg)`
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
    },
    /// Reference to an output column by its alias
    Named(String),
}

impl Expr {
    pub fn column(column: Column) -> Self {
        Expr::Column(ColumnRef {
            qualifier: None,
            column,
        })
    }

    pub fn qualified(qualifier: impl Into<String>, column: Column) -> Self {
        Expr::Column(ColumnRef {
            qualifier: Some(qualifier.into()),
            column,
        })
    }

    pub fn json_value(source: ColumnRef, path: impl Into<String>) -> Self {
        Expr::JsonValue {
            source,
            path: path.into(),
        }
    }

    pub fn count_star() -> Self {
        Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
        }
    }

    pub fn aggregate(func: AggregateFunc, arg: Expr) -> Self {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Expr::Named(name.into())
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
    }

    fn data_type(&self) -> &'static str {
        match self {
            Expr::Column(c) => c.column.data_type(),
            Expr::JsonValue { .. } => "json",
            Expr::Literal(serde_json::Value::Number(_)) => "numeric",
            Expr::Literal(_) => "text",
            Expr::Aggregate { func, .. } => match func {
                AggregateFunc::Count => "bigint",
                AggregateFunc::Sum | AggregateFunc::Avg => "numeric",
                AggregateFunc::Min | AggregateFunc::Max => "text",
            },
            Expr::Named(_) => "text",
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{}", c),
            Expr::JsonValue { source, path } => write!(f, "json_value({}, '{}')", source, path),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Aggregate { func, arg: None } => write!(f, "{}(*)", func.name()),
            Expr::Aggregate {
                func,
                arg: Some(arg),
            } => write!(f, "{}({})", func.name(), arg),
            Expr::Named(name) => write!(f, "{}", name),
        }
    }
}

/// One entry of the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Projection {
    /// Output column name: the alias, else the rendered expression.
    pub fn output_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.expr.to_string())
    }
}

/// Topic referenced in FROM or JOIN
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub topic: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            alias: None,
        }
    }

    pub fn aliased(topic: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            alias: Some(alias.into()),
        }
    }
}

/// `JOIN table ON left = right WITHIN d`
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub table: TableRef,
    pub left: Expr,
    pub right: Expr,
    pub within: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// `expr op literal`, one conjunct of the WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub expr: Expr,
    pub op: CompareOp,
    pub value: serde_json::Value,
}

/// ORDER BY clause entry
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

/// A parsed SELECT statement
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projections: Vec<Projection>,
    pub from: TableRef,
    pub join: Option<JoinClause>,
    pub filters: Vec<Filter>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    /// TAIL n: keep the last n records by arrival
    pub tail: Option<usize>,
    /// LAST d: keep records with timestamp >= now - d
    pub last: Option<Duration>,
}

impl SelectStatement {
    pub fn from_topic(topic: impl Into<String>) -> Self {
        Self::from_table(TableRef::new(topic))
    }

    pub fn from_table(from: TableRef) -> Self {
        Self {
            projections: Vec::new(),
            from,
            join: None,
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            tail: None,
            last: None,
        }
    }

    pub fn project(mut self, expr: Expr) -> Self {
        self.projections.push(Projection { expr, alias: None });
        self
    }

    pub fn project_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.projections.push(Projection {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    pub fn join(mut self, table: TableRef, left: Expr, right: Expr, within: Duration) -> Self {
        self.join = Some(JoinClause {
            table,
            left,
            right,
            within,
        });
        self
    }

    pub fn filter(mut self, expr: Expr, op: CompareOp, value: serde_json::Value) -> Self {
        self.filters.push(Filter { expr, op, value });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.order_by.push(OrderBy { expr, descending });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tail(mut self, n: usize) -> Self {
        self.tail = Some(n);
        self
    }

    pub fn last(mut self, window: Duration) -> Self {
        self.last = Some(window);
        self
    }

    /// Aggregate queries have a GROUP BY or an aggregate in the SELECT list.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || self.projections.iter().any(|p| p.expr.is_aggregate())
    }

    /// TAIL and LAST both bound the scanned history.
    pub fn has_time_bound(&self) -> bool {
        self.tail.is_some() || self.last.is_some()
    }

    /// Column metadata for the row description.
    pub fn columns(&self) -> Vec<ColumnInfo> {
        self.projections
            .iter()
            .map(|p| ColumnInfo {
                name: p.output_name(),
                data_type: p.expr.data_type().to_string(),
            })
            .collect()
    }
}

/// Column metadata for query results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// One output row; `None` is SQL NULL.
pub type ResultRow = Vec<Option<String>>;
