//! SQL query executor
//!
//! A SELECT runs as a fixed sequence of stages over an in-memory row set:
//! resolve segments, decode, LAST window, join, WHERE, TAIL, GROUP BY,
//! ORDER BY, LIMIT, project. Each stage is a plain function over the rows
//! produced by the previous one.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use segql_core::{Record, SegmentDecoder, SegmentLister};

use crate::config::QueryConfig;
use crate::error::SqlError;
use crate::expr::{
    compare_tuples, compare_values, eval, join_key, matches_filter, render, EvalRow, Scope,
};
use crate::sink::ResultSink;
use crate::types::*;
use crate::Result;

/// Executes SELECT statements against the segment source.
///
/// Holds no per-query state: every call lists segments afresh and sees
/// whatever was completed at that moment.
pub struct QueryEngine {
    config: QueryConfig,
    lister: Arc<dyn SegmentLister>,
    decoder: Arc<dyn SegmentDecoder>,
}

impl QueryEngine {
    pub fn new(
        config: QueryConfig,
        lister: Arc<dyn SegmentLister>,
        decoder: Arc<dyn SegmentDecoder>,
    ) -> Self {
        Self {
            config,
            lister,
            decoder,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Execute one SELECT and stream its rows to `sink`.
    ///
    /// Returns the number of rows written. On failure the error is also
    /// reported through the sink, unless the sink itself is what failed or the
    /// query was cancelled. Rows written before a failure stay written.
    pub async fn execute_select(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResultSink,
        stmt: &SelectStatement,
    ) -> Result<u64> {
        let start = Instant::now();
        match self.run_select(cancel, sink, stmt).await {
            Ok(rows) => {
                info!(
                    topic = %stmt.from.topic,
                    rows,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query complete"
                );
                Ok(rows)
            }
            Err(e) => {
                warn!(topic = %stmt.from.topic, error = %e, "query failed");
                if e.is_reportable() {
                    if let Err(report_err) = sink.error(e.code(), &e.to_string()).await {
                        debug!(error = %report_err, "could not report query failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_select(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResultSink,
        stmt: &SelectStatement,
    ) -> Result<u64> {
        self.config.validate()?;
        validate(stmt)?;
        let sort_keys = resolve_sort_keys(stmt)?;
        let limit = resolve_limit(stmt, &self.config)?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut left = self.load_topic(cancel, &stmt.from.topic).await?;
        let mut right = match &stmt.join {
            Some(join) => self.load_topic(cancel, &join.table.topic).await?,
            None => Vec::new(),
        };

        if let Some(window) = stmt.last {
            let cutoff = window_cutoff(now_ms, window);
            left = apply_time_window(left, cutoff);
            right = apply_time_window(right, cutoff);
        }

        let scope = Scope {
            left: &stmt.from,
            right: stmt.join.as_ref().map(|j| &j.table),
        };
        let rows = match &stmt.join {
            Some(join) => join_within(&left, &right, join, &scope, cancel)?,
            None => left.iter().map(EvalRow::single).collect(),
        };
        check_cancelled(cancel)?;

        let rows = apply_filters(rows, &stmt.filters, &scope);
        let rows = match stmt.tail {
            Some(n) => apply_tail(rows, n),
            None => rows,
        };

        let output: Vec<ResultRow> = if stmt.is_aggregate() {
            let groups = aggregate(&rows, stmt, &scope);
            let groups = order_groups(groups, &sort_keys);
            groups
                .into_iter()
                .take(limit)
                .map(|g| g.values.iter().map(render).collect())
                .collect()
        } else {
            let rows = order_rows(rows, &sort_keys, &scope);
            rows.into_iter()
                .take(limit)
                .map(|row| project(row, stmt, &scope))
                .collect()
        };
        check_cancelled(cancel)?;

        stream_rows(cancel, sink, &stmt.columns(), output).await
    }

    /// List and decode every completed segment of `topic`.
    async fn load_topic(&self, cancel: &CancellationToken, topic: &str) -> Result<Vec<Record>> {
        let segments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SqlError::Cancelled),
            listed = self.lister.list_completed(topic) => listed?,
        };

        let mut records = Vec::new();
        for segment in segments.iter().filter(|s| s.topic == topic) {
            let decoded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SqlError::Cancelled),
                decoded = self.decoder.decode(
                    &segment.segment_key,
                    &segment.index_key,
                    &segment.topic,
                    segment.partition,
                ) => decoded?,
            };
            debug!(
                topic,
                partition = segment.partition,
                segment = %segment.segment_key,
                records = decoded.len(),
                "decoded segment"
            );
            records.extend(decoded);
        }
        Ok(records)
    }
}

/// Records processed between cancellation checks in CPU-bound stages.
const CANCEL_CHECK_INTERVAL: usize = 1024;

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SqlError::Cancelled);
    }
    Ok(())
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// Validation and guardrails
// ============================================================================

fn validate(stmt: &SelectStatement) -> Result<()> {
    if stmt.projections.is_empty() {
        return Err(SqlError::InvalidQuery("SELECT list is empty".to_string()));
    }

    let scope = Scope {
        left: &stmt.from,
        right: stmt.join.as_ref().map(|j| &j.table),
    };

    for p in &stmt.projections {
        scope.validate(&p.expr)?;
        match &p.expr {
            Expr::Named(name) => {
                return Err(SqlError::InvalidQuery(format!(
                    "unknown column in SELECT list: {}",
                    name
                )))
            }
            Expr::Aggregate { func, arg: None } if *func != AggregateFunc::Count => {
                return Err(SqlError::InvalidQuery(format!(
                    "{} requires an argument",
                    func.name()
                )))
            }
            Expr::Aggregate { arg: Some(arg), .. }
                if arg.is_aggregate() || matches!(**arg, Expr::Named(_)) =>
            {
                return Err(SqlError::InvalidQuery(format!(
                    "invalid aggregate argument in {}",
                    p.output_name()
                )))
            }
            _ => {}
        }
    }

    let scalar_exprs = stmt
        .filters
        .iter()
        .map(|f| &f.expr)
        .chain(stmt.group_by.iter())
        .chain(stmt.join.iter().flat_map(|j| [&j.left, &j.right]));
    for expr in scalar_exprs {
        scope.validate(expr)?;
        if matches!(expr, Expr::Aggregate { .. } | Expr::Named(_)) {
            return Err(SqlError::InvalidQuery(format!(
                "{} is not allowed in WHERE, GROUP BY or JOIN",
                expr
            )));
        }
    }
    for o in &stmt.order_by {
        scope.validate(&o.expr)?;
    }

    if stmt.is_aggregate() {
        if stmt.tail.is_some() {
            return Err(SqlError::InvalidQuery(
                "TAIL cannot be combined with GROUP BY or aggregates".to_string(),
            ));
        }
        for p in stmt.projections.iter().filter(|p| !p.expr.is_aggregate()) {
            if !stmt.group_by.contains(&p.expr) {
                return Err(SqlError::InvalidQuery(format!(
                    "{} must appear in GROUP BY or inside an aggregate",
                    p.output_name()
                )));
            }
        }
    }
    Ok(())
}

/// Effective row limit, or a guardrail rejection.
fn resolve_limit(stmt: &SelectStatement, config: &QueryConfig) -> Result<usize> {
    if stmt.has_time_bound() {
        return Ok(stmt.limit.unwrap_or(config.default_limit));
    }
    if config.require_time_bound {
        return Err(SqlError::Guardrail(
            "query requires LAST or TAIL to bound the scan".to_string(),
        ));
    }
    match stmt.limit {
        Some(limit) if limit > config.max_unbounded => Err(SqlError::Guardrail(format!(
            "LIMIT {} exceeds the unbounded query cap of {}",
            limit, config.max_unbounded
        ))),
        Some(limit) => Ok(limit),
        None => Ok(config.max_unbounded),
    }
}

// ============================================================================
// Row stages
// ============================================================================

/// Lower bound of a LAST window. Timestamps equal to it are kept.
fn window_cutoff(now_ms: i64, window: Duration) -> i64 {
    now_ms.saturating_sub(duration_millis(window))
}

fn apply_time_window(records: Vec<Record>, cutoff: i64) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| r.timestamp >= cutoff)
        .collect()
}

/// Keep the last `n` rows, in arrival order.
fn apply_tail<T>(mut rows: Vec<T>, n: usize) -> Vec<T> {
    if rows.len() > n {
        let excess = rows.len() - n;
        rows.drain(..excess);
    }
    rows
}

fn apply_filters<'a>(rows: Vec<EvalRow<'a>>, filters: &[Filter], scope: &Scope<'_>) -> Vec<EvalRow<'a>> {
    if filters.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| filters.iter().all(|f| matches_filter(f, scope, *row)))
        .collect()
}

/// Pair every left record with the right records whose join key is equal and
/// whose timestamp is within `join.within` of it.
///
/// A key that fails to evaluate (e.g. malformed JSON) makes that record match
/// nothing. Output follows left order, then right order. Cancellation is
/// checked every [`CANCEL_CHECK_INTERVAL`] left records.
fn join_within<'a>(
    left: &'a [Record],
    right: &'a [Record],
    join: &JoinClause,
    scope: &Scope<'_>,
    cancel: &CancellationToken,
) -> Result<Vec<EvalRow<'a>>> {
    let within_ms = duration_millis(join.within).max(0) as u64;

    // ON may name the sides in either order.
    let swapped = scope.side_of(&join.left) == Some(true) || scope.side_of(&join.right) == Some(false);
    let (left_expr, right_expr) = if swapped {
        (&join.right, &join.left)
    } else {
        (&join.left, &join.right)
    };
    let left_scope = Scope {
        left: scope.left,
        right: None,
    };
    let right_scope = Scope {
        left: &join.table,
        right: None,
    };

    let mut unreadable = 0usize;

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, rec) in right.iter().enumerate() {
        match eval(right_expr, &right_scope, EvalRow::single(rec)) {
            Ok(v) => {
                if let Some(key) = join_key(&v) {
                    index.entry(key).or_default().push(idx);
                }
            }
            Err(_) => unreadable += 1,
        }
    }

    let mut rows = Vec::new();
    for (n, l) in left.iter().enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 {
            check_cancelled(cancel)?;
        }
        let key = match eval(left_expr, &left_scope, EvalRow::single(l)) {
            Ok(v) => join_key(&v),
            Err(_) => {
                unreadable += 1;
                None
            }
        };
        let Some(matches) = key.as_ref().and_then(|k| index.get(k)) else {
            continue;
        };
        for &idx in matches {
            let r = &right[idx];
            if l.timestamp.abs_diff(r.timestamp) <= within_ms {
                rows.push(EvalRow::pair(l, r));
            }
        }
    }

    if unreadable > 0 {
        debug!(
            unreadable,
            topic = %join.table.topic,
            "join keys that failed to evaluate were treated as non-matching"
        );
    }
    Ok(rows)
}

// ============================================================================
// Aggregation
// ============================================================================

/// One output row of an aggregate query
#[derive(Debug, Clone, PartialEq)]
struct GroupRow {
    key: Vec<Value>,
    values: Vec<Value>,
}

#[derive(Debug)]
enum Accumulator {
    /// Non-aggregate projection; index into the group key
    Key(usize),
    CountStar(u64),
    Count(u64),
    Sum { int: i64, float: f64, is_float: bool },
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, n: u64 },
}

impl Accumulator {
    fn for_projection(p: &Projection, group_by: &[Expr]) -> Self {
        match &p.expr {
            Expr::Aggregate { func, arg } => match func {
                AggregateFunc::Count if arg.is_none() => Accumulator::CountStar(0),
                AggregateFunc::Count => Accumulator::Count(0),
                AggregateFunc::Sum => Accumulator::Sum {
                    int: 0,
                    float: 0.0,
                    is_float: false,
                },
                AggregateFunc::Min => Accumulator::Min(None),
                AggregateFunc::Max => Accumulator::Max(None),
                AggregateFunc::Avg => Accumulator::Avg { sum: 0.0, n: 0 },
            },
            other => Accumulator::Key(group_by.iter().position(|g| g == other).unwrap_or(0)),
        }
    }

    fn update(&mut self, arg: Option<&Expr>, scope: &Scope<'_>, row: EvalRow<'_>) {
        let value = match (&*self, arg) {
            (Accumulator::Key(_), _) | (Accumulator::CountStar(_), _) => Value::Null,
            (_, Some(arg)) => eval(arg, scope, row).unwrap_or(Value::Null),
            (_, None) => Value::Null,
        };

        match self {
            Accumulator::Key(_) => {}
            Accumulator::CountStar(n) => *n += 1,
            Accumulator::Count(n) => {
                if !value.is_null() {
                    *n += 1;
                }
            }
            Accumulator::Sum {
                int,
                float,
                is_float,
            } => {
                // Non-numeric input contributes zero.
                let Value::Number(num) = &value else {
                    return;
                };
                match num.as_i64().and_then(|v| int.checked_add(v)) {
                    Some(sum) if !*is_float => *int = sum,
                    _ => {
                        *is_float = true;
                        *float += num.as_f64().unwrap_or(0.0);
                    }
                }
            }
            Accumulator::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(&value, c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(&value, c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Avg { sum, n } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *n += 1;
                }
            }
        }
    }

    fn finish(self, key: &[Value]) -> Value {
        match self {
            Accumulator::Key(idx) => key.get(idx).cloned().unwrap_or(Value::Null),
            Accumulator::CountStar(n) | Accumulator::Count(n) => Value::from(n),
            Accumulator::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    serde_json::json!(int as f64 + float)
                } else {
                    Value::from(int)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
            Accumulator::Avg { sum, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    serde_json::json!(sum / n as f64)
                }
            }
        }
    }
}

/// Group rows by the GROUP BY tuple and evaluate the SELECT list per group.
///
/// Groups come out in ascending key order. Without GROUP BY the whole input
/// is one group, so `COUNT(*)` over nothing still yields a row.
fn aggregate(rows: &[EvalRow<'_>], stmt: &SelectStatement, scope: &Scope<'_>) -> Vec<GroupRow> {
    let new_accumulators = || -> Vec<Accumulator> {
        stmt.projections
            .iter()
            .map(|p| Accumulator::for_projection(p, &stmt.group_by))
            .collect()
    };

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<Accumulator>)> = Vec::new();
    if stmt.group_by.is_empty() {
        groups.push((Vec::new(), new_accumulators()));
    }

    for row in rows {
        let slot = if stmt.group_by.is_empty() {
            0
        } else {
            let key: Vec<Value> = stmt
                .group_by
                .iter()
                .map(|e| eval(e, scope, *row).unwrap_or(Value::Null))
                .collect();
            // Numerically equal values (1 and 1.0) share a group.
            let hash = Value::Array(
                key.iter()
                    .map(|v| join_key(v).map_or(Value::Null, Value::String))
                    .collect(),
            )
            .to_string();
            *index.entry(hash).or_insert_with(|| {
                groups.push((key, new_accumulators()));
                groups.len() - 1
            })
        };

        for (acc, p) in groups[slot].1.iter_mut().zip(&stmt.projections) {
            let arg = match &p.expr {
                Expr::Aggregate { arg, .. } => arg.as_deref(),
                _ => None,
            };
            acc.update(arg, scope, *row);
        }
    }

    groups.sort_by(|a, b| compare_tuples(&a.0, &b.0));
    groups
        .into_iter()
        .map(|(key, accs)| {
            let values = accs.into_iter().map(|acc| acc.finish(&key)).collect();
            GroupRow { key, values }
        })
        .collect()
}

// ============================================================================
// Ordering and projection
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SortKey<'s> {
    /// Evaluated per record
    Row(&'s Expr),
    /// Output column of an aggregate row
    Output(usize),
    /// GROUP BY column of an aggregate row
    GroupKey(usize),
}

#[derive(Debug, Clone, Copy)]
struct OrderTerm<'s> {
    key: SortKey<'s>,
    descending: bool,
}

fn resolve_sort_keys(stmt: &SelectStatement) -> Result<Vec<OrderTerm<'_>>> {
    stmt.order_by
        .iter()
        .map(|o| {
            resolve_sort_key(stmt, &o.expr).map(|key| OrderTerm {
                key,
                descending: o.descending,
            })
        })
        .collect()
}

/// Map an ORDER BY expression onto what the sort stage can read.
///
/// Aggregate rows only carry their output and GROUP BY values, so there the
/// expression must name one of those. Record rows can sort by any scalar
/// expression or by a SELECT alias.
fn resolve_sort_key<'s>(stmt: &'s SelectStatement, expr: &'s Expr) -> Result<SortKey<'s>> {
    if stmt.is_aggregate() {
        let found = match expr {
            Expr::Named(name) => output_position(stmt, name)?.map(SortKey::Output),
            expr => stmt
                .projections
                .iter()
                .position(|p| &p.expr == expr)
                .map(SortKey::Output)
                .or_else(|| {
                    stmt.group_by
                        .iter()
                        .position(|g| g == expr)
                        .map(SortKey::GroupKey)
                }),
        };
        return found.ok_or_else(|| {
            SqlError::InvalidQuery(format!(
                "ORDER BY {} must name an output or GROUP BY column",
                expr
            ))
        });
    }

    match expr {
        Expr::Named(name) => {
            let idx = output_position(stmt, name)?.ok_or_else(|| {
                SqlError::InvalidQuery(format!("unknown ORDER BY column: {}", name))
            })?;
            Ok(SortKey::Row(&stmt.projections[idx].expr))
        }
        Expr::Aggregate { .. } => Err(SqlError::InvalidQuery(
            "aggregate in ORDER BY requires an aggregate query".to_string(),
        )),
        expr => Ok(SortKey::Row(expr)),
    }
}

/// Position of the SELECT entry called `name`, by alias or rendered name.
///
/// Several entries may share a name only if they compute the same thing.
fn output_position(stmt: &SelectStatement, name: &str) -> Result<Option<usize>> {
    let mut found: Option<usize> = None;
    for (idx, p) in stmt.projections.iter().enumerate() {
        if p.alias.as_deref() != Some(name) && p.output_name() != name {
            continue;
        }
        match found {
            None => found = Some(idx),
            Some(first) if stmt.projections[first].expr != p.expr => {
                return Err(SqlError::InvalidQuery(format!(
                    "ORDER BY {} is ambiguous",
                    name
                )));
            }
            Some(_) => {}
        }
    }
    Ok(found)
}

fn compare_keys(a: &[Value], b: &[Value], terms: &[OrderTerm<'_>]) -> Ordering {
    for ((x, y), term) in a.iter().zip(b.iter()).zip(terms) {
        let ord = compare_values(x, y);
        let ord = if term.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort of record rows; ties keep their prior order.
fn order_rows<'a>(rows: Vec<EvalRow<'a>>, terms: &[OrderTerm<'_>], scope: &Scope<'_>) -> Vec<EvalRow<'a>> {
    if terms.is_empty() {
        return rows;
    }
    let mut keyed: Vec<(Vec<Value>, EvalRow<'a>)> = rows
        .into_iter()
        .map(|row| {
            let keys = terms
                .iter()
                .map(|term| match term.key {
                    SortKey::Row(expr) => eval(expr, scope, row).unwrap_or(Value::Null),
                    SortKey::Output(_) | SortKey::GroupKey(_) => Value::Null,
                })
                .collect();
            (keys, row)
        })
        .collect();
    keyed.sort_by(|a, b| compare_keys(&a.0, &b.0, terms));
    keyed.into_iter().map(|(_, row)| row).collect()
}

/// Stable sort of aggregate rows.
fn order_groups(mut groups: Vec<GroupRow>, terms: &[OrderTerm<'_>]) -> Vec<GroupRow> {
    if terms.is_empty() {
        return groups;
    }
    let key_of = |g: &GroupRow| -> Vec<Value> {
        terms
            .iter()
            .map(|term| match term.key {
                SortKey::Output(i) => g.values.get(i).cloned().unwrap_or(Value::Null),
                SortKey::GroupKey(i) => g.key.get(i).cloned().unwrap_or(Value::Null),
                SortKey::Row(_) => Value::Null,
            })
            .collect()
    };
    groups.sort_by(|a, b| compare_keys(&key_of(a), &key_of(b), terms));
    groups
}

/// Evaluate the SELECT list for one row. Values that cannot be evaluated are
/// NULL.
fn project(row: EvalRow<'_>, stmt: &SelectStatement, scope: &Scope<'_>) -> ResultRow {
    stmt.projections
        .iter()
        .map(|p| eval(&p.expr, scope, row).ok().and_then(|v| render(&v)))
        .collect()
}

async fn stream_rows(
    cancel: &CancellationToken,
    sink: &mut dyn ResultSink,
    columns: &[ColumnInfo],
    rows: Vec<ResultRow>,
) -> Result<u64> {
    sink.describe(columns).await?;

    let mut written = 0u64;
    for row in rows {
        check_cancelled(cancel)?;
        if sink.is_closed() {
            return Err(SqlError::Sink("client connection closed".to_string()));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SqlError::Cancelled),
            res = sink.write_row(row) => res?,
        }
        written += 1;
    }

    sink.complete(&format!("SELECT {}", written)).await?;
    Ok(written)
}
