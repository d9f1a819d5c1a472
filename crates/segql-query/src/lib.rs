//! segql Query Engine
//!
//! Runs SELECT statements over the completed segments of Kafka-compatible
//! topics. Every query sees a point-in-time snapshot: segments are listed and
//! decoded per query, and results stream to a [`ResultSink`].
//!
//! ## Supported SQL
//!
//! ```sql
//! -- Most recent records across all partitions
//! SELECT _partition, _offset, _value FROM orders TAIL 100;
//!
//! -- Time-bounded scan, newest first
//! SELECT _offset FROM orders ORDER BY _ts DESC LIMIT 1 LAST 1h;
//!
//! -- Filter on a JSON field
//! SELECT _key, json_value(_value, '$.amount') AS amount
//! FROM orders
//! WHERE json_value(_value, '$.amount') > 100
//! LAST 15m;
//!
//! -- Aggregation per partition
//! SELECT _partition, COUNT(*) AS total, SUM(_offset)
//! FROM orders
//! GROUP BY _partition
//! LAST 1h;
//!
//! -- Windowed equi-join
//! SELECT o._offset, p._offset
//! FROM orders o
//! JOIN payments p
//!   ON json_value(o._value, '$.id') = json_value(p._value, '$.id')
//!   WITHIN 10m
//! LAST 1h;
//! ```
//!
//! ## Guardrails
//!
//! - A query without LAST or TAIL is rejected unless time bounds are optional
//! - Time-bounded queries default to `default_limit` rows
//! - Unbounded queries are capped at `max_unbounded` rows
//!
//! ## Limitations
//!
//! - No SQL text parsing (statements arrive pre-parsed)
//! - Single equi-join, inner only
//! - No subqueries, HAVING or writes

mod config;
mod error;
mod executor;
mod expr;
mod sink;
mod types;

pub use config::QueryConfig;
pub use error::SqlError;
pub use executor::QueryEngine;
pub use sink::{ChannelSink, ResultSink, SinkMessage};
pub use types::*;

/// Result type for query operations
pub type Result<T> = std::result::Result<T, SqlError>;
