//! Result sinks.
//!
//! A query streams to its sink in protocol order: one row description, zero
//! or more data rows, then either a completion tag or an error. Rows already
//! handed to the sink are never retracted.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SqlError;
use crate::types::{ColumnInfo, ResultRow};
use crate::Result;

/// Row-oriented destination for query results.
#[async_trait]
pub trait ResultSink: Send {
    /// Announce the result columns.
    async fn describe(&mut self, columns: &[ColumnInfo]) -> Result<()>;

    /// Write one data row.
    async fn write_row(&mut self, row: ResultRow) -> Result<()>;

    /// Mark the result as complete, e.g. `SELECT 3`.
    async fn complete(&mut self, tag: &str) -> Result<()>;

    /// Report a query failure on the result channel.
    async fn error(&mut self, code: &str, message: &str) -> Result<()>;

    /// Whether the client side has gone away.
    fn is_closed(&self) -> bool;
}

/// Messages emitted by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    RowDescription(Vec<ColumnInfo>),
    DataRow(ResultRow),
    CommandComplete(String),
    Error { code: String, message: String },
}

/// A sink backed by a bounded channel. A slow receiver backpressures the
/// query; a dropped receiver reads as a closed connection.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, msg: SinkMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SqlError::Sink("result channel closed".to_string()))
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn describe(&mut self, columns: &[ColumnInfo]) -> Result<()> {
        self.send(SinkMessage::RowDescription(columns.to_vec())).await
    }

    async fn write_row(&mut self, row: ResultRow) -> Result<()> {
        self.send(SinkMessage::DataRow(row)).await
    }

    async fn complete(&mut self, tag: &str) -> Result<()> {
        self.send(SinkMessage::CommandComplete(tag.to_string())).await
    }

    async fn error(&mut self, code: &str, message: &str) -> Result<()> {
        self.send(SinkMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        })
        .await
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
