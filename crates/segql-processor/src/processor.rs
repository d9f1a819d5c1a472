//! Record processor loop.
//!
//! The [`Processor`] repeatedly polls a [`RecordSource`] for decoded records,
//! maps them to [`OutputRecord`]s, drops anything at or below the partition's
//! watermark and writes the rest to a [`RecordSink`] while holding the
//! topic's lock. It runs until its cancellation token fires or a source or
//! sink call fails, and closes the sink on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use segql_core::{OutputRecord, Record};

use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::lock::TopicLocker;

/// Supplies batches of decoded records.
#[async_trait]
pub trait RecordSource: Send {
    /// Next batch. An empty batch means nothing is available yet.
    async fn poll(&mut self) -> Result<Vec<Record>>;
}

/// Destination for processed records.
///
/// Shared between processors, so writes for one topic may come from several
/// of them; the processor serializes those through the topic lock.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, records: &[OutputRecord]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One output record per input record, in the same order.
pub fn map_records(records: &[Record]) -> Vec<OutputRecord> {
    records.iter().map(OutputRecord::from).collect()
}

/// Keep records with `offset > threshold`, in order.
pub fn filter_records(records: Vec<OutputRecord>, threshold: u64) -> Vec<OutputRecord> {
    records
        .into_iter()
        .filter(|r| r.offset > threshold)
        .collect()
}

/// Split a batch by (topic, partition). Groups appear in order of first
/// occurrence and keep their records' relative order.
fn split_by_partition(batch: Vec<Record>) -> Vec<((String, u32), Vec<Record>)> {
    let mut index: HashMap<(String, u32), usize> = HashMap::new();
    let mut groups: Vec<((String, u32), Vec<Record>)> = Vec::new();
    for record in batch {
        let key = (record.topic.clone(), record.partition);
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }
    groups
}

pub struct Processor {
    config: ProcessorConfig,
    source: Box<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    locks: Arc<TopicLocker>,
    /// Highest delivered offset per (topic, partition)
    watermarks: HashMap<(String, u32), u64>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        source: Box<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        locks: Arc<TopicLocker>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            locks,
            watermarks: HashMap::new(),
        }
    }

    /// Treat everything up to and including `offset` as already delivered.
    pub fn with_watermark(mut self, topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        self.watermarks.insert((topic.into(), partition), offset);
        self
    }

    /// Highest offset delivered for a partition, if any.
    pub fn watermark(&self, topic: &str, partition: u32) -> Option<u64> {
        self.watermarks.get(&(topic.to_string(), partition)).copied()
    }

    /// Run until `cancel` fires or a source or sink call fails.
    ///
    /// A batch already taken from the source is written even if cancellation
    /// arrives meanwhile. The sink is closed before returning in every case;
    /// cancellation alone returns `Ok`, a failed close returns `SinkClose`.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(processor = %self.config.name, "processor started");

        let outcome = self.run_loop(&cancel).await;
        let closed = self.sink.close().await;

        match (outcome, closed) {
            (Ok(()), Ok(())) => {
                info!(processor = %self.config.name, "processor stopped");
                Ok(())
            }
            (Ok(()), Err(e)) => {
                error!(processor = %self.config.name, error = %e, "error closing sink");
                Err(ProcessorError::SinkClose(e.to_string()))
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(
                        processor = %self.config.name,
                        error = %close_err,
                        "error closing sink after failure"
                    );
                }
                error!(processor = %self.config.name, error = %e, "processor failed");
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.config.validate()?;
        let poll_interval = self.config.poll_interval();

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = self.source.poll() => polled?,
            };

            if batch.is_empty() {
                // Nothing available; back off without missing cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }

            self.process_batch(batch).await?;
        }
    }

    async fn process_batch(&mut self, batch: Vec<Record>) -> Result<()> {
        for ((topic, partition), records) in split_by_partition(batch) {
            let key = (topic, partition);
            let mapped = map_records(&records);
            let pending = match self.watermarks.get(&key) {
                Some(&watermark) => filter_records(mapped, watermark),
                None => mapped,
            };

            let Some(high) = pending.iter().map(|r| r.offset).max() else {
                debug!(
                    processor = %self.config.name,
                    topic = %key.0,
                    partition,
                    "batch already delivered"
                );
                continue;
            };

            let guard = self.locks.lock(&key.0).await;
            self.sink.write(&pending).await?;
            guard.release();

            debug!(
                processor = %self.config.name,
                topic = %key.0,
                partition,
                records = pending.len(),
                watermark = high,
                "wrote batch"
            );
            self.watermarks.insert(key, high);
        }
        Ok(())
    }
}
