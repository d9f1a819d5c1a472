//! Segment source interface.
//!
//! The query engine never touches segment storage directly. It asks a
//! [`SegmentLister`] which completed segments exist for a topic and a
//! [`SegmentDecoder`] to turn each one into records. Both must be safe to
//! call from many queries at once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::segment::SegmentRef;

/// Enumerates completed segments.
#[async_trait]
pub trait SegmentLister: Send + Sync {
    /// List every completed segment of `topic`.
    ///
    /// Segments of one partition are listed in ascending offset order.
    async fn list_completed(&self, topic: &str) -> Result<Vec<SegmentRef>>;
}

/// Decodes a segment into its records.
#[async_trait]
pub trait SegmentDecoder: Send + Sync {
    /// Decode one segment. Records come back in ascending-offset order.
    async fn decode(
        &self,
        segment_key: &str,
        index_key: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Vec<Record>>;
}

/// An in-memory segment store implementing both sides of the source.
pub struct InMemorySegmentStore {
    segments: RwLock<Vec<SegmentRef>>,
    /// segment key -> records
    records: RwLock<HashMap<String, Arc<Vec<Record>>>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(Vec::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Register a completed segment and the records it decodes to.
    pub async fn add_segment(&self, segment: SegmentRef, mut records: Vec<Record>) {
        records.sort_by_key(|r| r.offset);
        self.records
            .write()
            .await
            .insert(segment.segment_key.clone(), Arc::new(records));
        self.segments.write().await.push(segment);
    }

    /// Number of registered segments across all topics.
    pub async fn segment_count(&self) -> usize {
        self.segments.read().await.len()
    }
}

impl Default for InMemorySegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SegmentLister for InMemorySegmentStore {
    async fn list_completed(&self, topic: &str) -> Result<Vec<SegmentRef>> {
        let segments = self.segments.read().await;
        Ok(segments
            .iter()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SegmentDecoder for InMemorySegmentStore {
    async fn decode(
        &self,
        segment_key: &str,
        _index_key: &str,
        _topic: &str,
        _partition: u32,
    ) -> Result<Vec<Record>> {
        let records = self.records.read().await;
        records
            .get(segment_key)
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| Error::SegmentNotFound(segment_key.to_string()))
    }
}
