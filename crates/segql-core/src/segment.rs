//! Segment References
//!
//! A segment is an immutable, completed chunk of one topic-partition's log.
//! The segment source lists them; the core only ever reads them. Partially
//! written segments are never listed.

use serde::{Deserialize, Serialize};

/// Locates one completed segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Topic name
    pub topic: String,

    /// Partition ID
    pub partition: u32,

    /// Storage key of the segment data
    pub segment_key: String,

    /// Storage key of the segment's offset index
    pub index_key: String,
}

impl SegmentRef {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        segment_key: impl Into<String>,
        index_key: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            segment_key: segment_key.into(),
            index_key: index_key.into(),
        }
    }
}
