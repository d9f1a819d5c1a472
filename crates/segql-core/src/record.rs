//! Record Data Structures
//!
//! ## Record
//! A decoded log entry as the query engine and the processor see it:
//! - **topic / partition**: where the record lives
//! - **offset**: strictly increasing within a (topic, partition)
//! - **timestamp**: milliseconds since epoch
//! - **key / value**: raw bytes, either may be absent
//!
//! Decoding a segment yields records in ascending-offset order. Records are
//! never mutated after decoding.
//!
//! ## OutputRecord
//! The shape the processor hands to its sink: just the offset and the raw
//! payload. The payload is the record value, byte for byte.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single decoded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Topic the record belongs to
    pub topic: String,

    /// Partition within the topic
    pub partition: u32,

    /// Offset of this record in the partition
    pub offset: u64,

    /// Timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Optional value (payload)
    pub value: Option<Bytes>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, timestamp: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            key: None,
            value: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A record as written by the processor's sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub offset: u64,
    pub payload: Bytes,
}

impl OutputRecord {
    pub fn new(offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }

    /// Rebuild a record carrying this offset and payload as its value.
    pub fn into_record(self, topic: impl Into<String>, partition: u32, timestamp: i64) -> Record {
        Record {
            topic: topic.into(),
            partition,
            offset: self.offset,
            timestamp,
            key: None,
            value: Some(self.payload),
        }
    }
}

impl From<&Record> for OutputRecord {
    /// An absent value maps to an empty payload.
    fn from(record: &Record) -> Self {
        Self {
            offset: record.offset,
            payload: record.value.clone().unwrap_or_default(),
        }
    }
}
