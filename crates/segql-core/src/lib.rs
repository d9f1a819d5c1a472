//! Shared data model for segql.
//!
//! Records decoded from immutable log segments, the references that locate
//! those segments, and the interface through which the query engine and the
//! record processor reach segment storage.

pub mod error;
pub mod record;
pub mod segment;
pub mod source;

pub use error::{Error, Result};
pub use record::{OutputRecord, Record};
pub use segment::SegmentRef;
pub use source::{InMemorySegmentStore, SegmentDecoder, SegmentLister};
