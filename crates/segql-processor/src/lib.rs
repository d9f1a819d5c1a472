//! segql record processor
//!
//! Moves decoded records from a source into a sink under cancellation
//! control. Writes for the same topic are serialized through a shared
//! [`TopicLocker`], and each partition's watermark keeps already delivered
//! offsets from being written twice.
//!
//! ```ignore
//! let locks = Arc::new(TopicLocker::new());
//! let mut processor = Processor::new(
//!     ProcessorConfig::new("orders-export"),
//!     Box::new(source),
//!     Arc::new(sink),
//!     Arc::clone(&locks),
//! );
//! let cancel = CancellationToken::new();
//! processor.run(cancel.child_token()).await?;
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod processor;

pub use config::ProcessorConfig;
pub use error::{ProcessorError, Result};
pub use lock::{TopicGuard, TopicLocker};
pub use processor::{filter_records, map_records, Processor, RecordSink, RecordSource};
