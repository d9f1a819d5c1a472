//! Error types for segment access.
//!
//! Every error here is a resolution failure from the caller's point of view:
//! listing or decoding a segment went wrong and the operation can be retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Decode error in segment {segment}: {message}")]
    Decode { segment: String, message: String },

    #[error("Segment source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;
