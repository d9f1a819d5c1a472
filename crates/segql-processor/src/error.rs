//! Error types for the record processor.

use thiserror::Error;

/// Errors that end a processor run.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The record source failed to produce a batch.
    #[error("Source error: {0}")]
    Source(String),

    /// Writing a batch to the sink failed.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Closing the sink failed. Reported even after a clean cancellation.
    #[error("Sink close error: {0}")]
    SinkClose(String),

    /// Invalid processor configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for processor operations.
pub type Result<T> = std::result::Result<T, ProcessorError>;

impl From<segql_core::Error> for ProcessorError {
    fn from(e: segql_core::Error) -> Self {
        ProcessorError::Source(e.to_string())
    }
}
