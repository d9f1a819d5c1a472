//! SQL error types

use thiserror::Error;

/// Query execution errors
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Segment resolution failed: {0}")]
    Resolution(#[from] segql_core::Error),

    #[error("Guardrail violation: {0}")]
    Guardrail(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Result sink error: {0}")]
    Sink(String),

    #[error("Query cancelled")]
    Cancelled,
}

impl SqlError {
    /// SQLSTATE-style code reported to the client alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            SqlError::ParseError(_) => "42601",
            SqlError::Resolution(_) => "58030",
            SqlError::Guardrail(_) => "54000",
            SqlError::InvalidQuery(_) => "42000",
            SqlError::Config(_) => "F0000",
            SqlError::Sink(_) => "08006",
            SqlError::Cancelled => "57014",
        }
    }

    /// Whether the failure can still be reported on the result channel.
    pub(crate) fn is_reportable(&self) -> bool {
        !matches!(self, SqlError::Sink(_) | SqlError::Cancelled)
    }
}
