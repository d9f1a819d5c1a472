//! Processor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessorError, Result};

/// Default back-off after an empty poll.
fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Name used in log fields.
    pub name: String,

    /// How long to wait after a poll returns no records. Defaults to 100ms.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProcessorError::Config(
                "processor name must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ProcessorError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
