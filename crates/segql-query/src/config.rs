//! Query guardrail configuration.

use serde::{Deserialize, Serialize};

use crate::error::SqlError;
use crate::Result;

fn default_limit() -> usize {
    1000
}

fn default_max_unbounded() -> usize {
    10_000
}

fn default_require_time_bound() -> bool {
    true
}

/// Limits applied to every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Row limit when a query carries no LIMIT.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Row cap for queries with neither TAIL nor LAST.
    #[serde(default = "default_max_unbounded")]
    pub max_unbounded: usize,

    /// Reject queries with neither TAIL nor LAST.
    #[serde(default = "default_require_time_bound")]
    pub require_time_bound: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_unbounded: default_max_unbounded(),
            require_time_bound: default_require_time_bound(),
        }
    }
}

impl QueryConfig {
    /// Build from `SEGQL_DEFAULT_LIMIT`, `SEGQL_MAX_UNBOUNDED` and
    /// `SEGQL_REQUIRE_TIME_BOUND`, keeping defaults for unset or invalid values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "SEGQL_DEFAULT_LIMIT") {
            config.default_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "SEGQL_MAX_UNBOUNDED") {
            config.max_unbounded = v;
        }
        if let Some(v) = parse_var(&lookup, "SEGQL_REQUIRE_TIME_BOUND") {
            config.require_time_bound = v;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_limit == 0 {
            return Err(SqlError::Config(
                "default_limit must be greater than zero".to_string(),
            ));
        }
        if self.max_unbounded == 0 {
            return Err(SqlError::Config(
                "max_unbounded must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring invalid config value");
            None
        }
    }
}
