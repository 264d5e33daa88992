//! Module: config
//! Responsibility: query-compilation and execution options loaded from TOML.
//! Does not own: provider connection strings or capability discovery.

#[cfg(test)]
mod tests;

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use thiserror::Error as ThisError;

///
/// ConfigError
///

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid relq config: {0}")]
    Parse(#[from] toml::de::Error),
}

///
/// ClientEvalPolicy
///
/// Outcome when a clause first requires client evaluation.
///

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvalPolicy {
    Throw,
    #[default]
    Warn,
    Ignore,
}

///
/// QueryOptions
///

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueryOptions {
    pub client_eval: ClientEvalPolicy,

    /// Include parameter values in command logs.
    pub sensitive_data_logging: bool,

    /// Applied to every provider command when the connection carries none.
    pub command_timeout_secs: Option<u64>,

    /// Fail adjacency-dependent operators when a key reappears after its run.
    pub verify_row_ordering: bool,
}

impl QueryOptions {
    #[must_use]
    pub const fn with_client_eval(mut self, policy: ClientEvalPolicy) -> Self {
        self.client_eval = policy;
        self
    }

    #[must_use]
    pub const fn with_sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }

    #[must_use]
    pub const fn with_row_ordering_check(mut self, enabled: bool) -> Self {
        self.verify_row_ordering = enabled;
        self
    }

    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// Parse options from a TOML document with an optional `[query]` table.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)?;

        Ok(file.query)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_toml_str(&source)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    query: QueryOptions,
}
