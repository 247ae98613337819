//! Error types for the agent.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or writing agent files.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for [`crate::AgentConfig`].
    #[error("invalid config JSON: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Config parsed but failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Refused to replace an existing file.
    #[error("'{}' already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tars_core::ConfigError> for AgentError {
    fn from(e: tars_core::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}
