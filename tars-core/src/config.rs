//! Attestation configuration.
//!
//! Parsing the file is the caller's job; the core receives a validated
//! [`AttestationConfig`].

use crate::certificate::validate_server_id;
use crate::exclusion::{ExclusionSet, PatternError};
use crate::types::ServerId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default wait for a single publication.
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server_id: {0}")]
    ServerId(String),

    #[error("proof_interval must be greater than zero")]
    ZeroInterval,

    #[error("publish_timeout_secs must be greater than zero")]
    ZeroTimeout,

    #[error("invalid exclusion pattern: {0}")]
    Exclusion(#[from] PatternError),
}

/// What the monitor loop does when publication fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailurePolicy {
    /// Log the failure and keep attesting on the next interval.
    #[default]
    Continue,
    /// Stop the loop with an error.
    FailFast,
}

fn default_state_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_publish_timeout() -> u64 {
    DEFAULT_PUBLISH_TIMEOUT_SECS
}

/// Settings shared by the birth flow and the monitor loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationConfig {
    pub server_id: ServerId,
    /// Exclusion globs; see [`crate::exclusion`] for the matching rules.
    /// Omitted in a config file means [`AttestationConfig::default_exclusions`].
    #[serde(default = "AttestationConfig::default_exclusions")]
    pub excluded_files: Vec<String>,
    /// Seconds between proof-of-life cycles.
    pub proof_interval: u64,
    /// Directory whose contents are attested.
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub on_publish_failure: PublishFailurePolicy,
}

impl AttestationConfig {
    /// A config with the default exclusions and settings.
    pub fn new(server_id: ServerId, proof_interval: u64) -> Self {
        Self {
            server_id,
            excluded_files: Self::default_exclusions(),
            proof_interval,
            state_root: default_state_root(),
            publish_timeout_secs: DEFAULT_PUBLISH_TIMEOUT_SECS,
            on_publish_failure: PublishFailurePolicy::Continue,
        }
    }

    /// High-churn and ephemeral paths that would make the digest unstable,
    /// plus the tool's own key and certificate files.
    pub fn default_exclusions() -> Vec<String> {
        [
            "/proc",
            "/sys",
            "/dev",
            "/run",
            "/tmp",
            "/var/tmp",
            "/var/log",
            "/var/cache",
            "/var/lib/tars",
            "*.log",
            "*.pid",
            "*.swp",
            "private_key.bin",
            "public_key.bin",
            "birth_certificate.json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server_id(&self.server_id).map_err(|e| ConfigError::ServerId(e.to_string()))?;
        if self.proof_interval == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.publish_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        self.exclusion_set()?;
        Ok(())
    }

    /// Compile the exclusion globs.
    pub fn exclusion_set(&self) -> Result<ExclusionSet, PatternError> {
        ExclusionSet::new(&self.excluded_files)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.proof_interval)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}
