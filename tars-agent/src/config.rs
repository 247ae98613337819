//! Agent configuration file.
//!
//! The file is JSON. Attestation settings sit at the top level next to the
//! agent's own paths:
//!
//! ```json
//! {
//!   "server_id": "wg-edge-01",
//!   "proof_interval": 3600,
//!   "excluded_files": ["/proc", "*.log"],
//!   "key_dir": "/var/lib/tars"
//! }
//! ```

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tars_core::{AttestationConfig, ServerId};

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tars/config.json";

fn default_key_dir() -> PathBuf {
    PathBuf::from("/var/lib/tars")
}

fn default_certificate_path() -> PathBuf {
    default_key_dir().join("birth_certificate.json")
}

fn default_journal_path() -> PathBuf {
    default_key_dir().join("publications.log")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub attestation: AttestationConfig,
    /// Directory holding `private_key.bin` and `public_key.bin`.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_certificate_path")]
    pub certificate_path: PathBuf,
    /// Append-only file the journal gateway publishes into.
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
}

impl AgentConfig {
    /// Sample config with default exclusions and paths.
    pub fn sample(server_id: ServerId, proof_interval: u64) -> Self {
        Self {
            attestation: AttestationConfig::new(server_id, proof_interval),
            key_dir: default_key_dir(),
            certificate_path: default_certificate_path(),
            journal_path: default_journal_path(),
        }
    }

    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, AgentError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        self.attestation.validate()?;
        if self.key_dir.as_os_str().is_empty() {
            return Err(AgentError::Config("key_dir cannot be empty".to_string()));
        }
        if self.certificate_path.file_name().is_none() {
            return Err(AgentError::Config(
                "certificate_path must name a file".to_string(),
            ));
        }
        if self.journal_path.file_name().is_none() {
            return Err(AgentError::Config("journal_path must name a file".to_string()));
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate and write this config to a new file, creating parent
    /// directories. Never replaces an existing file.
    pub fn write_new(&self, path: &Path) -> Result<(), AgentError> {
        if path.exists() {
            return Err(AgentError::AlreadyExists(path.to_path_buf()));
        }
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut json = self.to_json_pretty()?;
        json.push('\n');
        std::fs::write(path, json)?;
        Ok(())
    }
}
