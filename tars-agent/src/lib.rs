//! Host-side pieces of the TARS agent: config file, raw-file key store and
//! the journal publication gateway.

pub mod config;
pub mod error;
pub mod journal;
pub mod keystore;

pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
pub use error::AgentError;
pub use journal::JournalGateway;
pub use keystore::FileKeyStore;
