//! Key-store capability.
//!
//! Where and how key material is kept is up to the implementation: raw files,
//! an encrypted vault, a hardware token. The core only needs to load an
//! unlocked [`Identity`] and to persist a freshly generated one.

use crate::identity::{Identity, IdentityError};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no identity has been stored yet")]
    NotFound,

    #[error("an identity already exists in {0}")]
    AlreadyExists(String),

    #[error("malformed key material: {0}")]
    Malformed(#[from] IdentityError),

    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key store error: {0}")]
    Backend(String),
}

/// Persistence boundary for an [`Identity`].
pub trait KeyStore: Send + Sync {
    /// Short description for logs (never includes key bytes).
    fn describe(&self) -> String;

    /// Load the stored identity.
    fn load(&self) -> Result<Identity, KeyStoreError>;

    /// Persist a new identity.
    fn store(&self, identity: &Identity) -> Result<(), KeyStoreError>;
}

/// Keeps the raw seed in memory. Useful for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKeyStore {
    seed: Mutex<Option<[u8; 32]>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with `identity`.
    pub fn with_identity(identity: &Identity) -> Self {
        Self {
            seed: Mutex::new(Some(identity.secret_bytes())),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn load(&self) -> Result<Identity, KeyStoreError> {
        let guard = self
            .seed
            .lock()
            .map_err(|_| KeyStoreError::Backend("key store lock poisoned".into()))?;
        let seed = guard.as_ref().ok_or(KeyStoreError::NotFound)?;
        Ok(Identity::from_secret_bytes(seed)?)
    }

    fn store(&self, identity: &Identity) -> Result<(), KeyStoreError> {
        let mut guard = self
            .seed
            .lock()
            .map_err(|_| KeyStoreError::Backend("key store lock poisoned".into()))?;
        if guard.is_some() {
            return Err(KeyStoreError::AlreadyExists(self.describe()));
        }
        *guard = Some(identity.secret_bytes());
        Ok(())
    }
}
