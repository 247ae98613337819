//! Raw-file key store.
//!
//! Keys live in a directory as two files of 32 raw bytes each:
//! `private_key.bin` (mode 0600) and `public_key.bin`. Both are written via a
//! temp file and a rename so a crash never leaves a truncated key behind.

use std::fs;
use std::io;
use std::path::PathBuf;
use tars_core::serialization::write_atomic_with_mode;
use tars_core::{Identity, KeyStore, KeyStoreError};
use tracing::debug;

pub const PRIVATE_KEY_FILE: &str = "private_key.bin";
pub const PUBLIC_KEY_FILE: &str = "public_key.bin";

pub struct FileKeyStore {
    dir: PathBuf,
    overwrite: bool,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            overwrite: false,
        }
    }

    /// Allow `store` to replace an existing key pair.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }
}

impl KeyStore for FileKeyStore {
    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }

    fn load(&self) -> Result<Identity, KeyStoreError> {
        let secret = match fs::read(self.private_key_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(KeyStoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        // The public key file is optional; when present it must match.
        match fs::read(self.public_key_path()) {
            Ok(public) => Ok(Identity::from_keypair_bytes(&secret, &public)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Identity::from_secret_bytes(&secret)?),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, identity: &Identity) -> Result<(), KeyStoreError> {
        let private_path = self.private_key_path();
        if private_path.exists() && !self.overwrite {
            return Err(KeyStoreError::AlreadyExists(private_path.display().to_string()));
        }
        fs::create_dir_all(&self.dir)?;
        write_atomic_with_mode(&private_path, &identity.secret_bytes(), 0o600)?;
        write_atomic_with_mode(&self.public_key_path(), &identity.public_key_bytes(), 0o644)?;
        debug!(dir = %self.dir.display(), "key pair written");
        Ok(())
    }
}
