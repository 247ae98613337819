//! Digest engine: SHA-256 over byte content, one-shot or streamed.

use crate::types::Hash256;
use sha2::{Digest, Sha256};
use std::io::{self, Write};

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> Hash256 {
    let hash = Sha256::digest(data);
    hash.into()
}

/// Incremental SHA-256 hasher for inputs too large to hold in memory.
///
/// The state is small and `Clone`, so callers can take a [`Checkpoint`]
/// before feeding an untrusted source and roll back if that source fails
/// part-way.
#[derive(Clone, Default)]
pub struct StateHasher {
    inner: Sha256,
    bytes: u64,
}

/// Saved hasher state, see [`StateHasher::checkpoint`].
#[derive(Clone)]
pub struct Checkpoint(StateHasher);

impl StateHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Total number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Snapshot the current state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.clone())
    }

    /// Discard everything fed since `checkpoint` was taken.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        *self = checkpoint.0;
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> Hash256 {
        self.inner.finalize().into()
    }
}

impl Write for StateHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
