//! Core types used across the attestation system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA-256 hash (32 bytes)
pub type Hash256 = [u8; 32];

/// Ed25519 signature length in bytes
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 public key / secret seed length in bytes
pub const KEY_LENGTH: usize = 32;

/// Server identifier (unique per attested machine)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    /// Create a server id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receipt returned by a publication gateway (ledger transaction id, journal line, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub String);

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of attestation a certificate carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateKind {
    /// First attestation, persisted with the public key and exclusion set
    Birth,
    /// Recurring attestation, only its payload digest leaves the machine
    ProofOfLife,
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateKind::Birth => write!(f, "birth-certificate"),
            CertificateKind::ProofOfLife => write!(f, "proof-of-life"),
        }
    }
}
