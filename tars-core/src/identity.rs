//! Ed25519 identity: key generation, signing and verification.
//!
//! The secret half never leaves this type except through
//! [`Identity::secret_bytes`], which exists for key stores only. `Debug`
//! prints the public key alone.

use crate::types::{Hash256, KEY_LENGTH, SIGNATURE_LENGTH};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Structurally invalid key or signature material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid secret key length: expected 32 bytes, got {0}")]
    InvalidSecretKeyLength(usize),

    #[error("invalid public key length: expected 32 bytes, got {0}")]
    InvalidPublicKeyLength(usize),

    #[error("public key is not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("public key does not match secret key")]
    PublicKeyMismatch,
}

/// Signing failed on malformed key material.
#[derive(Debug, Error)]
#[error("signing failed: {0}")]
pub struct SigningError(String);

/// An Ed25519 keypair identifying one attested machine.
///
/// The inner [`SigningKey`] is zeroized on drop.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct an identity from a raw 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let seed: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidSecretKeyLength(bytes.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Reconstruct an identity and check it against a stored public key.
    pub fn from_keypair_bytes(secret: &[u8], public: &[u8]) -> Result<Self, IdentityError> {
        let identity = Self::from_secret_bytes(secret)?;
        if public.len() != KEY_LENGTH {
            return Err(IdentityError::InvalidPublicKeyLength(public.len()));
        }
        if identity.public_key_bytes().as_slice() != public {
            return Err(IdentityError::PublicKeyMismatch);
        }
        Ok(identity)
    }

    /// Sign a state digest.
    ///
    /// Ed25519 is deterministic: the same key and digest always give the same
    /// signature.
    pub fn sign(&self, digest: &Hash256) -> Result<Signature, SigningError> {
        self.signing_key
            .try_sign(digest)
            .map_err(|e| SigningError(e.to_string()))
    }

    /// Get the verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.verifying_key().to_bytes()
    }

    /// Raw 32-byte secret seed, for key stores only.
    pub fn secret_bytes(&self) -> [u8; KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a signature over a digest.
///
/// Returns `Ok(false)` for a well-formed signature that does not match. Errors
/// only when the key or signature have the wrong shape.
pub fn verify(public_key: &[u8], digest: &[u8], signature: &[u8]) -> Result<bool, IdentityError> {
    let key_bytes: [u8; KEY_LENGTH] = public_key
        .try_into()
        .map_err(|_| IdentityError::InvalidPublicKeyLength(public_key.len()))?;
    let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| IdentityError::InvalidSignatureLength(signature.len()))?;

    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(digest, &signature).is_ok())
}
