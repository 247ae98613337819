//! Birth certificates and proof-of-life records.
//!
//! Both are immutable once built. Hash, signature and key fields are stored
//! as lowercase hex so the JSON file form and the canonical CBOR form carry
//! the exact same strings.
//!
//! ## Publication payload
//! `SHA-256(canonical CBOR of the certificate)`. Field order is the struct
//! declaration order, so re-encoding an unchanged certificate always yields
//! the same payload.

use crate::capture::{CaptureError, CaptureReport, StateCapture};
use crate::crypto::sha256;
use crate::exclusion::{ExclusionSet, PatternError};
use crate::identity::{self, IdentityError};
use crate::serialization::{
    from_json, to_canonical_cbor, to_json_pretty, write_atomic, SerializationError,
};
use crate::types::{CertificateKind, Hash256, ServerId, KEY_LENGTH, SIGNATURE_LENGTH};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// The first, persisted attestation of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthCertificate {
    pub server_id: ServerId,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 state digest, 64 hex chars
    pub state_hash: String,
    /// Ed25519 signature over the raw state digest, 128 hex chars
    pub signature: String,
    /// Ed25519 public key, 64 hex chars
    pub public_key: String,
    /// Exclusion globs in force when the state was captured
    pub excluded_files: Vec<String>,
}

/// A recurring attestation; only its payload digest is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfLife {
    pub server_id: ServerId,
    pub timestamp: DateTime<Utc>,
    pub state_hash: String,
    pub signature: String,
}

/// Behaviour shared by both certificate variants.
pub trait Certificate: Serialize + Sized {
    fn kind(&self) -> CertificateKind;

    fn server_id(&self) -> &ServerId;

    fn timestamp(&self) -> DateTime<Utc>;

    /// Canonical CBOR bytes of the whole record.
    fn to_canonical_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        to_canonical_cbor(self)
    }

    /// Digest handed to the publication gateway.
    fn publication_payload(&self) -> Result<Hash256, SerializationError> {
        Ok(sha256(&self.to_canonical_bytes()?))
    }
}

impl Certificate for BirthCertificate {
    fn kind(&self) -> CertificateKind {
        CertificateKind::Birth
    }

    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Certificate for ProofOfLife {
    fn kind(&self) -> CertificateKind {
        CertificateKind::ProofOfLife
    }

    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl BirthCertificate {
    /// Verify the signature against the embedded public key.
    pub fn verify(&self) -> Result<(), VerificationError> {
        let public_key = decode_hex::<KEY_LENGTH>("public_key", &self.public_key)?;
        verify_fields(&public_key, &self.state_hash, &self.signature)
    }

    /// Decoded state digest.
    pub fn state_digest(&self) -> Result<Hash256, VerificationError> {
        decode_hex::<32>("state_hash", &self.state_hash)
    }

    /// Decoded public key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, VerificationError> {
        let bytes = decode_hex::<KEY_LENGTH>("public_key", &self.public_key)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidPublicKey.into())
    }

    /// The recorded exclusion globs, compiled.
    pub fn exclusion_set(&self) -> Result<ExclusionSet, VerificationError> {
        Ok(ExclusionSet::new(&self.excluded_files)?)
    }

    /// Verify the signature, then re-capture `root` with the recorded
    /// exclusions and compare against the certified digest.
    pub fn verify_against_state(&self, root: &Path) -> Result<CaptureReport, VerificationError> {
        self.verify()?;
        let expected = self.state_digest()?;
        let report = StateCapture::new(self.exclusion_set()?).capture(root)?;
        if report.digest != expected {
            return Err(VerificationError::StateMismatch {
                expected: self.state_hash.clone(),
                actual: report.digest_hex(),
            });
        }
        Ok(report)
    }

    pub fn to_json(&self) -> Result<String, SerializationError> {
        to_json_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, SerializationError> {
        from_json(json)
    }

    /// Write the certificate as pretty JSON, atomically.
    pub fn write_to(&self, path: &Path) -> Result<(), SerializationError> {
        let mut json = self.to_json()?;
        json.push('\n');
        write_atomic(path, json.as_bytes())
    }

    pub fn read_from(path: &Path) -> Result<Self, SerializationError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl ProofOfLife {
    /// Verify the signature with the key from the machine's birth certificate.
    pub fn verify(&self, public_key: &VerifyingKey) -> Result<(), VerificationError> {
        verify_fields(&public_key.to_bytes(), &self.state_hash, &self.signature)
    }

    pub fn state_digest(&self) -> Result<Hash256, VerificationError> {
        decode_hex::<32>("state_hash", &self.state_hash)
    }
}

fn verify_fields(public_key: &[u8], state_hash: &str, signature: &str) -> Result<(), VerificationError> {
    let digest = decode_hex::<32>("state_hash", state_hash)?;
    let signature = decode_hex::<SIGNATURE_LENGTH>("signature", signature)?;
    if identity::verify(public_key, &digest, &signature)? {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

fn decode_hex<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], VerificationError> {
    let bytes = hex::decode(value).map_err(|e| VerificationError::Malformed {
        field,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| VerificationError::Malformed {
        field,
        reason: format!("expected {N} bytes, got {}", b.len()),
    })
}

/// Builder for constructing certificates.
///
/// Building is pure: identical inputs, including the timestamp, produce
/// identical certificates and therefore identical canonical bytes.
#[derive(Debug, Default)]
pub struct CertificateBuilder {
    server_id: Option<ServerId>,
    timestamp: Option<DateTime<Utc>>,
    state_hash: Option<Hash256>,
    signature: Option<Signature>,
    public_key: Option<VerifyingKey>,
    excluded_files: Option<Vec<String>>,
}

impl CertificateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_id(mut self, id: ServerId) -> Self {
        self.server_id = Some(id);
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn state_hash(mut self, digest: Hash256) -> Self {
        self.state_hash = Some(digest);
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn excluded_files(mut self, patterns: Vec<String>) -> Self {
        self.excluded_files = Some(patterns);
        self
    }

    /// Build a birth certificate. Timestamp defaults to now (UTC).
    pub fn build_birth(mut self) -> Result<BirthCertificate, BuildError> {
        let public_key = self
            .public_key
            .take()
            .ok_or(BuildError::MissingField("public_key"))?;
        let excluded_files = self
            .excluded_files
            .take()
            .ok_or(BuildError::MissingField("excluded_files"))?;
        let common = self.common()?;

        Ok(BirthCertificate {
            server_id: common.server_id,
            timestamp: common.timestamp,
            state_hash: common.state_hash,
            signature: common.signature,
            public_key: hex::encode(public_key.to_bytes()),
            excluded_files,
        })
    }

    /// Build a proof-of-life record. Timestamp defaults to now (UTC).
    pub fn build_proof_of_life(self) -> Result<ProofOfLife, BuildError> {
        let common = self.common()?;
        Ok(ProofOfLife {
            server_id: common.server_id,
            timestamp: common.timestamp,
            state_hash: common.state_hash,
            signature: common.signature,
        })
    }

    fn common(self) -> Result<CommonFields, BuildError> {
        let server_id = self.server_id.ok_or(BuildError::MissingField("server_id"))?;
        validate_server_id(&server_id)?;
        Ok(CommonFields {
            server_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            state_hash: hex::encode(self.state_hash.ok_or(BuildError::MissingField("state_hash"))?),
            signature: hex::encode(
                self.signature
                    .ok_or(BuildError::MissingField("signature"))?
                    .to_bytes(),
            ),
        })
    }
}

struct CommonFields {
    server_id: ServerId,
    timestamp: DateTime<Utc>,
    state_hash: String,
    signature: String,
}

/// Server ids must be non-empty and printable.
pub fn validate_server_id(id: &ServerId) -> Result<(), BuildError> {
    let s = id.as_str();
    if s.trim().is_empty() {
        return Err(BuildError::InvalidServerId("empty".to_string()));
    }
    if s.chars().any(char::is_control) {
        return Err(BuildError::InvalidServerId(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid server id: {0}")]
    InvalidServerId(String),
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("signature does not match the state hash")]
    InvalidSignature,

    #[error("invalid recorded exclusion pattern: {0}")]
    Exclusion(#[from] PatternError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("state digest mismatch: certified {expected}, current {actual}")]
    StateMismatch { expected: String, actual: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
    }

    fn create_test_birth() -> (BirthCertificate, Identity) {
        let identity = Identity::generate();
        let digest = sha256(b"initial state");
        let cert = CertificateBuilder::new()
            .server_id(ServerId::new("wg-eu-01"))
            .timestamp(fixed_time())
            .state_hash(digest)
            .signature(identity.sign(&digest).unwrap())
            .public_key(identity.verifying_key())
            .excluded_files(vec!["/proc".into(), "*.log".into()])
            .build_birth()
            .unwrap();
        (cert, identity)
    }

    #[test]
    fn test_birth_field_shapes() {
        let (cert, _) = create_test_birth();
        assert_eq!(cert.state_hash.len(), 64);
        assert_eq!(cert.signature.len(), 128);
        assert_eq!(cert.public_key.len(), 64);
        assert_eq!(cert.kind(), CertificateKind::Birth);
    }

    #[test]
    fn test_birth_signature_verification() {
        let (cert, _) = create_test_birth();
        assert!(cert.verify().is_ok());
    }

    #[test]
    fn test_tampered_state_hash_fails() {
        let (mut cert, _) = create_test_birth();
        cert.state_hash = hex::encode(sha256(b"other state"));
        assert!(matches!(cert.verify(), Err(VerificationError::InvalidSignature)));
    }

    #[test]
    fn test_malformed_hex_is_reported() {
        let (mut cert, _) = create_test_birth();
        cert.signature = "zz".into();
        assert!(matches!(
            cert.verify(),
            Err(VerificationError::Malformed { field: "signature", .. })
        ));
    }

    #[test]
    fn test_birth_json_roundtrip() {
        let (cert, _) = create_test_birth();
        let json = cert.to_json().unwrap();
        let decoded = BirthCertificate::from_json(&json).unwrap();
        assert_eq!(cert, decoded);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_json_field_names() {
        let (cert, _) = create_test_birth();
        let value: serde_json::Value = serde_json::from_str(&cert.to_json().unwrap()).unwrap();
        for key in ["server_id", "timestamp", "state_hash", "signature", "public_key", "excluded_files"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["server_id"], "wg-eu-01");
        assert_eq!(value["timestamp"], "2024-03-01T12:30:45Z");
    }

    #[test]
    fn test_missing_field() {
        let err = CertificateBuilder::new()
            .server_id(ServerId::new("s"))
            .state_hash([0u8; 32])
            .build_proof_of_life()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField("signature")));
    }

    #[test]
    fn test_birth_builder_reports_missing_fields() {
        let identity = Identity::generate();
        let digest = [3u8; 32];
        let base = || {
            CertificateBuilder::new()
                .server_id(ServerId::new("wg-eu-02"))
                .state_hash(digest)
                .signature(identity.sign(&digest).unwrap())
        };

        let err = base()
            .public_key(identity.verifying_key())
            .build_birth()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField("excluded_files")));

        let err = base().excluded_files(vec![]).build_birth().unwrap_err();
        assert!(matches!(err, BuildError::MissingField("public_key")));

        let err = CertificateBuilder::new()
            .public_key(identity.verifying_key())
            .excluded_files(vec!["*.log".into()])
            .state_hash(digest)
            .signature(identity.sign(&digest).unwrap())
            .build_birth()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField("server_id")));

        let cert = base()
            .public_key(identity.verifying_key())
            .excluded_files(vec!["*.log".into()])
            .build_birth()
            .unwrap();
        assert_eq!(cert.excluded_files, vec!["*.log"]);
        assert!(cert.verify().is_ok());
    }

    #[test]
    fn test_invalid_server_id() {
        let identity = Identity::generate();
        let digest = [7u8; 32];
        let err = CertificateBuilder::new()
            .server_id(ServerId::new("bad\nid"))
            .state_hash(digest)
            .signature(identity.sign(&digest).unwrap())
            .build_proof_of_life()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidServerId(_)));
    }

    #[test]
    fn test_proof_of_life_verifies_with_birth_key() {
        let (birth, identity) = create_test_birth();
        let digest = sha256(b"later state");
        let pol = CertificateBuilder::new()
            .server_id(birth.server_id.clone())
            .state_hash(digest)
            .signature(identity.sign(&digest).unwrap())
            .build_proof_of_life()
            .unwrap();
        assert!(pol.verify(&birth.verifying_key().unwrap()).is_ok());
        assert_eq!(pol.state_digest().unwrap(), digest);
    }

    #[test]
    fn test_payload_differs_between_records() {
        let (birth, identity) = create_test_birth();
        let digest = birth.state_digest().unwrap();
        let pol = CertificateBuilder::new()
            .server_id(birth.server_id.clone())
            .timestamp(fixed_time())
            .state_hash(digest)
            .signature(identity.sign(&digest).unwrap())
            .build_proof_of_life()
            .unwrap();
        assert_ne!(
            birth.publication_payload().unwrap(),
            pol.publication_payload().unwrap()
        );
    }

    proptest! {
        #[test]
        fn proof_of_life_building_is_idempotent(seed in any::<[u8; 32]>(), state in any::<[u8; 32]>(), secs in 0i64..4_000_000_000) {
            let identity = Identity::from_secret_bytes(&seed).unwrap();
            let ts = Utc.timestamp_opt(secs, 0).unwrap();
            let build = || CertificateBuilder::new()
                .server_id(ServerId::new("node"))
                .timestamp(ts)
                .state_hash(state)
                .signature(identity.sign(&state).unwrap())
                .build_proof_of_life()
                .unwrap();
            let a = build();
            let b = build();
            prop_assert_eq!(a.to_canonical_bytes().unwrap(), b.to_canonical_bytes().unwrap());
            prop_assert_eq!(a.publication_payload().unwrap(), b.publication_payload().unwrap());
        }
    }
}
