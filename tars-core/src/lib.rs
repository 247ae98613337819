//! # TARS Core
//!
//! Trusted attestation of a machine's filesystem state.
//!
//! A machine is born once: it generates an Ed25519 identity, digests its
//! filesystem into a single SHA-256 state hash, signs that hash and writes a
//! birth certificate. From then on a monitor loop periodically re-captures
//! the state and publishes the digest of a signed proof-of-life record to a
//! [`PublicationGateway`].
//!
//! ## Key Features
//! - **Deterministic capture**: sorted depth-first walk, glob exclusions,
//!   symlinks never followed
//! - **Canonical CBOR payloads**: the published digest is reproducible from
//!   the certificate alone
//! - **Pluggable seams**: key storage ([`KeyStore`]) and publication
//!   ([`PublicationGateway`]) are traits
//! - **Cancellable monitor**: every stage observes a `CancellationToken`

pub mod birth;
pub mod capture;
pub mod certificate;
pub mod config;
pub mod crypto;
pub mod exclusion;
pub mod identity;
pub mod keystore;
pub mod monitor;
pub mod publish;
pub mod serialization;
pub mod types;

pub use birth::{issue_birth_certificate, BirthError, BirthOutcome};
pub use capture::{CaptureError, CaptureReport, FileOpener, FileReadError, StateCapture};
pub use certificate::{
    BirthCertificate, BuildError, Certificate, CertificateBuilder, ProofOfLife, VerificationError,
};
pub use config::{AttestationConfig, ConfigError, PublishFailurePolicy};
pub use exclusion::{ExclusionSet, PatternError};
pub use identity::{Identity, IdentityError, SigningError};
pub use keystore::{KeyStore, KeyStoreError, MemoryKeyStore};
pub use monitor::{CycleError, CycleOutcome, Monitor, MonitorError, MonitorState, MonitorStats};
pub use publish::{PublicationGateway, PublishError};
pub use types::*;

pub use ed25519_dalek::{Signature, VerifyingKey};
