//! Birth flow: create the identity, attest the initial state, persist the
//! certificate and publish its payload.

use crate::capture::{CaptureError, CaptureReport, StateCapture};
use crate::certificate::{BirthCertificate, BuildError, Certificate, CertificateBuilder};
use crate::config::{AttestationConfig, ConfigError, PublishFailurePolicy};
use crate::identity::{Identity, SigningError};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::publish::{publish_with_timeout, PublicationGateway, PublishError};
use crate::serialization::SerializationError;
use crate::types::{Hash256, ReceiptId};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BirthError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to persist identity: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("capture task failed: {0}")]
    CaptureTask(String),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("certificate build failed: {0}")]
    Build(#[from] BuildError),

    #[error("failed to write certificate: {0}")]
    Serialization(#[from] SerializationError),

    #[error("publication failed: {0}")]
    Publish(PublishError),
}

/// Everything the birth flow produced.
#[derive(Debug, Clone)]
pub struct BirthOutcome {
    pub certificate: BirthCertificate,
    pub payload: Hash256,
    /// `None` when publication failed under the `continue` policy.
    pub receipt: Option<ReceiptId>,
    pub capture: CaptureReport,
}

/// Issue a birth certificate for `config.state_root`.
///
/// Nothing is persisted until the certificate is fully built. The key pair
/// and the certificate are then committed together: the certificate is
/// staged next to `certificate_path`, the identity is stored, and the staged
/// file is renamed into place. A failure before that point leaves any
/// previous key and certificate untouched.
///
/// Publication happens after the commit; a failed publication leaves the
/// certificate in place.
pub async fn issue_birth_certificate(
    config: &AttestationConfig,
    key_store: &dyn KeyStore,
    gateway: &dyn PublicationGateway,
    certificate_path: &Path,
) -> Result<BirthOutcome, BirthError> {
    config.validate()?;
    let exclusions = config.exclusion_set().map_err(ConfigError::from)?;

    let identity = Identity::generate();
    debug!(
        server_id = %config.server_id,
        public_key = %hex::encode(identity.public_key_bytes()),
        "identity generated"
    );

    let capture = StateCapture::new(exclusions.clone());
    let root = config.state_root.clone();
    let report = tokio::task::spawn_blocking(move || capture.capture(&root))
        .await
        .map_err(|e| BirthError::CaptureTask(e.to_string()))??;
    info!(
        state_hash = %report.digest_hex(),
        files = report.files_hashed,
        excluded = report.entries_excluded,
        unreadable = report.unreadable.len(),
        "initial state captured"
    );

    let signature = identity.sign(&report.digest)?;
    let certificate = CertificateBuilder::new()
        .server_id(config.server_id.clone())
        .timestamp(Utc::now())
        .state_hash(report.digest)
        .signature(signature)
        .public_key(identity.verifying_key())
        .excluded_files(exclusions.patterns())
        .build_birth()?;
    let payload = certificate.publication_payload()?;

    commit(&certificate, &identity, key_store, certificate_path)?;
    info!(
        path = %certificate_path.display(),
        store = %key_store.describe(),
        public_key = %certificate.public_key,
        "birth certificate and identity committed"
    );

    let receipt = match publish_with_timeout(gateway, &payload, config.publish_timeout()).await {
        Ok(receipt) => {
            info!(gateway = gateway.name(), receipt = %receipt, "birth certificate published");
            Some(receipt)
        }
        Err(e) if config.on_publish_failure == PublishFailurePolicy::Continue => {
            warn!(
                gateway = gateway.name(),
                error = %e,
                "birth certificate publication failed, certificate kept on disk"
            );
            None
        }
        Err(e) => return Err(BirthError::Publish(e)),
    };

    Ok(BirthOutcome {
        certificate,
        payload,
        receipt,
        capture: report,
    })
}

/// Stage the certificate, store the identity, then move the certificate into
/// place. The staged file is removed if the identity cannot be stored.
fn commit(
    certificate: &BirthCertificate,
    identity: &Identity,
    key_store: &dyn KeyStore,
    certificate_path: &Path,
) -> Result<(), BirthError> {
    let staged = staged_path(certificate_path)?;
    certificate.write_to(&staged)?;

    if let Err(e) = key_store.store(identity) {
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&staged, certificate_path) {
        error!(
            staged = %staged.display(),
            path = %certificate_path.display(),
            error = %e,
            "identity stored but certificate could not be moved into place"
        );
        return Err(SerializationError::from(e).into());
    }
    Ok(())
}

fn staged_path(certificate_path: &Path) -> Result<PathBuf, SerializationError> {
    let mut name = certificate_path
        .file_name()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "certificate path has no file name")
        })?
        .to_os_string();
    name.push(".pending");
    Ok(certificate_path.with_file_name(name))
}
