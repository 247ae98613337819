//! Attest a directory end to end with in-memory collaborators.
//!
//! ```text
//! cargo run -p tars-core --example attest_directory -- /etc
//! ```
//!
//! Issues a birth certificate into a temp dir, runs three proof-of-life
//! cycles one second apart, then re-verifies the directory.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tars_core::{
    issue_birth_certificate, AttestationConfig, Hash256, MemoryKeyStore, Monitor,
    PublicationGateway, PublishError, ReceiptId, ServerId,
};
use tokio_util::sync::CancellationToken;

/// Prints payloads instead of sending them anywhere.
#[derive(Default)]
struct StdoutGateway {
    sequence: AtomicU64,
}

#[async_trait]
impl PublicationGateway for StdoutGateway {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn publish(&self, payload: &Hash256) -> Result<ReceiptId, PublishError> {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        println!("published #{n}: {}", hex::encode(payload));
        Ok(ReceiptId(n.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("tars_core=info")
        .init();

    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let out = tempfile::tempdir()?;

    let mut config = AttestationConfig::new(ServerId::new("demo-host"), 1);
    config.state_root = root.clone();
    config.excluded_files.push("target".into());
    config.excluded_files.push(".git".into());

    let key_store = MemoryKeyStore::new();
    let gateway = Arc::new(StdoutGateway::default());
    let cert_path = out.path().join("birth_certificate.json");

    let birth = issue_birth_certificate(&config, &key_store, gateway.as_ref(), &cert_path).await?;
    println!("{}", birth.certificate.to_json()?);

    let monitor = Monitor::new(&config, &key_store, gateway.clone())?;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    let stats = handle.await??;
    println!(
        "{} proofs of life, schedule drift {:?}",
        stats.cycles_completed, stats.drift
    );

    match birth.certificate.verify_against_state(&root) {
        Ok(report) => println!("state unchanged: {}", report.digest_hex()),
        Err(e) => println!("state changed: {e}"),
    }
    Ok(())
}
