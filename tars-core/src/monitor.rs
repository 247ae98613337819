//! Proof-of-life monitor loop.
//!
//! ```text
//! Idle -> Capturing -> Signing -> Building -> Publishing -> Sleeping -> Capturing ...
//! ```
//!
//! One cycle runs start to finish before the next begins. Cancellation is
//! observed while capturing, between stages, while publishing and while
//! sleeping; a cancelled cycle produces no certificate. The sleep is a plain
//! interval after each cycle, so the schedule slides by each cycle's duration.
//! That slide is accumulated in [`MonitorStats::drift`].
//!
//! The identity is loaded once when the monitor is built. A failed load means
//! the loop never starts.

use crate::capture::{CaptureError, CaptureReport, StateCapture};
use crate::certificate::{BuildError, Certificate, CertificateBuilder, ProofOfLife};
use crate::config::{AttestationConfig, ConfigError, PublishFailurePolicy};
use crate::identity::{Identity, SigningError};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::publish::{publish_with_timeout, PublicationGateway, PublishError};
use crate::serialization::SerializationError;
use crate::types::{Hash256, ReceiptId, ServerId};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Capturing,
    Signing,
    Building,
    Publishing,
    Sleeping,
    Stopped,
}

/// A failure that aborts one cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("capture task failed: {0}")]
    CaptureTask(String),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("certificate build failed: {0}")]
    Build(#[from] BuildError),

    #[error("certificate serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("publication failed: {0}")]
    Publish(#[from] PublishError),
}

impl CycleError {
    /// Stage name for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Capture(_) | CycleError::CaptureTask(_) => "capture",
            CycleError::Signing(_) => "sign",
            CycleError::Build(_) | CycleError::Serialization(_) => "build",
            CycleError::Publish(_) => "publish",
        }
    }
}

/// A failure that stops the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to load identity from {store}: {source}")]
    KeyLoad {
        store: String,
        #[source]
        source: KeyStoreError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("signing failed, identity unusable: {0}")]
    Signing(SigningError),

    #[error("publication failed with fail-fast policy: {0}")]
    Publish(PublishError),
}

/// Result of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub certificate: ProofOfLife,
    pub payload: Hash256,
    pub receipt: ReceiptId,
    pub capture: CaptureReport,
}

/// Counters kept across the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub publish_attempts: u64,
    pub publish_failures: u64,
    pub consecutive_publish_failures: u64,
    pub last_receipt: Option<ReceiptId>,
    /// Sum of cycle durations: how far the schedule has slid behind a
    /// fixed-rate timer.
    pub drift: Duration,
}

/// Drives capture, sign, build and publish on a fixed interval.
pub struct Monitor {
    server_id: ServerId,
    state_root: PathBuf,
    interval: Duration,
    publish_timeout: Duration,
    policy: PublishFailurePolicy,
    capture: Arc<StateCapture>,
    identity: Identity,
    gateway: Arc<dyn PublicationGateway>,
    state: watch::Sender<MonitorState>,
    stats: MonitorStats,
}

impl Monitor {
    /// Validate the config and load the identity.
    ///
    /// # Errors
    /// [`MonitorError::KeyLoad`] if the key store cannot produce an identity;
    /// the loop must not start without one.
    pub fn new(
        config: &AttestationConfig,
        key_store: &dyn KeyStore,
        gateway: Arc<dyn PublicationGateway>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let exclusions = config.exclusion_set().map_err(ConfigError::from)?;

        let identity = key_store.load().map_err(|source| MonitorError::KeyLoad {
            store: key_store.describe(),
            source,
        })?;
        info!(
            server_id = %config.server_id,
            public_key = %hex::encode(identity.public_key_bytes()),
            "identity loaded"
        );

        let (state, _) = watch::channel(MonitorState::Idle);
        Ok(Self {
            server_id: config.server_id.clone(),
            state_root: config.state_root.clone(),
            interval: config.interval(),
            publish_timeout: config.publish_timeout(),
            policy: config.on_publish_failure,
            capture: Arc::new(StateCapture::new(exclusions)),
            identity,
            gateway,
            state,
            stats: MonitorStats::default(),
        })
    }

    /// Replace the capture engine (e.g., with a custom file opener).
    pub fn with_capture(mut self, capture: StateCapture) -> Self {
        self.capture = Arc::new(capture);
        self
    }

    /// Override the sleep between cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Watch the loop's state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    fn set_state(&self, state: MonitorState) {
        debug!(?state, "monitor state");
        self.state.send_replace(state);
    }

    /// Run until cancelled or until a fatal error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MonitorStats, MonitorError> {
        info!(
            server_id = %self.server_id,
            root = %self.state_root.display(),
            interval_secs = self.interval.as_secs_f64(),
            gateway = self.gateway.name(),
            policy = ?self.policy,
            "proof-of-life monitor starting"
        );

        let result = 'cycles: loop {
            if cancel.is_cancelled() {
                break 'cycles Ok(());
            }

            let cycle_at = Utc::now();
            let started = Instant::now();
            let outcome = self.run_cycle(&cancel).await;
            self.stats.drift += started.elapsed();

            match outcome {
                Ok(Some(_)) => self.stats.cycles_completed += 1,
                Ok(None) => {
                    info!("cancelled mid-cycle, no certificate produced");
                    break 'cycles Ok(());
                }
                Err(e) => {
                    self.stats.cycles_failed += 1;
                    error!(
                        stage = e.stage(),
                        cycle_at = %cycle_at.to_rfc3339(),
                        error = %e,
                        "attestation cycle failed"
                    );
                    match e {
                        CycleError::Signing(err) => break 'cycles Err(MonitorError::Signing(err)),
                        CycleError::Publish(err) if self.policy == PublishFailurePolicy::FailFast => {
                            break 'cycles Err(MonitorError::Publish(err));
                        }
                        _ => {}
                    }
                }
            }

            self.set_state(MonitorState::Sleeping);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'cycles Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        self.set_state(MonitorState::Stopped);
        info!(
            cycles = self.stats.cycles_completed,
            failed = self.stats.cycles_failed,
            publish_failures = self.stats.publish_failures,
            "proof-of-life monitor stopped"
        );
        result.map(|()| self.stats)
    }

    /// Run a single cycle. `Ok(None)` means it was cancelled part-way.
    pub async fn run_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<CycleOutcome>, CycleError> {
        self.stats.cycles_started += 1;

        self.set_state(MonitorState::Capturing);
        let capture = Arc::clone(&self.capture);
        let root = self.state_root.clone();
        // A cancelled capture thread runs to completion in the background and
        // its report is dropped.
        let task = tokio::task::spawn_blocking(move || capture.capture(&root));
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            joined = task => joined.map_err(|e| CycleError::CaptureTask(e.to_string()))??,
        };
        if !report.unreadable.is_empty() {
            warn!(count = report.unreadable.len(), "some entries were unreadable and hashed as empty");
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        self.set_state(MonitorState::Signing);
        let signature = self.identity.sign(&report.digest)?;
        if cancel.is_cancelled() {
            return Ok(None);
        }

        self.set_state(MonitorState::Building);
        let certificate = CertificateBuilder::new()
            .server_id(self.server_id.clone())
            .timestamp(Utc::now())
            .state_hash(report.digest)
            .signature(signature)
            .build_proof_of_life()?;
        let payload = certificate.publication_payload()?;
        if cancel.is_cancelled() {
            return Ok(None);
        }

        self.set_state(MonitorState::Publishing);
        self.stats.publish_attempts += 1;
        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = publish_with_timeout(self.gateway.as_ref(), &payload, self.publish_timeout) => result,
        };

        match published {
            Ok(receipt) => {
                self.stats.consecutive_publish_failures = 0;
                self.stats.last_receipt = Some(receipt.clone());
                info!(
                    timestamp = %certificate.timestamp().to_rfc3339(),
                    state_hash = %certificate.state_hash,
                    receipt = %receipt,
                    "proof-of-life published"
                );
                Ok(Some(CycleOutcome {
                    certificate,
                    payload,
                    receipt,
                    capture: report,
                }))
            }
            Err(e) => {
                self.stats.publish_failures += 1;
                self.stats.consecutive_publish_failures += 1;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct CountingGateway {
        calls: AtomicU64,
        fail: bool,
        hang: bool,
    }

    impl CountingGateway {
        fn new(fail: bool, hang: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail,
                hang,
            })
        }
    }

    #[async_trait]
    impl PublicationGateway for CountingGateway {
        fn name(&self) -> &str {
            "counting"
        }

        async fn publish(&self, _payload: &Hash256) -> Result<ReceiptId, PublishError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                Err(PublishError::Unavailable("ledger down".into()))
            } else {
                Ok(ReceiptId(format!("rcpt-{n}")))
            }
        }
    }

    fn config_for(dir: &TempDir) -> AttestationConfig {
        let mut config = AttestationConfig::new(ServerId::new("test-node"), 1);
        config.excluded_files = vec!["*.log".into()];
        config.state_root = dir.path().to_path_buf();
        config
    }

    fn store() -> MemoryKeyStore {
        MemoryKeyStore::with_identity(&Identity::generate())
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = Monitor::new(
            &config_for(&dir),
            &MemoryKeyStore::new(),
            CountingGateway::new(false, false),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MonitorError::KeyLoad { .. }));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.proof_interval = 0;
        let err = Monitor::new(&config, &store(), CountingGateway::new(false, false))
            .err()
            .unwrap();
        assert!(matches!(err, MonitorError::Config(ConfigError::ZeroInterval)));
    }

    #[tokio::test]
    async fn test_single_cycle_produces_verifiable_record() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let identity = Identity::generate();
        let key_store = MemoryKeyStore::with_identity(&identity);
        let gateway = CountingGateway::new(false, false);

        let mut monitor = Monitor::new(&config_for(&dir), &key_store, gateway.clone()).unwrap();
        let outcome = monitor
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.receipt, ReceiptId("rcpt-1".into()));
        assert_eq!(outcome.capture.digest, crate::crypto::sha256(b"hello"));
        assert_eq!(outcome.payload, outcome.certificate.publication_payload().unwrap());
        assert!(outcome.certificate.verify(&identity.verifying_key()).is_ok());
        assert_eq!(monitor.stats().publish_attempts, 1);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_loop() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.on_publish_failure = PublishFailurePolicy::FailFast;
        let gateway = CountingGateway::new(true, false);

        let monitor = Monitor::new(&config, &store(), gateway.clone()).unwrap();
        let err = monitor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Publish(PublishError::Unavailable(_))));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_preempts_stuck_publish() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.publish_timeout_secs = 3600;
        let gateway = CountingGateway::new(false, true);

        let monitor = Monitor::new(&config, &store(), gateway.clone()).unwrap();
        let mut state = monitor.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        state
            .wait_for(|s| *s == MonitorState::Publishing)
            .await
            .unwrap();
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor must stop promptly")
            .unwrap()
            .unwrap();
        assert_eq!(stats.cycles_completed, 0);
        assert_eq!(stats.publish_attempts, 1);
        assert_eq!(*state.borrow(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = TempDir::new().unwrap();
        let gateway = CountingGateway::new(false, false);
        let monitor = Monitor::new(&config_for(&dir), &store(), gateway.clone()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = monitor.run(cancel).await.unwrap();
        assert_eq!(stats, MonitorStats::default());
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capture_error_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.state_root = dir.path().join("missing");
        let gateway = CountingGateway::new(false, false);

        let mut monitor = Monitor::new(&config, &store(), gateway.clone()).unwrap();
        let err = monitor.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.stage(), "capture");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }
}
