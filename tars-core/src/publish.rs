//! Publication gateway interface.
//!
//! A gateway anchors a 32-byte payload digest somewhere outside the machine
//! (a ledger, a transparency log, a remote journal) and hands back a receipt.
//! How it does that is up to the implementation; the core only bounds how
//! long it is willing to wait.

use crate::types::{Hash256, ReceiptId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Trait for publication sinks.
#[async_trait]
pub trait PublicationGateway: Send + Sync {
    /// Gateway name for logs (e.g., "journal", "polygon").
    fn name(&self) -> &str;

    /// Publish a payload digest.
    ///
    /// # Returns
    /// A receipt identifying the published record, or an error if the sink
    /// refused or could not be reached.
    async fn publish(&self, payload: &Hash256) -> Result<ReceiptId, PublishError>;
}

/// Errors that can occur during publication.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("publication rejected: {0}")]
    Rejected(String),

    #[error("publication timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway error: {0}")]
    Internal(String),
}

/// Publish with an upper bound on the wait.
pub async fn publish_with_timeout(
    gateway: &dyn PublicationGateway,
    payload: &Hash256,
    timeout: Duration,
) -> Result<ReceiptId, PublishError> {
    match tokio::time::timeout(timeout, gateway.publish(payload)).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockGateway {
        delay: Duration,
    }

    #[async_trait]
    impl PublicationGateway for MockGateway {
        fn name(&self) -> &str {
            "mock"
        }

        async fn publish(&self, payload: &Hash256) -> Result<ReceiptId, PublishError> {
            tokio::time::sleep(self.delay).await;
            Ok(ReceiptId(hex::encode(&payload[..4])))
        }
    }

    #[tokio::test]
    async fn test_publish_within_timeout() {
        let gateway = MockGateway {
            delay: Duration::from_millis(1),
        };
        let receipt = publish_with_timeout(&gateway, &[0xab; 32], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(receipt, ReceiptId("abababab".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_gateway_times_out() {
        let gateway = MockGateway {
            delay: Duration::from_secs(3600),
        };
        let err = publish_with_timeout(&gateway, &[0u8; 32], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::Timeout(Duration::from_secs(2)));
    }
}
