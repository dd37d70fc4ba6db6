//! Interface of the fraud proof gossip channel.

use async_trait::async_trait;

/// Evidence that a block's erasure coding is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadEncodingReport {
    /// Height of the offending block.
    pub height: u64,
    /// Probe-provided description of the violation.
    pub reason: String,
}

/// Representation of the errors that fraud proof broadcasting can produce.
#[derive(Debug, thiserror::Error)]
#[error("Fraud broadcast: {0}")]
pub struct FraudError(pub String);

/// Gossip channel for fraud proofs.
#[async_trait]
pub trait FraudBroadcaster: Send + Sync + 'static {
    /// Broadcasts a bad encoding report to the network.
    async fn broadcast_bad_encoding(&self, report: BadEncodingReport) -> Result<(), FraudError>;
}
