//! Interface of the data availability probe.

use async_trait::async_trait;

use crate::header::Header;

/// Representation of all the errors that the availability probe can produce.
#[derive(Debug, thiserror::Error)]
pub enum AvailabilityError {
    /// The erasure coding of the block is provably invalid.
    #[error("Invalid erasure coding: {0}")]
    Byzantine(String),

    /// The probe was cancelled.
    #[error("Sampling cancelled")]
    Cancelled,

    /// Shares could not be retrieved from the network.
    #[error("Shares not available: {0}")]
    NotAvailable(String),
}

/// Probe establishing that the data committed to a header is retrievable.
///
/// Implementations select random shares of the extended data square and
/// verify them against the header's commitments. Must be safe to call
/// from multiple workers concurrently.
#[async_trait]
pub trait Availability<H: Header>: Send + Sync + 'static {
    /// Samples the data square committed to by `header`.
    async fn shares_available(&self, header: &H) -> Result<(), AvailabilityError>;
}
