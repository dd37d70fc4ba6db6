//! Interfaces of the header services the sampler relies on.

use async_trait::async_trait;
use futures::stream::BoxStream;

type Result<T, E = HeaderError> = std::result::Result<T, E>;

/// Block header as seen by the sampler.
///
/// The sampler never inspects header contents. It reads the height and
/// hands the full header over to the availability probe.
pub trait Header: Clone + Send + Sync + 'static {
    /// Height of the block this header commits to.
    fn height(&self) -> u64;
}

/// Representation of all the errors that header services can produce.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// Header of the given height is not known yet.
    #[error("Header not found: {0}")]
    NotFound(u64),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failure in the underlying header service.
    #[error("Header service: {0}")]
    Service(String),
}

/// Provider of past headers.
#[async_trait]
pub trait HeaderGetter<H: Header>: Send + Sync + 'static {
    /// Returns the header of the given height.
    async fn get_by_height(&self, height: u64) -> Result<H>;

    /// Returns the latest known header.
    async fn head(&self) -> Result<H>;
}

/// Stream of headers announced on the network.
pub type HeaderStream<H> = BoxStream<'static, Result<H>>;

/// Source of newly announced network headers.
///
/// Delivery is at-least-once. Heights may repeat or arrive out of order;
/// the sampler tolerates both.
#[async_trait]
pub trait HeaderSubscriber<H: Header>: Send + Sync + 'static {
    /// Subscribes to headers announced on the network.
    async fn subscribe(&self) -> Result<HeaderStream<H>>;
}
