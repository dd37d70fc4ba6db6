use std::time::Duration;

pub use tokio::time::error::Elapsed;
pub use tokio::time::{sleep, timeout};

/// Type allowing to wait on a sequence of instants with a certain duration
/// between each instant.
pub struct Interval(tokio::time::Interval);

impl Interval {
    /// Create a new `Interval` with the provided duration between firings.
    pub async fn new(dur: Duration) -> Self {
        let mut inner = tokio::time::interval(dur);

        // In Tokio the first tick returns immediately, so we consume it
        // to make every firing wait for the full duration.
        inner.tick().await;

        Interval(inner)
    }

    /// Completes when the next instant in the interval has been reached.
    pub async fn tick(&mut self) {
        self.0.tick().await;
    }
}
