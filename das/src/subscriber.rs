use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lucerna_utils::time::sleep;

use crate::header::{Header, HeaderStream, HeaderSubscriber};

const RESUBSCRIBE_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Bridges the external header subscription into the coordinator.
///
/// Every received header is reported as a potential new network head. On a
/// stream error the subscription is re-established with an exponential
/// backoff.
pub(crate) struct Subscriber<H>
where
    H: Header,
{
    header_sub: Arc<dyn HeaderSubscriber<H>>,
    new_head_tx: mpsc::Sender<u64>,
    cancellation_token: CancellationToken,
}

impl<H> Subscriber<H>
where
    H: Header,
{
    pub(crate) fn new(
        header_sub: Arc<dyn HeaderSubscriber<H>>,
        new_head_tx: mpsc::Sender<u64>,
        cancellation_token: CancellationToken,
    ) -> Subscriber<H> {
        Subscriber {
            header_sub,
            new_head_tx,
            cancellation_token,
        }
    }

    pub(crate) async fn run(self, mut stream: HeaderStream<H>) {
        let mut backoff = ExponentialBackoffBuilder::default()
            .with_max_interval(RESUBSCRIBE_MAX_INTERVAL)
            .with_max_elapsed_time(None)
            .build();

        'outer: loop {
            loop {
                let item = select! {
                    _ = self.cancellation_token.cancelled() => break 'outer,
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(header)) => {
                        self.listen(header.height());
                        backoff.reset();
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "header subscription failed");
                        break;
                    }
                    None => {
                        warn!("header subscription ended");
                        break;
                    }
                }
            }

            stream = loop {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(RESUBSCRIBE_MAX_INTERVAL);

                select! {
                    _ = self.cancellation_token.cancelled() => break 'outer,
                    _ = sleep(delay) => {}
                }

                let res = select! {
                    _ = self.cancellation_token.cancelled() => break 'outer,
                    res = self.header_sub.subscribe() => res,
                };

                match res {
                    Ok(stream) => break stream,
                    Err(e) => warn!(error = %e, "re-subscribing to headers failed"),
                }
            };
        }

        debug!("subscriber stopped");
    }

    fn listen(&self, height: u64) {
        // Lossy past the coordinator's buffer. Catch-up covers dropped
        // heads eventually.
        if self.new_head_tx.try_send(height).is_err() {
            debug!(height, "dropping new head, coordinator is busy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderError, HeaderSubscriber};
    use crate::test_utils::TestHeader;
    use async_trait::async_trait;
    use futures::stream;
    use lucerna_utils::test_utils::async_test;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Subscription source handing out a fixed sequence of streams.
    struct StreamSource {
        streams: Mutex<VecDeque<Vec<Result<TestHeader, HeaderError>>>>,
    }

    impl StreamSource {
        fn new(streams: Vec<Vec<Result<TestHeader, HeaderError>>>) -> StreamSource {
            StreamSource {
                streams: Mutex::new(streams.into()),
            }
        }
    }

    #[async_trait]
    impl HeaderSubscriber<TestHeader> for StreamSource {
        async fn subscribe(&self) -> Result<HeaderStream<TestHeader>, HeaderError> {
            let items = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| HeaderError::Service("no more streams".to_owned()))?;

            Ok(stream::iter(items).boxed())
        }
    }

    fn headers(heights: &[u64]) -> Vec<Result<TestHeader, HeaderError>> {
        heights
            .iter()
            .map(|&height| Ok(TestHeader { height }))
            .collect()
    }

    #[async_test]
    async fn reports_heights_and_resubscribes_after_stream_end() {
        let source = Arc::new(StreamSource::new(vec![headers(&[3]), headers(&[4, 5])]));
        let (new_head_tx, mut new_head_rx) = mpsc::channel(8);
        let cancellation_token = CancellationToken::new();

        let first = source.subscribe().await.unwrap();
        let subscriber = Subscriber::new(source.clone(), new_head_tx, cancellation_token.clone());
        let handle = tokio::spawn(subscriber.run(first));

        assert_eq!(new_head_rx.recv().await, Some(3));
        assert_eq!(new_head_rx.recv().await, Some(4));
        assert_eq!(new_head_rx.recv().await, Some(5));

        cancellation_token.cancel();
        handle.await.unwrap();
    }
}
