//! Test doubles for the sampler's collaborators.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use futures::FutureExt;
use futures::{stream, StreamExt};
use tokio::sync::{mpsc, Notify};

use lucerna_utils::time::{sleep, timeout};

use crate::availability::{Availability, AvailabilityError};
use crate::fraud::{BadEncodingReport, FraudBroadcaster, FraudError};
use crate::header::{Header, HeaderError, HeaderGetter, HeaderStream, HeaderSubscriber};
#[cfg(test)]
use crate::worker::SampleFn;

/// Minimal header carrying only a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestHeader {
    /// Height of the block.
    pub height: u64,
}

impl Header for TestHeader {
    fn height(&self) -> u64 {
        self.height
    }
}

/// [`HeaderGetter`] that serves a header for any requested height.
#[derive(Debug)]
pub struct TestGetter {
    head: Option<u64>,
}

impl TestGetter {
    /// `head` is what [`HeaderGetter::head`] reports; `None` makes the call
    /// fail, like on a node that has not synchronized any headers yet.
    pub fn new(head: Option<u64>) -> TestGetter {
        TestGetter { head }
    }
}

#[async_trait]
impl HeaderGetter<TestHeader> for TestGetter {
    async fn get_by_height(&self, height: u64) -> Result<TestHeader, HeaderError> {
        Ok(TestHeader { height })
    }

    async fn head(&self) -> Result<TestHeader, HeaderError> {
        match self.head {
            Some(height) => Ok(TestHeader { height }),
            None => Err(HeaderError::Service("no head available".to_owned())),
        }
    }
}

#[derive(Debug)]
enum Script {
    /// Fail this many more probes, then succeed.
    FailFirst(u32),
    /// The block is malformed. Every probe detects it.
    Byzantine,
}

/// Programmable [`Availability`] double.
///
/// Unscripted heights succeed. Every probe is recorded in invocation order.
#[derive(Debug, Default)]
pub struct TestAvailability {
    scripts: Mutex<HashMap<u64, Script>>,
    holds: Mutex<HashMap<u64, Arc<Notify>>>,
    probes: Mutex<Vec<u64>>,
}

impl TestAvailability {
    pub fn new() -> TestAvailability {
        TestAvailability::default()
    }

    /// Make the first `attempts` probes of `height` fail with a transient
    /// error.
    pub fn fail_first(&self, height: u64, attempts: u32) {
        self.scripts
            .lock()
            .unwrap()
            .insert(height, Script::FailFirst(attempts));
    }

    /// Make every probe of `height` report an invalid erasure coding.
    pub fn byzantine(&self, height: u64) {
        self.scripts
            .lock()
            .unwrap()
            .insert(height, Script::Byzantine);
    }

    /// Block the next probe of `height` until [`TestAvailability::release`].
    pub fn hold(&self, height: u64) {
        self.holds
            .lock()
            .unwrap()
            .insert(height, Arc::new(Notify::new()));
    }

    /// Release a probe blocked by [`TestAvailability::hold`].
    pub fn release(&self, height: u64) {
        if let Some(notify) = self.holds.lock().unwrap().remove(&height) {
            notify.notify_one();
        }
    }

    /// Heights probed so far, in invocation order.
    pub fn probes(&self) -> Vec<u64> {
        self.probes.lock().unwrap().clone()
    }

    /// Amount of probes of `height` so far.
    pub fn probe_count(&self, height: u64) -> usize {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter(|&&probed| probed == height)
            .count()
    }
}

#[async_trait]
impl Availability<TestHeader> for TestAvailability {
    async fn shares_available(&self, header: &TestHeader) -> Result<(), AvailabilityError> {
        let height = header.height();

        self.probes.lock().unwrap().push(height);

        let hold = self.holds.lock().unwrap().get(&height).cloned();
        if let Some(notify) = hold {
            notify.notified().await;
        }

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&height) {
            Some(Script::Byzantine) => Err(AvailabilityError::Byzantine(
                "share verification failed".to_owned(),
            )),
            Some(Script::FailFirst(attempts)) => {
                if *attempts == 0 {
                    scripts.remove(&height);
                    Ok(())
                } else {
                    *attempts -= 1;
                    Err(AvailabilityError::NotAvailable("query timeout".to_owned()))
                }
            }
            None => Ok(()),
        }
    }
}

/// [`SampleFn`] probing directly through a [`TestAvailability`], without
/// the facade's fraud proof bridge.
#[cfg(test)]
pub(crate) fn sample_fn_of(availability: Arc<TestAvailability>) -> SampleFn<TestHeader> {
    Arc::new(move |header| {
        let availability = availability.clone();
        async move { availability.shares_available(&header).await }.boxed()
    })
}

/// [`FraudBroadcaster`] double recording every report.
#[derive(Debug, Default)]
pub struct TestBroadcaster {
    reports: Mutex<Vec<BadEncodingReport>>,
    failing: AtomicBool,
}

impl TestBroadcaster {
    pub fn new() -> TestBroadcaster {
        TestBroadcaster::default()
    }

    /// A broadcaster whose every broadcast fails.
    pub fn failing() -> TestBroadcaster {
        let broadcaster = TestBroadcaster::default();
        broadcaster.failing.store(true, Ordering::Release);
        broadcaster
    }

    /// Reports broadcast so far.
    pub fn reports(&self) -> Vec<BadEncodingReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl FraudBroadcaster for TestBroadcaster {
    async fn broadcast_bad_encoding(&self, report: BadEncodingReport) -> Result<(), FraudError> {
        self.reports.lock().unwrap().push(report);

        if self.failing.load(Ordering::Acquire) {
            return Err(FraudError("gossip unreachable".to_owned()));
        }

        Ok(())
    }
}

/// [`HeaderSubscriber`] double backed by an in-memory channel.
#[derive(Debug)]
pub struct TestSubscriber {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<TestHeader, HeaderError>>>>,
}

/// Handle announcing headers through a [`TestSubscriber`].
#[derive(Debug, Clone)]
pub struct TestSubscriberHandle {
    tx: mpsc::UnboundedSender<Result<TestHeader, HeaderError>>,
}

impl TestSubscriber {
    pub fn new() -> (TestSubscriber, TestSubscriberHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            TestSubscriber {
                rx: Mutex::new(Some(rx)),
            },
            TestSubscriberHandle { tx },
        )
    }
}

impl TestSubscriberHandle {
    /// Announce a header of the given height.
    pub fn announce(&self, height: u64) {
        let _ = self.tx.send(Ok(TestHeader { height }));
    }
}

#[async_trait]
impl HeaderSubscriber<TestHeader> for TestSubscriber {
    async fn subscribe(&self) -> Result<HeaderStream<TestHeader>, HeaderError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| HeaderError::Service("already subscribed".to_owned()))?;

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(stream.boxed())
    }
}

/// Polls `condition` every few milliseconds until it returns `true`.
///
/// # Panics
///
/// Panics when the condition is not reached within 10 seconds.
pub async fn poll_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
