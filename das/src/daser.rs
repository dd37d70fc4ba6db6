//! Component responsible for data availability sampling of the block
//! headers observed on the network.
//!
//! For every known height the sampler:
//!
//! 1. Fetches the header from the header store.
//! 2. Invokes the availability probe, which retrieves and verifies a small
//!    random subset of the block's erasure-coded shares.
//! 3. Records the outcome. Transient failures are retried up to a ceiling,
//!    while a provably malformed square triggers a fraud proof broadcast
//!    and is never sampled again.
//!
//! Newly announced heads are sampled with priority, while a catch-up queue
//! walks the backlog of past heights toward the network head. Progress is
//! periodically checkpointed in the provided datastore so that sampling
//! resumes where it stopped after a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lucerna_utils::executor::{spawn, JoinHandle};
use lucerna_utils::time::timeout;

use crate::availability::{Availability, AvailabilityError};
use crate::checkpoint::Checkpoint;
use crate::checkpoint_store::CheckpointStore;
use crate::coordinator::{CoordinatorCmd, SamplingCoordinator};
use crate::fraud::{BadEncodingReport, FraudBroadcaster};
use crate::header::{Header, HeaderError, HeaderGetter, HeaderSubscriber};
use crate::stats::SamplingStats;
use crate::store::Datastore;
use crate::subscriber::Subscriber;
use crate::worker::SampleFn;

type Result<T, E = DaserError> = std::result::Result<T, E>;

/// Representation of all the errors that can occur in `Daser` component.
#[derive(Debug, thiserror::Error)]
pub enum DaserError {
    /// Invalid configuration value.
    #[error("das: invalid option value: {option}, cannot be {value}")]
    InvalidOption {
        /// Name of the offending option.
        option: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The sampler was already started.
    #[error("das: already started")]
    AlreadyStarted,

    /// The sampler was stopped. A stopped instance cannot be restarted.
    #[error("das: already stopped")]
    Stopped,

    /// The sampler is not running.
    #[error("das: not running")]
    NotRunning,

    /// Header subscription could not be established.
    #[error("das: subscribing to headers: {0}")]
    Subscribe(#[from] HeaderError),

    /// Shutdown did not finish before the deadline. In-flight tasks still
    /// unwind in the background.
    #[error("das: force quit, tasks did not finish in time")]
    ForcedQuit,
}

impl DaserError {
    fn invalid_option(option: &'static str, value: impl ToString) -> DaserError {
        DaserError::InvalidOption {
            option,
            value: value.to_string(),
        }
    }
}

/// Configuration of the [`Daser`].
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Maximum amount of contiguous heights processed in one job.
    /// (default: 100)
    pub sampling_range: u64,
    /// Maximum amount of sampling workers running in parallel.
    /// (default: 16)
    pub concurrency_limit: usize,
    /// Period of the background checkpoint writer. Zero disables periodic
    /// writes; a checkpoint is still written on stop. (default: 10 minutes)
    pub bg_store_interval: Duration,
    /// Size limit of the queue of recently announced heights sampled ahead
    /// of catch-up. On overflow the oldest queued height is dropped and
    /// left to catch-up. Zero disables prioritization. (default: 64)
    pub priority_queue_size: usize,
    /// Height sampling starts from. (default: 1)
    pub genesis_height: u64,
    /// Amount of sampling attempts per height before it is left in the
    /// failed set indefinitely. (default: 8)
    pub max_retries: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            sampling_range: 100,
            concurrency_limit: 16,
            bg_store_interval: Duration::from_secs(10 * 60),
            priority_queue_size: 16 * 4,
            genesis_height: 1,
            max_retries: 8,
        }
    }
}

impl Parameters {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_range == 0 {
            return Err(DaserError::invalid_option("sampling_range", 0));
        }
        if self.concurrency_limit == 0 {
            return Err(DaserError::invalid_option("concurrency_limit", 0));
        }
        if self.genesis_height == 0 {
            return Err(DaserError::invalid_option("genesis_height", 0));
        }

        Ok(())
    }
}

/// Arguments used to configure the [`Daser`].
pub struct DaserArgs<H>
where
    H: Header,
{
    /// The availability probe.
    pub availability: Arc<dyn Availability<H>>,
    /// Provider of past headers.
    pub getter: Arc<dyn HeaderGetter<H>>,
    /// Source of newly announced headers.
    pub header_sub: Arc<dyn HeaderSubscriber<H>>,
    /// Gossip channel for fraud proofs.
    pub fraud: Arc<dyn FraudBroadcaster>,
    /// Key-value store for checkpoint persistence.
    pub datastore: Arc<dyn Datastore>,
    /// Configuration.
    pub params: Parameters,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct RunningTasks {
    cmd_tx: mpsc::Sender<CoordinatorCmd>,
    coordinator: JoinHandle,
    subscriber: JoinHandle,
    bg_store: Option<JoinHandle>,
}

/// Component continuously verifying availability of the data committed to
/// the block headers observed on the network.
pub struct Daser<H>
where
    H: Header,
{
    params: Parameters,
    availability: Arc<dyn Availability<H>>,
    getter: Arc<dyn HeaderGetter<H>>,
    header_sub: Arc<dyn HeaderSubscriber<H>>,
    fraud: Arc<dyn FraudBroadcaster>,
    store: CheckpointStore,
    lifecycle: AtomicU8,
    is_running: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<RunningTasks>>,
}

impl<H> std::fmt::Debug for Daser<H>
where
    H: Header,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daser").finish_non_exhaustive()
    }
}

impl<H> Daser<H>
where
    H: Header,
{
    /// Create a new [`Daser`] in stopped state.
    pub fn new(args: DaserArgs<H>) -> Result<Daser<H>> {
        args.params.validate()?;

        Ok(Daser {
            store: CheckpointStore::new(args.datastore),
            availability: args.availability,
            getter: args.getter,
            header_sub: args.header_sub,
            fraud: args.fraud,
            params: args.params,
            lifecycle: AtomicU8::new(IDLE),
            is_running: Arc::new(AtomicBool::new(false)),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(None),
        })
    }

    /// Subscribe to new headers and spawn the sampling tasks.
    ///
    /// Sampling resumes from the stored checkpoint, or from the genesis
    /// height when there is none.
    pub async fn start(&self) -> Result<()> {
        match self
            .lifecycle
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(STOPPED) => return Err(DaserError::Stopped),
            Err(_) => return Err(DaserError::AlreadyStarted),
        }

        let stream = match self.header_sub.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                self.lifecycle.store(IDLE, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let checkpoint = match self.store.load().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => self.initial_checkpoint().await,
            Err(e) => {
                warn!(error = %e, "loading checkpoint failed, starting from genesis");
                self.initial_checkpoint().await
            }
        };

        info!(%checkpoint, "starting sampling from checkpoint");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (new_head_tx, new_head_rx) = mpsc::channel(self.params.priority_queue_size.max(1));

        let mut coordinator = SamplingCoordinator::new(
            &self.params,
            self.getter.clone(),
            self.sample_fn(),
            self.store.clone(),
            self.is_running.clone(),
            self.cancellation_token.child_token(),
            cmd_rx,
            new_head_rx,
        );
        let coordinator_handle = spawn(async move { coordinator.run(checkpoint).await });

        let subscriber = Subscriber::new(
            self.header_sub.clone(),
            new_head_tx,
            self.cancellation_token.child_token(),
        );
        let subscriber_handle = spawn(async move { subscriber.run(stream).await });

        let bg_store = (!self.params.bg_store_interval.is_zero()).then(|| {
            self.store.spawn_background_store(
                self.cancellation_token.child_token(),
                self.params.bg_store_interval,
                cmd_tx.clone(),
            )
        });

        *self.tasks.lock().await = Some(RunningTasks {
            cmd_tx,
            coordinator: coordinator_handle,
            subscriber: subscriber_handle,
            bg_store,
        });
        self.is_running.store(true, Ordering::Release);

        Ok(())
    }

    /// Stop sampling and wait for all tasks to finish.
    ///
    /// The final checkpoint is written before this returns. Stopping is
    /// idempotent, but a stopped instance cannot be restarted; construct a
    /// new one instead.
    ///
    /// # Errors
    ///
    /// Returns [`DaserError::ForcedQuit`] when the tasks do not finish
    /// within `deadline`. They still unwind in the background.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if self.lifecycle.swap(STOPPED, Ordering::SeqCst) != RUNNING {
            return Ok(());
        }

        self.is_running.store(false, Ordering::Release);
        self.cancellation_token.cancel();

        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        timeout(deadline, async {
            // The coordinator waits for all of its workers and writes the
            // final checkpoint before returning.
            tasks.coordinator.join().await;

            if let Some(bg_store) = &tasks.bg_store {
                bg_store.join().await;
            }

            tasks.subscriber.join().await;
        })
        .await
        .map_err(|_| DaserError::ForcedQuit)
    }

    /// Returns statistics of the sampling process.
    pub async fn sampling_stats(&self) -> Result<SamplingStats> {
        let cmd_tx = {
            let tasks = self.tasks.lock().await;
            let Some(tasks) = tasks.as_ref() else {
                return Err(DaserError::NotRunning);
            };
            tasks.cmd_tx.clone()
        };

        let (tx, rx) = oneshot::channel();

        cmd_tx
            .send(CoordinatorCmd::GetStats { respond_to: tx })
            .await
            .map_err(|_| DaserError::NotRunning)?;

        rx.await.map_err(|_| DaserError::NotRunning)
    }

    async fn initial_checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint {
            sample_from: self.params.genesis_height,
            network_head: self.params.genesis_height,
            failed: HashMap::new(),
        };

        // Best effort. The subscriber delivers a fresh head soon after
        // startup anyway.
        if let Ok(head) = self.getter.head().await {
            checkpoint.network_head = checkpoint.network_head.max(head.height());
        }

        checkpoint
    }

    /// The probe handed to workers. Broadcasts a fraud proof whenever the
    /// availability probe detects an invalid erasure coding.
    fn sample_fn(&self) -> SampleFn<H> {
        let availability = self.availability.clone();
        let fraud = self.fraud.clone();

        Arc::new(move |header| {
            let availability = availability.clone();
            let fraud = fraud.clone();

            async move {
                let height = header.height();
                let res = availability.shares_available(&header).await;

                match &res {
                    Ok(()) | Err(AvailabilityError::Cancelled) => {}
                    Err(AvailabilityError::Byzantine(reason)) => {
                        warn!(height, "invalid erasure coding detected, propagating fraud proof");

                        let report = BadEncodingReport {
                            height,
                            reason: reason.clone(),
                        };
                        if let Err(e) = fraud.broadcast_bad_encoding(report).await {
                            error!(height, error = %e, "fraud proof propagation failed");
                        }
                    }
                    Err(e) => {
                        error!(height, error = %e, "sampling failed");
                    }
                }

                res
            }
            .boxed()
        })
    }
}

impl<H> Drop for Daser<H>
where
    H: Header,
{
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
