use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use lucerna_utils::executor::{spawn, JoinHandle};

use crate::checkpoint::Checkpoint;
use crate::checkpoint_store::CheckpointStore;
use crate::daser::Parameters;
use crate::header::{Header, HeaderGetter};
use crate::state::CoordinatorState;
use crate::stats::{SamplingStats, WorkerStats};
use crate::worker::{SampleFn, Worker, WorkerResult, WorkerState};

/// Requests served by the coordinator loop.
#[derive(Debug)]
pub(crate) enum CoordinatorCmd {
    GetStats {
        respond_to: oneshot::Sender<SamplingStats>,
    },
    GetCheckpoint {
        respond_to: oneshot::Sender<Checkpoint>,
    },
}

struct WorkerHandle {
    state: Arc<Mutex<WorkerState>>,
    join_handle: JoinHandle,
}

/// Single-threaded owner of the sampling state.
///
/// Dispatches jobs to workers up to the concurrency limit, ingests their
/// results, new network heads from the subscriber, and stats or checkpoint
/// requests.
pub(crate) struct SamplingCoordinator<H>
where
    H: Header,
{
    state: CoordinatorState,
    getter: Arc<dyn HeaderGetter<H>>,
    sample: SampleFn<H>,
    store: CheckpointStore,
    is_running: Arc<AtomicBool>,
    concurrency_limit: usize,
    cancellation_token: CancellationToken,
    cmd_rx: mpsc::Receiver<CoordinatorCmd>,
    new_head_rx: mpsc::Receiver<u64>,
    result_tx: mpsc::Sender<WorkerResult>,
    result_rx: mpsc::Receiver<WorkerResult>,
    workers: HashMap<u64, WorkerHandle>,
}

impl<H> SamplingCoordinator<H>
where
    H: Header,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        params: &Parameters,
        getter: Arc<dyn HeaderGetter<H>>,
        sample: SampleFn<H>,
        store: CheckpointStore,
        is_running: Arc<AtomicBool>,
        cancellation_token: CancellationToken,
        cmd_rx: mpsc::Receiver<CoordinatorCmd>,
        new_head_rx: mpsc::Receiver<u64>,
    ) -> SamplingCoordinator<H> {
        // Every worker emits at most one result, so the channel can absorb
        // all of them even when the loop is busy.
        let (result_tx, result_rx) = mpsc::channel(params.concurrency_limit);

        SamplingCoordinator {
            state: CoordinatorState::new(params),
            getter,
            sample,
            store,
            is_running,
            concurrency_limit: params.concurrency_limit,
            cancellation_token,
            cmd_rx,
            new_head_rx,
            result_tx,
            result_rx,
            workers: HashMap::new(),
        }
    }

    pub(crate) async fn run(&mut self, checkpoint: Checkpoint) {
        self.state.resume_from_checkpoint(&checkpoint);

        loop {
            self.dispatch();

            select! {
                _ = self.cancellation_token.cancelled() => {
                    break;
                }
                Some(height) = self.new_head_rx.recv() => {
                    self.state.update_head(height);
                }
                Some(result) = self.result_rx.recv() => {
                    self.on_result(result);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.on_cmd(cmd).await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Fill the free worker slots with jobs, while there are any.
    fn dispatch(&mut self) {
        while self.workers.len() < self.concurrency_limit {
            let Some(job) = self.state.next_job() else {
                break;
            };

            debug!(
                job_id = job.id,
                from = job.from,
                to = job.to,
                kind = ?job.kind,
                "dispatching job"
            );

            let (worker, state) = Worker::new(
                job,
                self.getter.clone(),
                self.sample.clone(),
                self.result_tx.clone(),
                self.cancellation_token.child_token(),
            );

            let join_handle = spawn(async move { worker.run().await });

            self.workers.insert(job.id, WorkerHandle { state, join_handle });
        }
    }

    fn on_result(&mut self, result: WorkerResult) {
        self.workers.remove(&result.job.id);
        self.state.handle_result(&result);
    }

    async fn on_cmd(&mut self, cmd: CoordinatorCmd) {
        match cmd {
            CoordinatorCmd::GetStats { respond_to } => {
                let stats = self.stats().await;
                let _ = respond_to.send(stats);
            }
            CoordinatorCmd::GetCheckpoint { respond_to } => {
                let _ = respond_to.send(self.state.checkpoint());
            }
        }
    }

    async fn stats(&self) -> SamplingStats {
        let mut workers = Vec::with_capacity(self.workers.len());

        for handle in self.workers.values() {
            let state = handle.state.lock().await;

            workers.push(WorkerStats {
                curr: state.curr,
                from: state.job.from,
                to: state.job.to,
                err_msg: state.err_msg.clone().unwrap_or_default(),
            });
        }

        workers.sort_by_key(|worker| worker.from);

        self.state
            .stats(workers, self.is_running.load(Ordering::Acquire))
    }

    /// Wait for all running workers, ingest whatever they reported, and
    /// persist the final checkpoint.
    async fn shutdown(&mut self) {
        debug!("stopping sampling coordinator");

        for handle in self.workers.values() {
            handle.join_handle.join().await;
        }

        // Workers interrupted by cancellation report nothing. Their heights
        // are re-dispatched on the next start.
        while let Ok(result) = self.result_rx.try_recv() {
            self.state.handle_result(&result);
        }
        self.workers.clear();

        let checkpoint = self.state.checkpoint();
        if let Err(e) = self.store.store(&checkpoint).await {
            error!(error = %e, "storing final checkpoint");
        }

        debug!(%checkpoint, "sampling coordinator stopped");
    }
}
