use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::availability::AvailabilityError;
use crate::header::{Header, HeaderError, HeaderGetter};

/// Probe invoked by workers for every visited header.
pub(crate) type SampleFn<H> =
    Arc<dyn Fn(H) -> BoxFuture<'static, Result<(), AvailabilityError>> + Send + Sync>;

/// Headers interval processed by a single worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Job {
    pub(crate) id: u64,
    pub(crate) kind: JobKind,
    pub(crate) from: u64,
    pub(crate) to: u64,
}

/// Scheduling class of a job. Affects accounting only, not execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Priority,
    Retry,
    CatchUp,
}

/// Mutable state of a running worker, shared with the stats view.
#[derive(Debug, Clone)]
pub(crate) struct WorkerState {
    pub(crate) job: Job,
    pub(crate) curr: u64,
    pub(crate) failed: Vec<u64>,
    pub(crate) byzantine: Vec<u64>,
    pub(crate) err_msg: Option<String>,
}

/// Message emitted by a worker after visiting its whole interval.
///
/// A worker interrupted by cancellation emits nothing; the coordinator
/// re-dispatches its heights on the next start.
#[derive(Debug)]
pub(crate) struct WorkerResult {
    pub(crate) job: Job,
    pub(crate) failed: Vec<u64>,
    pub(crate) byzantine: Vec<u64>,
    pub(crate) error: Option<String>,
}

pub(crate) struct Worker<H>
where
    H: Header,
{
    state: Arc<Mutex<WorkerState>>,
    getter: Arc<dyn HeaderGetter<H>>,
    sample: SampleFn<H>,
    result_tx: mpsc::Sender<WorkerResult>,
    cancellation_token: CancellationToken,
}

impl<H> Worker<H>
where
    H: Header,
{
    pub(crate) fn new(
        job: Job,
        getter: Arc<dyn HeaderGetter<H>>,
        sample: SampleFn<H>,
        result_tx: mpsc::Sender<WorkerResult>,
        cancellation_token: CancellationToken,
    ) -> (Worker<H>, Arc<Mutex<WorkerState>>) {
        let state = Arc::new(Mutex::new(WorkerState {
            job,
            curr: job.from,
            failed: Vec::new(),
            byzantine: Vec::new(),
            err_msg: None,
        }));

        let worker = Worker {
            state: state.clone(),
            getter,
            sample,
            result_tx,
            cancellation_token,
        };

        (worker, state)
    }

    /// Visit every height of the job in ascending order, probing each one.
    pub(crate) async fn run(self) {
        let job = self.state.lock().await.job;

        debug!(from = job.from, to = job.to, "starting sampling worker");

        for height in job.from..=job.to {
            let header = select! {
                _ = self.cancellation_token.cancelled() => return,
                res = self.getter.get_by_height(height) => match res {
                    Ok(header) => header,
                    Err(HeaderError::Cancelled) => return,
                    Err(e) => {
                        error!(height, error = %e, "failed to get header from header store");
                        self.record_failure(height, &e.to_string()).await;
                        continue;
                    }
                }
            };

            debug!(height, "got header from header store");

            select! {
                _ = self.cancellation_token.cancelled() => return,
                res = (self.sample)(header) => match res {
                    Ok(()) => {
                        debug!(height, "sampled header");
                        self.record_success(height).await;
                    }
                    Err(AvailabilityError::Cancelled) => return,
                    Err(e @ AvailabilityError::Byzantine(_)) => {
                        self.record_byzantine(height, &e.to_string()).await;
                    }
                    Err(e) => {
                        self.record_failure(height, &e.to_string()).await;
                    }
                }
            }
        }

        let result = {
            let state = self.state.lock().await;

            WorkerResult {
                job: state.job,
                failed: state.failed.clone(),
                byzantine: state.byzantine.clone(),
                error: state.err_msg.clone(),
            }
        };

        info!(from = job.from, to = job.to, "sampled headers");

        select! {
            _ = self.cancellation_token.cancelled() => {}
            _ = self.result_tx.send(result) => {}
        }
    }

    async fn record_success(&self, height: u64) {
        let mut state = self.state.lock().await;
        state.curr = height;
    }

    async fn record_failure(&self, height: u64, error: &str) {
        let mut state = self.state.lock().await;
        state.curr = height;
        state.failed.push(height);
        append_error(&mut state.err_msg, height, error);
    }

    async fn record_byzantine(&self, height: u64, error: &str) {
        let mut state = self.state.lock().await;
        state.curr = height;
        state.byzantine.push(height);
        append_error(&mut state.err_msg, height, error);
    }
}

fn append_error(err_msg: &mut Option<String>, height: u64, error: &str) {
    let entry = format!("height {height}: {error}");

    match err_msg {
        Some(msg) => {
            msg.push_str("; ");
            msg.push_str(&entry);
        }
        None => *err_msg = Some(entry),
    }
}
