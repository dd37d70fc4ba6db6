use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;
use crate::daser::Parameters;
use crate::stats::{SamplingStats, WorkerStats};
use crate::worker::{Job, JobKind, WorkerResult};

/// Authoritative record of the sampling progress.
///
/// Owned and mutated exclusively by the coordinator loop. At every quiescent
/// instant `genesis_height <= sampled_head + 1`, `sampled_head <=
/// catchup_head <= network_head`, and no two in-progress jobs overlap.
pub(crate) struct CoordinatorState {
    genesis_height: u64,
    sampling_range: u64,
    priority_queue_size: usize,
    max_retries: u32,

    /// Every height in `[genesis_height, sampled_head]` was successfully
    /// sampled.
    sampled_head: u64,
    /// Every height in `[genesis_height, catchup_head]` was dispatched to a
    /// worker or resolved otherwise.
    catchup_head: u64,
    /// Highest height seen on the network.
    network_head: u64,

    /// Successfully sampled heights above `sampled_head`, awaiting the
    /// contiguous prefix to reach them.
    sampled_ahead: BTreeSet<u64>,
    /// Heights that finished sampling without success, with the amount of
    /// attempts per height.
    failed: HashMap<u64, u32>,
    /// Heights currently dispatched as retries, holding their previous
    /// attempt counts until the result arrives.
    in_retry: HashMap<u64, u32>,
    /// Heights with a detected erasure coding violation, with the amount of
    /// attempts. Never retried.
    byzantine: HashMap<u64, u32>,
    /// Recently announced heights awaiting prioritized sampling. The oldest
    /// entry is dropped on overflow.
    priority: VecDeque<u64>,
    /// Intervals of the currently running jobs, by job id.
    in_progress: HashMap<u64, Job>,
    next_job_id: u64,
}

impl CoordinatorState {
    pub(crate) fn new(params: &Parameters) -> CoordinatorState {
        CoordinatorState {
            genesis_height: params.genesis_height,
            sampling_range: params.sampling_range,
            priority_queue_size: params.priority_queue_size,
            max_retries: params.max_retries,
            sampled_head: params.genesis_height - 1,
            catchup_head: params.genesis_height - 1,
            network_head: params.genesis_height - 1,
            sampled_ahead: BTreeSet::new(),
            failed: HashMap::new(),
            in_retry: HashMap::new(),
            byzantine: HashMap::new(),
            priority: VecDeque::new(),
            in_progress: HashMap::new(),
            next_job_id: 0,
        }
    }

    /// Initialize the progress markers from a checkpoint.
    pub(crate) fn resume_from_checkpoint(&mut self, checkpoint: &Checkpoint) {
        let sample_from = checkpoint.sample_from.max(self.genesis_height);

        self.sampled_head = sample_from - 1;
        self.catchup_head = self.sampled_head;
        self.network_head = checkpoint.network_head.max(self.sampled_head);
        self.failed = checkpoint.failed.clone();
    }

    /// Ingest a new network head reported by the subscriber.
    ///
    /// Heads at or below the known network head are ignored; the
    /// subscription may repeat or reorder them.
    pub(crate) fn update_head(&mut self, height: u64) -> bool {
        if height <= self.network_head {
            debug!(
                height,
                known = self.network_head,
                "ignoring known network head"
            );
            return false;
        }

        self.network_head = height;

        if self.priority_queue_size > 0 {
            if self.priority.len() == self.priority_queue_size {
                // The dropped height is still covered by catch-up.
                let dropped = self.priority.pop_front();
                debug!(?dropped, "priority queue overflow, dropping oldest");
            }
            self.priority.push_back(height);
        }

        true
    }

    /// Produce the next job to dispatch, if any.
    ///
    /// Recently announced heights go first, then retries of failed heights
    /// in ascending order, then the next catch-up interval toward the
    /// network head.
    pub(crate) fn next_job(&mut self) -> Option<Job> {
        if let Some(job) = self.next_from_priority() {
            return Some(job);
        }
        if let Some(job) = self.next_retry() {
            return Some(job);
        }
        self.next_catchup()
    }

    fn next_from_priority(&mut self) -> Option<Job> {
        while let Some(height) = self.priority.pop_front() {
            // The height may have been covered in the meantime.
            if height <= self.catchup_head
                || self.is_sampled(height)
                || self.covered_by_in_progress(height)
            {
                continue;
            }

            return Some(self.new_job(JobKind::Priority, height, height));
        }

        None
    }

    fn next_retry(&mut self) -> Option<Job> {
        let height = self
            .failed
            .iter()
            .filter(|(_, &attempts)| attempts < self.max_retries)
            .map(|(&height, _)| height)
            .min()?;

        let attempts = self.failed.remove(&height).unwrap_or(0);
        self.in_retry.insert(height, attempts);

        Some(self.new_job(JobKind::Retry, height, height))
    }

    fn next_catchup(&mut self) -> Option<Job> {
        // The frontier absorbs heights that are already resolved or
        // accounted for elsewhere, so they are never dispatched twice.
        while self.catchup_head < self.network_head && self.is_accounted(self.catchup_head + 1) {
            self.catchup_head += 1;
        }

        if self.catchup_head >= self.network_head {
            return None;
        }

        let from = self.catchup_head + 1;
        let mut to = (from + self.sampling_range - 1).min(self.network_head);

        // The interval must not overlap running jobs or resolved heights.
        for height in from + 1..=to {
            if self.is_accounted(height) {
                to = height - 1;
                break;
            }
        }

        self.catchup_head = to;

        Some(self.new_job(JobKind::CatchUp, from, to))
    }

    /// Ingest the result of a finished job.
    pub(crate) fn handle_result(&mut self, result: &WorkerResult) {
        self.in_progress.remove(&result.job.id);

        let failed: HashSet<u64> = result.failed.iter().copied().collect();
        let byzantine: HashSet<u64> = result.byzantine.iter().copied().collect();

        for height in result.job.from..=result.job.to {
            let attempts = self
                .in_retry
                .remove(&height)
                .or_else(|| self.failed.get(&height).copied())
                .unwrap_or(0);

            if byzantine.contains(&height) {
                self.failed.remove(&height);
                self.byzantine.insert(height, attempts + 1);
            } else if failed.contains(&height) {
                let attempts = attempts + 1;
                if attempts >= self.max_retries {
                    warn!(height, attempts, "header exhausted sampling retries");
                }
                self.failed.insert(height, attempts);
            } else {
                self.failed.remove(&height);
                self.mark_sampled(height);
            }
        }
    }

    /// Record a successfully sampled height, advancing `sampled_head` over
    /// the contiguous prefix. Amortized O(1) per success.
    fn mark_sampled(&mut self, height: u64) {
        if height <= self.sampled_head {
            return;
        }

        if height == self.sampled_head + 1 {
            self.sampled_head = height;

            // Absorb previously sampled heights that are now contiguous.
            while self.sampled_ahead.remove(&(self.sampled_head + 1)) {
                self.sampled_head += 1;
            }

            self.catchup_head = self.catchup_head.max(self.sampled_head);
        } else {
            self.sampled_ahead.insert(height);
        }
    }

    fn is_sampled(&self, height: u64) -> bool {
        height <= self.sampled_head || self.sampled_ahead.contains(&height)
    }

    fn is_accounted(&self, height: u64) -> bool {
        self.is_sampled(height)
            || self.byzantine.contains_key(&height)
            || self.failed.contains_key(&height)
            || self.in_retry.contains_key(&height)
            || self.covered_by_in_progress(height)
    }

    fn covered_by_in_progress(&self, height: u64) -> bool {
        self.in_progress
            .values()
            .any(|job| job.from <= height && height <= job.to)
    }

    fn new_job(&mut self, kind: JobKind, from: u64, to: u64) -> Job {
        self.next_job_id += 1;

        let job = Job {
            id: self.next_job_id,
            kind,
            from,
            to,
        };
        self.in_progress.insert(job.id, job);

        job
    }

    /// Capture the persisted form of the current progress.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut failed = self.failed.clone();
        failed.extend(&self.in_retry);
        failed.extend(&self.byzantine);

        Checkpoint {
            sample_from: self.sampled_head + 1,
            network_head: self.network_head,
            failed,
        }
    }

    /// Build a stats snapshot around the provided worker states.
    pub(crate) fn stats(&self, workers: Vec<WorkerStats>, is_running: bool) -> SamplingStats {
        let mut failed = self.failed.clone();
        failed.extend(&self.in_retry);
        failed.extend(&self.byzantine);

        SamplingStats {
            sampled_chain_head: self.sampled_head,
            catchup_head: self.catchup_head,
            network_head: self.network_head,
            failed,
            concurrency: workers.len(),
            workers,
            catch_up_done: self.sampled_head >= self.network_head,
            is_running,
        }
    }

    #[cfg(test)]
    pub(crate) fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        Parameters {
            sampling_range: 10,
            concurrency_limit: 4,
            priority_queue_size: 4,
            genesis_height: 1,
            max_retries: 3,
            ..Parameters::default()
        }
    }

    fn state_with_head(network_head: u64) -> CoordinatorState {
        let mut state = CoordinatorState::new(&params());
        state.resume_from_checkpoint(&Checkpoint {
            sample_from: 1,
            network_head,
            failed: HashMap::new(),
        });
        state
    }

    fn ok_result(job: Job) -> WorkerResult {
        WorkerResult {
            job,
            failed: Vec::new(),
            byzantine: Vec::new(),
            error: None,
        }
    }

    fn failed_result(job: Job, failed: Vec<u64>) -> WorkerResult {
        WorkerResult {
            job,
            failed,
            byzantine: Vec::new(),
            error: Some("boom".to_owned()),
        }
    }

    #[test]
    fn catchup_jobs_cover_the_backlog_in_ranges() {
        let mut state = state_with_head(25);

        let job1 = state.next_job().unwrap();
        assert_eq!((job1.kind, job1.from, job1.to), (JobKind::CatchUp, 1, 10));

        let job2 = state.next_job().unwrap();
        assert_eq!((job2.kind, job2.from, job2.to), (JobKind::CatchUp, 11, 20));

        let job3 = state.next_job().unwrap();
        assert_eq!((job3.kind, job3.from, job3.to), (JobKind::CatchUp, 21, 25));

        assert!(state.next_job().is_none());
        assert_eq!(state.in_progress_len(), 3);
    }

    #[test]
    fn results_advance_the_sampled_head_without_gaps() {
        let mut state = state_with_head(25);

        let job1 = state.next_job().unwrap();
        let job2 = state.next_job().unwrap();
        let job3 = state.next_job().unwrap();

        // Results arrive out of order.
        state.handle_result(&ok_result(job2));
        assert_eq!(state.checkpoint().sample_from, 1);

        state.handle_result(&ok_result(job1));
        assert_eq!(state.checkpoint().sample_from, 21);

        state.handle_result(&ok_result(job3));
        assert_eq!(state.checkpoint().sample_from, 26);

        let stats = state.stats(Vec::new(), true);
        assert!(stats.catch_up_done);
        assert_eq!(stats.sampled_chain_head, 25);
    }

    #[test]
    fn priority_preempts_catchup() {
        let mut state = state_with_head(100);

        let catchup = state.next_job().unwrap();
        assert_eq!(catchup.kind, JobKind::CatchUp);

        assert!(state.update_head(1000));

        let job = state.next_job().unwrap();
        assert_eq!((job.kind, job.from, job.to), (JobKind::Priority, 1000, 1000));
    }

    #[test]
    fn repeated_and_old_heads_are_ignored() {
        let mut state = state_with_head(50);

        assert!(!state.update_head(50));
        assert!(!state.update_head(30));
        assert!(state.update_head(51));
        assert!(!state.update_head(51));
    }

    #[test]
    fn priority_queue_drops_the_oldest_head_on_overflow() {
        let mut state = state_with_head(50);

        for height in [100, 101, 102, 103, 104] {
            assert!(state.update_head(height));
        }

        assert_eq!(state.priority, VecDeque::from([101, 102, 103, 104]));
    }

    #[test]
    fn zero_priority_queue_size_disables_prioritization() {
        let mut state = CoordinatorState::new(&Parameters {
            priority_queue_size: 0,
            ..params()
        });
        state.resume_from_checkpoint(&Checkpoint {
            sample_from: 1,
            network_head: 1,
            failed: HashMap::new(),
        });

        assert!(state.update_head(100));
        assert!(state.priority.is_empty());

        let job = state.next_job().unwrap();
        assert_eq!(job.kind, JobKind::CatchUp);
    }

    #[test]
    fn failed_heights_are_retried_in_ascending_order() {
        let mut state = state_with_head(5);

        let job = state.next_job().unwrap();
        assert_eq!((job.from, job.to), (1, 5));

        state.handle_result(&failed_result(job, vec![4, 2]));

        let stats = state.stats(Vec::new(), true);
        assert_eq!(stats.sampled_chain_head, 1);
        assert_eq!(stats.failed, HashMap::from([(2, 1), (4, 1)]));

        let retry = state.next_job().unwrap();
        assert_eq!((retry.kind, retry.from, retry.to), (JobKind::Retry, 2, 2));

        // While the retry is in flight the height stays out of `failed` but
        // is still reported unresolved.
        assert_eq!(state.failed.get(&2), None);
        assert_eq!(state.stats(Vec::new(), true).failed.get(&2), Some(&1));

        state.handle_result(&ok_result(retry));

        // A successful retry clears the entry and advances the prefix.
        let stats = state.stats(Vec::new(), true);
        assert_eq!(stats.sampled_chain_head, 3);
        assert_eq!(stats.failed, HashMap::from([(4, 1)]));

        let retry = state.next_job().unwrap();
        assert_eq!((retry.kind, retry.from, retry.to), (JobKind::Retry, 4, 4));
        state.handle_result(&ok_result(retry));

        assert_eq!(state.stats(Vec::new(), true).sampled_chain_head, 5);
        assert!(state.next_job().is_none());
    }

    #[test]
    fn retries_stop_at_the_ceiling() {
        let mut state = state_with_head(1);

        for attempt in 1..=3 {
            let job = state.next_job().unwrap();
            state.handle_result(&failed_result(job, vec![1]));
            assert_eq!(state.stats(Vec::new(), true).failed.get(&1), Some(&attempt));
        }

        // The ceiling is reached. The height stays failed indefinitely.
        assert!(state.next_job().is_none());
        assert_eq!(state.checkpoint().failed.get(&1), Some(&3));
        assert_eq!(state.stats(Vec::new(), true).sampled_chain_head, 0);
    }

    #[test]
    fn byzantine_heights_block_the_prefix_and_are_never_retried() {
        let mut state = state_with_head(10);

        let job = state.next_job().unwrap();
        assert_eq!((job.from, job.to), (1, 10));

        state.handle_result(&WorkerResult {
            job,
            failed: Vec::new(),
            byzantine: vec![7],
            error: Some("invalid erasure coding".to_owned()),
        });

        let stats = state.stats(Vec::new(), true);
        assert_eq!(stats.sampled_chain_head, 6);
        assert_eq!(stats.failed.get(&7), Some(&1));
        assert!(!stats.catch_up_done);

        // Neither a retry nor a catch-up interval may touch the height.
        assert!(state.next_job().is_none());
        assert_eq!(state.checkpoint().sample_from, 7);
    }

    #[test]
    fn catchup_never_overlaps_running_or_resolved_heights() {
        let mut state = state_with_head(100);

        state.update_head(1000);
        let sampled_ahead = state.next_job().unwrap();
        assert_eq!((sampled_ahead.from, sampled_ahead.to), (1000, 1000));
        state.handle_result(&ok_result(sampled_ahead));

        state.update_head(1005);
        let running = state.next_job().unwrap();
        assert_eq!((running.from, running.to), (1005, 1005));

        // Drain the whole backlog. No interval may touch the already
        // sampled height 1000 or the running job at 1005.
        let mut dispatched = Vec::new();
        while let Some(job) = state.next_job() {
            assert_eq!(job.kind, JobKind::CatchUp);
            assert!(!(job.from..=job.to).contains(&1000), "job {job:?} overlaps");
            assert!(!(job.from..=job.to).contains(&1005), "job {job:?} overlaps");
            dispatched.push(job);
        }

        // 1..=999 and 1001..=1004.
        let covered: u64 = dispatched.iter().map(|job| job.to - job.from + 1).sum();
        assert_eq!(covered, 1003);

        for job in dispatched {
            state.handle_result(&ok_result(job));
        }
        state.handle_result(&ok_result(running));

        assert_eq!(state.stats(Vec::new(), true).sampled_chain_head, 1005);
        assert!(state.next_job().is_none());
    }

    #[test]
    fn resume_starts_catchup_after_the_checkpoint() {
        let mut state = CoordinatorState::new(&params());
        state.resume_from_checkpoint(&Checkpoint {
            sample_from: 101,
            network_head: 120,
            failed: HashMap::from([(105, 2)]),
        });

        let stats = state.stats(Vec::new(), true);
        assert_eq!(stats.sampled_chain_head, 100);
        assert_eq!(stats.network_head, 120);

        // The previously failed height is picked up again by retry.
        let retry = state.next_job().unwrap();
        assert_eq!((retry.kind, retry.from, retry.to), (JobKind::Retry, 105, 105));

        let job = state.next_job().unwrap();
        assert_eq!((job.kind, job.from, job.to), (JobKind::CatchUp, 101, 104));

        let job = state.next_job().unwrap();
        assert_eq!((job.kind, job.from, job.to), (JobKind::CatchUp, 106, 115));
    }

    #[test]
    fn genesis_height_bounds_the_backlog() {
        let mut state = CoordinatorState::new(&Parameters {
            genesis_height: 40,
            ..params()
        });
        state.resume_from_checkpoint(&Checkpoint {
            sample_from: 40,
            network_head: 45,
            failed: HashMap::new(),
        });

        let job = state.next_job().unwrap();
        assert_eq!((job.from, job.to), (40, 45));
    }

    #[test]
    fn checkpoint_folds_unresolved_heights() {
        let mut state = state_with_head(10);

        let job = state.next_job().unwrap();
        state.handle_result(&failed_result(job, vec![3, 5]));

        // Dispatch the retry of height 3 and leave it in flight.
        let retry = state.next_job().unwrap();
        assert_eq!(retry.from, 3);

        let checkpoint = state.checkpoint();
        assert_eq!(checkpoint.sample_from, 3);
        assert_eq!(checkpoint.network_head, 10);
        assert_eq!(checkpoint.failed, HashMap::from([(3, 1), (5, 1)]));
    }

    #[test]
    fn catchup_absorbs_heights_sampled_ahead() {
        let mut state = state_with_head(10);

        state.update_head(12);
        let job = state.next_job().unwrap();
        assert_eq!((job.kind, job.from, job.to), (JobKind::Priority, 12, 12));
        state.handle_result(&ok_result(job));

        // Catch-up covers 1-11 and absorbs the sampled height 12 instead
        // of dispatching it again.
        let job = state.next_job().unwrap();
        assert_eq!((job.from, job.to), (1, 10));
        state.handle_result(&ok_result(job));
        let job = state.next_job().unwrap();
        assert_eq!((job.from, job.to), (11, 11));
        state.handle_result(&ok_result(job));

        assert_eq!(state.stats(Vec::new(), true).sampled_chain_head, 12);
        assert!(state.next_job().is_none());
    }
}
