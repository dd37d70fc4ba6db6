//! Read-only view of the sampling progress.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Information about the sampling process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStats {
    /// All headers before this height were successfully sampled.
    #[serde(rename = "head_of_sampled_chain")]
    pub sampled_chain_head: u64,
    /// All headers before this height were submitted to sampling workers.
    #[serde(rename = "head_of_catchup")]
    pub catchup_head: u64,
    /// Height of the most recent header seen on the network.
    #[serde(rename = "network_head_height")]
    pub network_head: u64,
    /// Skipped header heights with the corresponding amount of attempts.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failed: HashMap<u64, u32>,
    /// Progress of every currently running worker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerStats>,
    /// Amount of workers running in parallel.
    pub concurrency: usize,
    /// Whether all known headers are sampled.
    pub catch_up_done: bool,
    /// Whether the sampler is running.
    pub is_running: bool,
}

/// Progress of a single running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Height the worker is currently sampling.
    #[serde(rename = "current")]
    pub curr: u64,
    /// First height of the worker's interval.
    pub from: u64,
    /// Last height of the worker's interval.
    pub to: u64,
    /// Message of the last error the worker encountered, if any.
    #[serde(default, rename = "error", skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}
