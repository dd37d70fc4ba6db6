//! Async plumbing shared by the lucerna workspace.

/// Task spawning utilities built around a re-joinable handle.
pub mod executor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// Timers that behave uniformly across runtimes.
pub mod time;
/// One-shot trigger token.
pub mod token;
