use std::fmt::{self, Debug};
use std::future::Future;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::token::Token;

/// Handle for awaiting the completion of a spawned task.
///
/// Unlike `tokio::task::JoinHandle` it can be awaited any number of times,
/// from multiple tasks, even after the task has finished.
pub struct JoinHandle(Token);

impl JoinHandle {
    /// Await for the task to return.
    pub async fn join(&self) {
        self.0.triggered().await;
    }
}

impl Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinHandle { .. }")
    }
}

/// Spawn a task on the tokio executor.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = Token::new();
    let guard = token.trigger_drop_guard();

    tokio::spawn(async move {
        let _guard = guard;
        future.await;
    });

    JoinHandle(token)
}

/// Spawn a cancellable task.
///
/// This will cancel the task in the highest layer and should not be used
/// if cancellation must happen in a specific point.
#[track_caller]
pub fn spawn_cancellable<F>(cancellation_token: CancellationToken, future: F) -> JoinHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = Token::new();
    let guard = token.trigger_drop_guard();

    tokio::spawn(async move {
        let _guard = guard;

        select! {
            // Run branches in order.
            biased;

            _ = cancellation_token.cancelled() => {}
            _ = future => {}
        }
    });

    JoinHandle(token)
}
