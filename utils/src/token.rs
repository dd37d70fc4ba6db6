use tokio_util::sync::CancellationToken;

/// One-shot trigger that any number of tasks can await.
///
/// Once triggered it stays triggered, so late waiters return immediately.
#[derive(Debug, Clone, Default)]
pub struct Token(CancellationToken);

impl Token {
    /// Create a new, untriggered `Token`.
    pub fn new() -> Token {
        Token::default()
    }

    /// Trigger the token, waking all current and future waiters.
    pub fn trigger(&self) {
        self.0.cancel();
    }

    /// Returns whether the token was triggered.
    pub fn is_triggered(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Completes when the token is triggered.
    pub async fn triggered(&self) {
        self.0.cancelled().await;
    }

    /// Returns a guard that triggers the token when dropped.
    ///
    /// The guard fires even if the owning task panics or is aborted.
    pub fn trigger_drop_guard(&self) -> TriggerDropGuard {
        TriggerDropGuard(Some(self.0.clone()))
    }
}

/// Guard triggering its [`Token`] on drop.
#[derive(Debug)]
pub struct TriggerDropGuard(Option<CancellationToken>);

impl TriggerDropGuard {
    /// Consume the guard without triggering the token.
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for TriggerDropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}
