use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use lucerna_utils::executor::{spawn_cancellable, JoinHandle};
use lucerna_utils::time::Interval;

use crate::checkpoint::Checkpoint;
use crate::coordinator::CoordinatorCmd;
use crate::store::{Datastore, StoreError};

/// Key under which the sampling checkpoint is persisted.
const CHECKPOINT_KEY: &str = "das/checkpoint";

type Result<T, E = CheckpointStoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CheckpointStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Checkpoint encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Loads and persists sampling checkpoints in a [`Datastore`].
#[derive(Clone)]
pub(crate) struct CheckpointStore {
    datastore: Arc<dyn Datastore>,
}

impl CheckpointStore {
    pub(crate) fn new(datastore: Arc<dyn Datastore>) -> CheckpointStore {
        CheckpointStore { datastore }
    }

    /// Returns the stored checkpoint. `None` when no checkpoint was stored
    /// yet or the stored value cannot be decoded.
    pub(crate) async fn load(&self) -> Result<Option<Checkpoint>> {
        let Some(bytes) = self.datastore.get(CHECKPOINT_KEY).await? else {
            return Ok(None);
        };

        match Checkpoint::decode(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                // Sampling restarts from genesis. Re-sampling is safe.
                warn!(error = %e, "stored checkpoint is corrupted, ignoring it");
                Ok(None)
            }
        }
    }

    pub(crate) async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = checkpoint.encode()?;
        self.datastore.put(CHECKPOINT_KEY, bytes).await?;
        Ok(())
    }

    /// Spawn the background task persisting coordinator checkpoints every
    /// `interval`.
    pub(crate) fn spawn_background_store(
        &self,
        cancellation_token: CancellationToken,
        interval: Duration,
        cmd_tx: mpsc::Sender<CoordinatorCmd>,
    ) -> JoinHandle {
        let store = self.clone();

        spawn_cancellable(cancellation_token, async move {
            let mut interval = Interval::new(interval).await;

            loop {
                interval.tick().await;
                store.store_from_coordinator(&cmd_tx).await;
            }
        })
    }

    async fn store_from_coordinator(&self, cmd_tx: &mpsc::Sender<CoordinatorCmd>) {
        let (tx, rx) = oneshot::channel();

        let cmd = CoordinatorCmd::GetCheckpoint { respond_to: tx };
        if cmd_tx.send(cmd).await.is_err() {
            return;
        }

        let Ok(checkpoint) = rx.await else {
            return;
        };

        match self.store(&checkpoint).await {
            Ok(()) => debug!(%checkpoint, "stored checkpoint"),
            Err(e) => error!(error = %e, "storing checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDatastore;
    use lucerna_utils::test_utils::async_test;
    use std::collections::HashMap;

    #[async_test]
    async fn store_and_load() {
        let store = CheckpointStore::new(Arc::new(InMemoryDatastore::new()));

        assert_eq!(store.load().await.unwrap(), None);

        let checkpoint = Checkpoint {
            sample_from: 42,
            network_head: 100,
            failed: HashMap::from([(17, 4)]),
        };

        store.store(&checkpoint).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(checkpoint));
    }

    #[async_test]
    async fn corrupted_checkpoint_is_ignored() {
        let datastore = Arc::new(InMemoryDatastore::new());
        datastore
            .put(CHECKPOINT_KEY, b"not a checkpoint".to_vec())
            .await
            .unwrap();

        let store = CheckpointStore::new(datastore);
        assert_eq!(store.load().await.unwrap(), None);
    }
}
