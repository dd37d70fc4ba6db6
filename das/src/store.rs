//! Interface of the key-value store used for checkpoint persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Representation of all the errors that the key-value store can produce.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backing storage failure.
    #[error("Backing store: {0}")]
    Backing(String),
}

/// Minimal key-value store used for checkpoint persistence.
///
/// A single `put` must be atomic with respect to concurrent `get`s of the
/// same key.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// A non-persistent in-memory [`Datastore`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryDatastore {
    /// Create a new store.
    pub fn new() -> InMemoryDatastore {
        InMemoryDatastore::default()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }
}
