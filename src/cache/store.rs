//! Async front of the storage backends.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};

use super::storage::NoopStorage;
use super::traits::{CacheEntry, CacheStorage, PendingMutation};

/// The single owner of durable storage.
///
/// Every other component reads and writes cached payloads and pending
/// mutations through this handle. Calls run on tokio's blocking pool and are
/// safe to issue concurrently; racing `put`s on one key resolve by completion
/// order.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl CacheStore {
  pub fn new<S: CacheStorage + 'static>(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn from_arc(storage: Arc<dyn CacheStorage>) -> Self {
    Self { storage }
  }

  /// A store that keeps nothing.
  pub fn disabled() -> Self {
    Self::new(NoopStorage)
  }

  async fn run<R, F>(&self, op: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&dyn CacheStorage) -> Result<R> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
      .await
      .map_err(|e| eyre!("Storage task failed: {}", e))?
  }

  /// Upsert an entry. Best effort: failures are logged, never returned.
  pub async fn put(&self, key: impl Into<String>, payload: Vec<u8>) {
    let key = key.into();
    let owned_key = key.clone();

    match self.run(move |s| s.put(&owned_key, &payload)).await {
      Ok(()) => debug!(key = %key, "Stored cache entry"),
      Err(e) => warn!(key = %key, error = %e, "Failed to store cache entry"),
    }
  }

  /// Latest entry for `key`. Storage failures read as a miss.
  pub async fn get(&self, key: &str) -> Option<CacheEntry> {
    let owned_key = key.to_string();

    match self.run(move |s| s.get(&owned_key)).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache unavailable, treating as miss");
        None
      }
    }
  }

  pub async fn clear(&self) -> Result<usize> {
    self.run(|s| s.clear()).await
  }

  pub async fn purge_stale_namespaces(&self) -> Result<usize> {
    self.run(|s| s.purge_stale_namespaces()).await
  }

  pub async fn enqueue_mutation(&self, payload: Vec<u8>) -> Result<i64> {
    self.run(move |s| s.enqueue_mutation(&payload)).await
  }

  pub async fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
    self.run(|s| s.list_mutations()).await
  }

  pub async fn delete_mutation(&self, id: i64) -> Result<()> {
    self.run(move |s| s.delete_mutation(id)).await
  }

  pub async fn clear_mutations(&self) -> Result<usize> {
    self.run(|s| s.clear_mutations()).await
  }
}
