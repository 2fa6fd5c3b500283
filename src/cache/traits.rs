//! Core traits and types for the persistent cache store.

use chrono::{DateTime, Utc};
use color_eyre::Result;

/// A cached payload addressed by its request identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Canonical request identity (the request URL)
  pub key: String,
  /// Opaque payload; the store never looks inside
  pub payload: Vec<u8>,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
}

/// A write that could not be delivered and waits for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  /// Auto-assigned, strictly increasing, never reused
  pub id: i64,
  /// Opaque payload; the store never looks inside
  pub payload: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
}

/// Trait for durable storage backends.
///
/// Backends are synchronous; [`CacheStore`](super::CacheStore) moves calls
/// onto the blocking pool so callers never stall the async runtime.
pub trait CacheStorage: Send + Sync {
  /// Upsert a cache entry.
  fn put(&self, key: &str, payload: &[u8]) -> Result<()>;

  /// Get the latest entry for a key.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Remove every entry of the active cache namespace.
  fn clear(&self) -> Result<usize>;

  /// Remove entries belonging to any namespace other than the active one.
  fn purge_stale_namespaces(&self) -> Result<usize>;

  /// Append a pending mutation and return its id.
  fn enqueue_mutation(&self, payload: &[u8]) -> Result<i64>;

  /// All pending mutations, oldest first.
  fn list_mutations(&self) -> Result<Vec<PendingMutation>>;

  /// Remove a mutation. Removing an unknown id is not an error.
  fn delete_mutation(&self, id: i64) -> Result<()>;

  /// Remove every pending mutation.
  fn clear_mutations(&self) -> Result<usize>;
}
