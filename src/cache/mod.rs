//! Persistent cache store for response payloads and queued writes.
//!
//! This module provides a transport-agnostic durable store that:
//! - Keeps one payload per request identity, overwritten on every `put`
//! - Keeps a FIFO queue of writes that still have to reach the server
//! - Never expires entries; staleness is reported through `stored_at`
//! - Degrades to a no-op backend when durable storage is unavailable

mod storage;
mod store;
mod traits;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::CacheConfig;

pub use storage::{NoopStorage, SqliteStorage};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheStorage, PendingMutation};

/// Open the configured backend, falling back to [`NoopStorage`] when caching
/// is disabled or the database cannot be opened.
pub fn open_storage(config: &CacheConfig) -> Arc<dyn CacheStorage> {
  if !config.enabled {
    info!("Caching disabled by configuration");
    return Arc::new(NoopStorage);
  }

  let opened = match &config.path {
    Some(path) => SqliteStorage::open_at(path, &config.name),
    None => SqliteStorage::open(&config.name),
  };

  match opened {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!(error = %e, "Durable storage unavailable, continuing without cache");
      Arc::new(NoopStorage)
    }
  }
}
