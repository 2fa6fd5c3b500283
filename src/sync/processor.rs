use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::QueuedRequest;
use crate::cache::{CacheStore, PendingMutation};
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::http::Transport;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
  /// Another pass was already running; it picks this request up before it ends
  pub skipped: bool,
}

struct Inner {
  transport: Arc<dyn Transport>,
  store: CacheStore,
  base: Url,
  pass: Mutex<()>,
  /// Set by every trigger, cleared by the pass that serves it
  requested: AtomicBool,
}

/// Replays pending mutations against the server, oldest first.
///
/// A mutation is deleted only after the server answered 2xx. Anything else
/// leaves it queued for the next pass; a failure never stops the pass.
#[derive(Clone)]
pub struct SyncProcessor {
  inner: Arc<Inner>,
}

impl SyncProcessor {
  pub fn new(transport: Arc<dyn Transport>, store: CacheStore, base: Url) -> Self {
    Self {
      inner: Arc::new(Inner {
        transport,
        store,
        base,
        pass: Mutex::new(()),
        requested: AtomicBool::new(false),
      }),
    }
  }

  /// Run a pass on every transition into `Online`.
  pub fn attach(&self, monitor: &ConnectivityMonitor) -> Subscription {
    let processor = self.clone();
    monitor.subscribe(move |state| {
      if !state.is_online() {
        return;
      }
      let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No async runtime available, skipping replay trigger");
        return;
      };

      let processor = processor.clone();
      runtime.spawn(async move {
        if let Err(e) = processor.run_pass().await {
          warn!(error = %e, "Replay pass failed");
        }
      });
    })
  }

  /// Replay every pending mutation once, in enqueue order.
  ///
  /// A call made while another pass runs returns `skipped` at once; the
  /// running pass then lists the queue again before it finishes.
  pub async fn run_pass(&self) -> Result<SyncReport> {
    let inner = &self.inner;
    inner.requested.store(true, Ordering::SeqCst);
    let mut report = SyncReport::default();

    loop {
      let Ok(pass) = inner.pass.try_lock() else {
        debug!("Replay pass already running, it will rerun");
        report.skipped = report.synced == 0 && report.failed == 0;
        return Ok(report);
      };

      while inner.requested.swap(false, Ordering::SeqCst) {
        self.replay_queue(&mut report).await?;
      }
      drop(pass);

      // A trigger that lost the race for the lock after the last round
      if !inner.requested.load(Ordering::SeqCst) {
        return Ok(report);
      }
    }
  }

  async fn replay_queue(&self, report: &mut SyncReport) -> Result<()> {
    let pending = self.inner.store.list_mutations().await?;
    if pending.is_empty() {
      return Ok(());
    }

    info!(count = pending.len(), "Replaying queued writes");
    for mutation in pending {
      match self.replay(&mutation).await {
        Ok(()) => match self.inner.store.delete_mutation(mutation.id).await {
          Ok(()) => {
            debug!(id = mutation.id, "Replayed queued write");
            report.synced += 1;
          }
          Err(e) => {
            warn!(
              id = mutation.id,
              error = %e,
              "Replayed write could not be removed from the queue"
            );
            report.failed += 1;
          }
        },
        Err(e) => {
          warn!(id = mutation.id, error = %e, "Replay failed, keeping write queued");
          report.failed += 1;
        }
      }
    }

    info!(synced = report.synced, failed = report.failed, "Replay pass finished");
    Ok(())
  }

  /// Wait until no pass is running and no trigger is left unserved.
  pub async fn wait_idle(&self) {
    loop {
      drop(self.inner.pass.lock().await);
      if !self.inner.requested.load(Ordering::SeqCst) {
        return;
      }
      if let Err(e) = self.run_pass().await {
        warn!(error = %e, "Replay pass failed");
        return;
      }
    }
  }

  async fn replay(&self, mutation: &PendingMutation) -> Result<()> {
    let queued = QueuedRequest::from_payload(&mutation.payload)
      .map_err(|e| eyre!("Failed to decode queued write: {}", e))?;
    let request = queued.to_request(&self.inner.base)?;

    let response = self
      .inner
      .transport
      .send(&request)
      .await
      .map_err(|e| eyre!("Failed to send {} {}: {}", queued.method, queued.path, e))?;

    if !response.is_success() {
      return Err(eyre!(
        "Server rejected {} {} with status {}",
        queued.method,
        queued.path,
        response.status
      ));
    }
    Ok(())
  }
}
