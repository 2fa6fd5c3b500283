//! Scripted fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use url::Url;

use crate::cache::{CacheStore, SqliteStorage};
use crate::connectivity::{LivenessProbe, ProbeOutcome};
use crate::http::{Request, Response, Transport, TransportError};

pub fn base_url() -> Url {
  Url::parse("https://portal.test").unwrap()
}

pub fn url(path: &str) -> Url {
  base_url().join(path).unwrap()
}

pub fn memory_store() -> CacheStore {
  CacheStore::new(SqliteStorage::open_in_memory("portal-cache-v1").unwrap())
}

type Handler = Box<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;

/// Transport answering from a closure and recording every request.
pub struct FakeTransport {
  handler: Mutex<Handler>,
  delay: Mutex<Option<Duration>>,
  log: Mutex<Vec<Request>>,
}

impl FakeTransport {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      handler: Mutex::new(Box::new(handler)),
      delay: Mutex::new(None),
      log: Mutex::new(Vec::new()),
    })
  }

  /// Every request fails to connect.
  pub fn unreachable() -> Arc<Self> {
    Self::new(|_| Err(TransportError::Connect("connection refused".to_string())))
  }

  pub fn respond_with<F>(&self, handler: F)
  where
    F: Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
  {
    *self.handler.lock().unwrap() = Box::new(handler);
  }

  /// Hold every response back for `delay` before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.log.lock().unwrap().clone()
  }

  /// Number of requests sent to `path`.
  pub fn hits(&self, path: &str) -> usize {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }
}

impl Transport for FakeTransport {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>> {
    Box::pin(async move {
      self.log.lock().unwrap().push(request.clone());
      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      let handler = self.handler.lock().unwrap();
      handler(request)
    })
  }
}

/// Probe with a switchable answer.
pub struct StaticProbe {
  reachable: AtomicBool,
  calls: AtomicUsize,
}

impl StaticProbe {
  pub fn new(reachable: bool) -> Arc<Self> {
    Arc::new(Self {
      reachable: AtomicBool::new(reachable),
      calls: AtomicUsize::new(0),
    })
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl LivenessProbe for StaticProbe {
  fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
    Box::pin(async move {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.reachable.load(Ordering::SeqCst) {
        ProbeOutcome::Reachable
      } else {
        ProbeOutcome::Unreachable("scripted failure".to_string())
      }
    })
  }
}

/// Probe that blocks until released, for racing signals against it.
pub struct GatedProbe {
  reachable: bool,
  entered: Notify,
  gate: Notify,
}

impl GatedProbe {
  pub fn new(reachable: bool) -> Arc<Self> {
    Arc::new(Self {
      reachable,
      entered: Notify::new(),
      gate: Notify::new(),
    })
  }

  /// Wait until a check is in flight.
  pub async fn entered(&self) {
    self.entered.notified().await;
  }

  pub fn release(&self) {
    self.gate.notify_one();
  }
}

impl LivenessProbe for GatedProbe {
  fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
    Box::pin(async move {
      self.entered.notify_one();
      self.gate.notified().await;
      if self.reachable {
        ProbeOutcome::Reachable
      } else {
        ProbeOutcome::Unreachable("scripted failure".to_string())
      }
    })
  }
}

/// Probe that answers after a fixed delay.
pub struct DelayedProbe {
  delay: Duration,
  reachable: bool,
}

impl DelayedProbe {
  pub fn new(delay: Duration, reachable: bool) -> Arc<Self> {
    Arc::new(Self { delay, reachable })
  }
}

impl LivenessProbe for DelayedProbe {
  fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
    Box::pin(async move {
      tokio::time::sleep(self.delay).await;
      if self.reachable {
        ProbeOutcome::Reachable
      } else {
        ProbeOutcome::Unreachable("scripted failure".to_string())
      }
    })
  }
}
