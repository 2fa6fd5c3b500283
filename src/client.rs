//! Portal client with transparent offline support.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::debug;

use crate::cache::{self, CacheStore, PendingMutation};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, HttpProbe, Subscription};
use crate::http::{HttpTransport, Request, Response, ResponseSource, Transport};
use crate::intercept::{Interceptor, RouteTable};
use crate::sync::SyncProcessor;

/// Data plus where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Placeholder data generated because nothing better was available.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Previously cached copy
  Cache,
  /// Neither network nor cache had it; the data is a placeholder
  Offline,
}

/// What happened to a submitted write.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// The server accepted it
  Delivered { status: u16, body: Value },
  /// Saved for replay once connectivity returns
  Queued { id: i64, message: String },
}

/// Portal client wiring the cache store, connectivity monitor, interceptor
/// and replay queue together.
///
/// Every request goes through the interceptor, so reads fall back to the
/// cache and feedback submissions are queued while offline.
pub struct PortalClient {
  interceptor: Interceptor,
  sync: SyncProcessor,
  _replay: Subscription,
}

impl PortalClient {
  /// Build a client from configuration. The monitor starts `Reconnecting`
  /// when `device_online`; call `check_now` to settle it.
  pub fn new(config: &Config, device_online: bool) -> Result<Self> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout())?);
    let store = CacheStore::from_arc(cache::open_storage(&config.cache));
    let probe = Arc::new(HttpProbe::new(Arc::clone(&transport), config.probe_url()?));
    let monitor = ConnectivityMonitor::with_timeout(probe, device_online, config.probe.timeout());
    let routes = RouteTable::new(config.base_url()?, &config.routes)?;

    Ok(Self::from_parts(transport, store, monitor, routes))
  }

  pub fn from_parts(
    transport: Arc<dyn Transport>,
    store: CacheStore,
    monitor: ConnectivityMonitor,
    routes: RouteTable,
  ) -> Self {
    let sync = SyncProcessor::new(Arc::clone(&transport), store.clone(), routes.base().clone());
    let replay = sync.attach(&monitor);
    let interceptor = Interceptor::new(transport, store, monitor, routes);

    Self {
      interceptor,
      sync,
      _replay: replay,
    }
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    self.interceptor.monitor()
  }

  pub fn store(&self) -> &CacheStore {
    self.interceptor.store()
  }

  pub fn interceptor(&self) -> &Interceptor {
    &self.interceptor
  }

  pub fn sync(&self) -> &SyncProcessor {
    &self.sync
  }

  /// Send any request through the interceptor.
  pub async fn send(&self, request: Request) -> Result<Response> {
    Ok(self.interceptor.handle(request).await?)
  }

  /// GET a path, as a page navigation when `html` is set.
  pub async fn get(&self, path: &str, html: bool) -> Result<Response> {
    let url = self.interceptor.routes().resolve(path)?;
    let request = if html {
      Request::navigate(url)
    } else {
      Request::get(url).with_header("Accept", "application/json")
    };
    self.send(request).await
  }

  /// GET a JSON document. Error statuses from the server are errors.
  pub async fn fetch_json(&self, path: &str) -> Result<CacheResult<Value>> {
    let response = self.get(path, false).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Request to {} failed with status {}: {}",
        path,
        response.status,
        response.text()
      ));
    }

    let data: Value = response
      .json_body()
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))?;

    Ok(match response.source {
      ResponseSource::Network => CacheResult::from_network(data),
      ResponseSource::Cache { stored_at } => CacheResult::from_cache(data, stored_at),
      ResponseSource::Synthetic | ResponseSource::Queued { .. } => CacheResult::offline(data),
    })
  }

  pub async fn news(&self) -> Result<CacheResult<Value>> {
    self.fetch_json("/api/news").await
  }

  pub async fn projects(&self) -> Result<CacheResult<Value>> {
    self.fetch_json("/api/projects").await
  }

  pub async fn leaders(&self) -> Result<CacheResult<Value>> {
    self.fetch_json("/api/leaders").await
  }

  pub async fn events(&self) -> Result<CacheResult<Value>> {
    self.fetch_json("/api/events").await
  }

  /// POST a JSON document. Writes to queue-capable endpoints are saved for
  /// replay when they cannot be delivered.
  pub async fn submit(&self, path: &str, body: &Value) -> Result<SubmitOutcome> {
    let url = self.interceptor.routes().resolve(path)?;
    let response = self.send(Request::post_json(url, body)).await?;

    if let ResponseSource::Queued { id } = response.source {
      let message = response
        .json_body::<Value>()
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_default();
      return Ok(SubmitOutcome::Queued { id, message });
    }

    if !response.is_success() {
      return Err(eyre!(
        "Submission to {} failed with status {}: {}",
        path,
        response.status,
        response.text()
      ));
    }

    Ok(SubmitOutcome::Delivered {
      status: response.status,
      body: response.json_body().unwrap_or(Value::Null),
    })
  }

  pub async fn submit_feedback(&self, feedback: &Value) -> Result<SubmitOutcome> {
    self.submit("/api/feedback", feedback).await
  }

  /// Cached JSON for a path, without touching the network.
  pub async fn cached(&self, path: &str) -> Result<Option<CacheResult<Value>>> {
    let url = self.interceptor.routes().resolve(path)?;
    let Some(response) = self.interceptor.lookup(&url).await else {
      return Ok(None);
    };

    let stored_at = match response.source {
      ResponseSource::Cache { stored_at } => stored_at,
      _ => Utc::now(),
    };
    let data = response
      .json_body()
      .map_err(|e| eyre!("Cached data for {} is not JSON: {}", path, e))?;
    Ok(Some(CacheResult::from_cache(data, stored_at)))
  }

  /// Store JSON as the cached copy for a path.
  pub async fn cache_data(&self, path: &str, data: &Value) -> Result<()> {
    let url = self.interceptor.routes().resolve(path)?;
    let response = Response::json(200, url.clone(), data);
    self.interceptor.prime(&url, &response).await;
    debug!(path, "Cached data");
    Ok(())
  }

  pub async fn pending(&self) -> Result<Vec<PendingMutation>> {
    self.store().list_mutations().await
  }
}
