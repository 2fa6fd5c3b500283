use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::classify::{RequestClass, RouteTable};
use super::synthetic;
use crate::cache::CacheStore;
use crate::connectivity::{ConnectionState, ConnectivityMonitor, OfflineReason};
use crate::http::{Request, Response, Transport, TransportError};
use crate::sync::QueuedRequest;

/// A request that could not be answered from any source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("{reason}: request to {url} failed: {source}")]
  Network {
    url: Url,
    reason: OfflineReason,
    #[source]
    source: TransportError,
  },
  #[error("{reason}: {url} is not available offline")]
  NotCached { url: Url, reason: OfflineReason },
  #[error("Failed to queue write to {url}: {detail}")]
  Queue { url: Url, detail: String },
  #[error("Precaching {url} failed with status {status}")]
  Precache { url: Url, status: u16 },
}

impl FetchError {
  /// Connectivity failure rather than a local fault.
  pub fn is_offline(&self) -> bool {
    matches!(self, FetchError::Network { .. } | FetchError::NotCached { .. })
  }

  pub fn reason(&self) -> Option<OfflineReason> {
    match self {
      FetchError::Network { reason, .. } | FetchError::NotCached { reason, .. } => Some(*reason),
      _ => None,
    }
  }
}

/// Last resort of a network-first request.
#[derive(Debug, Clone, Copy)]
enum Fallback {
  /// Propagate the failure
  None,
  /// `{status: "offline", message, data: []}`
  OfflinePayload,
  /// The cached offline page, else a built-in one
  OfflinePage,
}

/// Which live responses are copied into the cache.
#[derive(Debug, Clone, Copy)]
enum Mirror {
  AnySuccess,
  /// Exactly 200, and not redirected to another origin
  OkSameOrigin,
}

/// Why the network gave no response.
enum Miss {
  /// Not attempted because the device is offline
  Skipped,
  Failed(TransportError),
}

/// Counts spawned cache writes so callers can wait for them.
#[derive(Default)]
struct InflightWrites {
  count: AtomicUsize,
  idle: Notify,
}

struct WriteGuard(Arc<InflightWrites>);

impl WriteGuard {
  fn new(writes: &Arc<InflightWrites>) -> Self {
    writes.count.fetch_add(1, Ordering::SeqCst);
    Self(Arc::clone(writes))
  }
}

impl Drop for WriteGuard {
  fn drop(&mut self) {
    if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.0.idle.notify_waiters();
    }
  }
}

/// Result of [`Interceptor::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: usize,
  pub purged: usize,
}

/// Sits in front of the transport and routes every request.
#[derive(Clone)]
pub struct Interceptor {
  transport: Arc<dyn Transport>,
  store: CacheStore,
  monitor: ConnectivityMonitor,
  routes: Arc<RouteTable>,
  writes: Arc<InflightWrites>,
}

impl Interceptor {
  pub fn new(
    transport: Arc<dyn Transport>,
    store: CacheStore,
    monitor: ConnectivityMonitor,
    routes: RouteTable,
  ) -> Self {
    Self {
      transport,
      store,
      monitor,
      routes: Arc::new(routes),
      writes: Arc::default(),
    }
  }

  pub fn routes(&self) -> &RouteTable {
    &self.routes
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  /// Serve a request from the network, the cache, a synthetic response or
  /// the replay queue.
  ///
  /// Error statuses from a reachable server are returned as responses and
  /// never affect the connection state.
  pub async fn handle(&self, request: Request) -> Result<Response, FetchError> {
    let class = self.routes.classify(&request);
    trace!(
      method = %request.method,
      url = %request.url,
      class = class.as_str(),
      "Intercepted request"
    );

    match class {
      RequestClass::CrossOrigin | RequestClass::Write | RequestClass::Uncacheable => {
        self.pass_through(&request).await
      }
      RequestClass::QueueableWrite => self.queueable_write(request).await,
      RequestClass::StaticAsset { image } => self.cache_first(request, image).await,
      RequestClass::ReadEndpoint => {
        self
          .network_first(request, Fallback::OfflinePayload, Mirror::AnySuccess)
          .await
      }
      RequestClass::Navigation => {
        self
          .network_first(request, Fallback::OfflinePage, Mirror::AnySuccess)
          .await
      }
      RequestClass::Default => {
        self
          .network_first(request, Fallback::None, Mirror::OkSameOrigin)
          .await
      }
    }
  }

  /// Wait until every cache write started so far has finished.
  pub async fn flush(&self) {
    loop {
      let idle = self.writes.idle.notified();
      tokio::pin!(idle);
      idle.as_mut().enable();
      if self.writes.count.load(Ordering::SeqCst) == 0 {
        return;
      }
      idle.await;
    }
  }

  /// Fetch and store the precache list, then drop entries of other cache
  /// namespaces. Nothing is stored unless every fetch succeeds.
  pub async fn install(&self) -> Result<InstallReport> {
    let mut fetched = Vec::new();
    for url in self.routes.precache_urls() {
      let request = Request::get(url.clone());
      let response = self
        .transport
        .send(&request)
        .await
        .map_err(|e| self.network_error(&request, Miss::Failed(e)))?;
      if !response.is_success() {
        return Err(
          FetchError::Precache {
            url: url.clone(),
            status: response.status,
          }
          .into(),
        );
      }
      fetched.push((request.cache_key(), response));
    }

    let cached = fetched.len();
    for (key, response) in fetched {
      self
        .store
        .put(key, synthetic::encode_response(&response))
        .await;
    }

    let purged = self
      .store
      .purge_stale_namespaces()
      .await
      .map_err(|e| eyre!("Failed to purge old caches: {}", e))?;

    info!(cached, purged, "Installed offline cache");
    Ok(InstallReport { cached, purged })
  }

  /// The cached response for `url`, if any.
  pub async fn lookup(&self, url: &Url) -> Option<Response> {
    let mut key = url.clone();
    key.set_fragment(None);
    self.cached(key.as_str(), url).await
  }

  /// Store `response` as the cached copy for `url`.
  pub async fn prime(&self, url: &Url, response: &Response) {
    let mut key = url.clone();
    key.set_fragment(None);
    self
      .store
      .put(key.to_string(), synthetic::encode_response(response))
      .await;
  }

  async fn pass_through(&self, request: &Request) -> Result<Response, FetchError> {
    self
      .transport
      .send(request)
      .await
      .map_err(|e| self.network_error(request, Miss::Failed(e)))
  }

  async fn cache_first(&self, request: Request, image: bool) -> Result<Response, FetchError> {
    let key = request.cache_key();
    if let Some(cached) = self.cached(&key, &request.url).await {
      return Ok(cached);
    }

    match self.send(&request).await {
      Ok(response) => {
        self.mirror(&key, &response, Mirror::OkSameOrigin);
        Ok(response)
      }
      Err(miss) => {
        if image {
          let placeholder = self.routes.offline_image_url().to_string();
          if let Some(cached) = self.cached(&placeholder, &request.url).await {
            return Ok(cached);
          }
        }
        Err(self.network_error(&request, miss))
      }
    }
  }

  async fn network_first(
    &self,
    request: Request,
    fallback: Fallback,
    mirror: Mirror,
  ) -> Result<Response, FetchError> {
    let key = request.cache_key();

    let miss = match self.send(&request).await {
      Ok(response) => {
        self.mirror(&key, &response, mirror);
        return Ok(response);
      }
      Err(miss) => miss,
    };

    if let Some(cached) = self.cached(&key, &request.url).await {
      debug!(url = %request.url, "Serving cached copy");
      return Ok(cached);
    }

    let reason = self.offline_reason();
    match fallback {
      Fallback::None => Err(self.network_error(&request, miss)),
      Fallback::OfflinePayload => Ok(synthetic::offline_api(request.url, reason)),
      Fallback::OfflinePage => {
        let page = self.routes.offline_page_url().to_string();
        match self.cached(&page, &request.url).await {
          Some(cached) => Ok(cached),
          None => Ok(synthetic::offline_page(request.url, reason)),
        }
      }
    }
  }

  async fn queueable_write(&self, request: Request) -> Result<Response, FetchError> {
    let state = self.monitor.state();
    if let Some(reason) = state.offline_reason() {
      if QueuedRequest::from_request(&request).is_some() {
        return self.enqueue(&request, reason).await;
      }
      debug!(url = %request.url, "Write body is not JSON, sending without queueing");
      return self.pass_through(&request).await;
    }

    // Writes are only queued when not Online
    self.transport.send(&request).await.map_err(|e| {
      warn!(url = %request.url, error = %e, "Write failed while online");
      self.schedule_check();
      self.network_error(&request, Miss::Failed(e))
    })
  }

  async fn enqueue(
    &self,
    request: &Request,
    reason: OfflineReason,
  ) -> Result<Response, FetchError> {
    let queue_error = |detail: String| FetchError::Queue {
      url: request.url.clone(),
      detail,
    };

    let queued = QueuedRequest::from_request(request)
      .ok_or_else(|| queue_error("body is not JSON".to_string()))?;
    let payload = queued.to_payload().map_err(|e| queue_error(e.to_string()))?;
    let id = self
      .store
      .enqueue_mutation(payload)
      .await
      .map_err(|e| queue_error(e.to_string()))?;

    info!(id, path = %queued.path, reason = %reason, "Queued write for replay");
    Ok(synthetic::queued(request.url.clone(), id, reason))
  }

  /// Network attempt for same-origin GETs. Skipped while the device is down.
  async fn send(&self, request: &Request) -> Result<Response, Miss> {
    if self.monitor.state() == ConnectionState::DeviceOffline {
      return Err(Miss::Skipped);
    }

    match self.transport.send(request).await {
      Ok(response) => Ok(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network request failed");
        if self.monitor.state().is_online() {
          self.schedule_check();
        }
        Err(Miss::Failed(e))
      }
    }
  }

  async fn cached(&self, key: &str, url: &Url) -> Option<Response> {
    let entry = self.store.get(key).await?;
    let response = synthetic::decode_entry(&entry, url.clone());
    if response.is_none() {
      warn!(key = %key, "Ignoring unreadable cache entry");
    }
    response
  }

  /// Copy a live response into the cache in the background. The write lands
  /// even if the connection state has changed since the request was sent.
  fn mirror(&self, key: &str, response: &Response, policy: Mirror) {
    let admit = match policy {
      Mirror::AnySuccess => response.is_success(),
      Mirror::OkSameOrigin => response.status == 200 && self.routes.is_same_origin(&response.url),
    };
    if !admit {
      return;
    }

    let guard = WriteGuard::new(&self.writes);
    let store = self.store.clone();
    let key = key.to_string();
    let payload = synthetic::encode_response(response);
    tokio::spawn(async move {
      store.put(key, payload).await;
      drop(guard);
    });
  }

  fn offline_reason(&self) -> OfflineReason {
    self
      .monitor
      .state()
      .offline_reason()
      .unwrap_or(OfflineReason::Server)
  }

  fn network_error(&self, request: &Request, miss: Miss) -> FetchError {
    let reason = self.offline_reason();
    match miss {
      Miss::Skipped => FetchError::NotCached {
        url: request.url.clone(),
        reason,
      },
      Miss::Failed(source) => FetchError::Network {
        url: request.url.clone(),
        reason,
        source,
      },
    }
  }

  /// Ask the monitor for an on-demand probe without waiting for it.
  pub fn schedule_check(&self) {
    let monitor = self.monitor.clone();
    tokio::spawn(async move {
      monitor.check_now().await;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::testing::{base_url, memory_store, url, FakeTransport, StaticProbe};
  use reqwest::Method;
  use serde_json::{json, Value};
  use std::time::Duration;

  async fn online_monitor() -> ConnectivityMonitor {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), true);
    monitor.check_now().await;
    monitor
  }

  fn interceptor(
    transport: Arc<FakeTransport>,
    store: CacheStore,
    monitor: ConnectivityMonitor,
  ) -> Interceptor {
    Interceptor::new(
      transport,
      store,
      monitor,
      RouteTable::with_defaults(base_url()).unwrap(),
    )
  }

  fn news_server() -> Arc<FakeTransport> {
    FakeTransport::new(|req| {
      Ok(Response::json(
        200,
        req.url.clone(),
        &json!([{"id": 1, "title": "Borehole commissioned"}]),
      ))
    })
  }

  #[tokio::test]
  async fn test_read_endpoint_served_from_cache_when_device_offline() {
    let transport = news_server();
    let monitor = online_monitor().await;
    let interceptor = interceptor(Arc::clone(&transport), memory_store(), monitor.clone());

    let live = interceptor.handle(Request::get(url("/api/news"))).await.unwrap();
    assert!(!live.is_from_cache());
    interceptor.flush().await;

    monitor.device_offline();
    let cached = interceptor.handle(Request::get(url("/api/news"))).await.unwrap();

    assert!(cached.is_from_cache());
    assert_eq!(cached.body, live.body);
    assert_eq!(cached.header(synthetic::FROM_CACHE_HEADER), Some("true"));
    assert_eq!(transport.hits("/api/news"), 1);
  }

  #[tokio::test]
  async fn test_read_endpoint_offline_payload_names_server() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(false), true);
    monitor.check_now().await;
    let interceptor = interceptor(FakeTransport::unreachable(), memory_store(), monitor);

    let response = interceptor.handle(Request::get(url("/api/projects"))).await.unwrap();
    let body: Value = response.json_body().unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(body["status"], "offline");
    assert_eq!(body["message"], OfflineReason::Server.uncached_message());
    assert_eq!(body["data"], json!([]));
  }

  #[tokio::test]
  async fn test_error_status_is_returned_and_not_cached() {
    let transport = FakeTransport::new(|req| Ok(Response::new(500, req.url.clone())));
    let monitor = online_monitor().await;
    let store = memory_store();
    let interceptor = interceptor(transport, store.clone(), monitor.clone());

    let response = interceptor.handle(Request::get(url("/api/events"))).await.unwrap();
    interceptor.flush().await;

    assert_eq!(response.status, 500);
    assert_eq!(monitor.state(), ConnectionState::Online);
    assert!(store.get(url("/api/events").as_str()).await.is_none());
  }

  #[tokio::test]
  async fn test_static_asset_is_cache_first() {
    let transport = FakeTransport::new(|req| {
      Ok(
        Response::new(200, req.url.clone())
          .with_header("Content-Type", "text/css")
          .with_body(b"body{}".to_vec()),
      )
    });
    let interceptor = interceptor(Arc::clone(&transport), memory_store(), online_monitor().await);

    interceptor.handle(Request::get(url("/style.css"))).await.unwrap();
    interceptor.flush().await;
    let second = interceptor.handle(Request::get(url("/style.css"))).await.unwrap();

    assert!(second.is_from_cache());
    assert_eq!(second.body, b"body{}");
    assert_eq!(transport.hits("/style.css"), 1);
  }

  #[tokio::test]
  async fn test_redirected_asset_is_not_cached() {
    let transport = FakeTransport::new(|_| {
      Ok(Response::new(200, Url::parse("https://cdn.other.test/app.js").unwrap()))
    });
    let store = memory_store();
    let interceptor = interceptor(transport, store.clone(), online_monitor().await);

    interceptor.handle(Request::get(url("/app.js"))).await.unwrap();
    interceptor.flush().await;

    assert!(store.get(url("/app.js").as_str()).await.is_none());
  }

  #[tokio::test]
  async fn test_image_falls_back_to_offline_image() {
    let store = memory_store();
    let placeholder = Response::new(200, url("/offline-image.png"))
      .with_header("Content-Type", "image/png")
      .with_body(vec![1, 2, 3]);
    store
      .put(
        url("/offline-image.png").to_string(),
        synthetic::encode_response(&placeholder),
      )
      .await;
    let interceptor = interceptor(FakeTransport::unreachable(), store, online_monitor().await);

    let image = interceptor.handle(Request::get(url("/uploads/mp.jpg"))).await.unwrap();
    assert_eq!(image.body, vec![1, 2, 3]);

    let script = interceptor.handle(Request::get(url("/app.js"))).await;
    assert!(matches!(script, Err(FetchError::Network { .. })));
  }

  #[tokio::test]
  async fn test_navigation_fallbacks() {
    let store = memory_store();
    let monitor = online_monitor().await;
    monitor.device_offline();
    let interceptor = interceptor(FakeTransport::unreachable(), store.clone(), monitor);

    let builtin = interceptor.handle(Request::navigate(url("/leaders"))).await.unwrap();
    assert_eq!(builtin.status, 200);
    assert!(builtin.text().contains(OfflineReason::Device.message()));

    let page = Response::new(200, url("/offline.html"))
      .with_header("Content-Type", "text/html")
      .with_body(b"<h1>offline</h1>".to_vec());
    store
      .put(url("/offline.html").to_string(), synthetic::encode_response(&page))
      .await;

    let cached = interceptor.handle(Request::navigate(url("/leaders"))).await.unwrap();
    assert_eq!(cached.text(), "<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_default_get_propagates_uncached_failure() {
    let interceptor = interceptor(
      FakeTransport::unreachable(),
      memory_store(),
      online_monitor().await,
    );

    let err = interceptor
      .handle(Request::get(url("/api/ping")))
      .await
      .unwrap_err();
    assert!(err.is_offline());
  }

  #[tokio::test]
  async fn test_device_offline_skips_network() {
    let transport = news_server();
    let monitor = online_monitor().await;
    monitor.device_offline();
    let interceptor = interceptor(Arc::clone(&transport), memory_store(), monitor);

    let err = interceptor
      .handle(Request::get(url("/data.json")))
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::NotCached { reason: OfflineReason::Device, .. }));
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn test_write_queued_while_server_offline() {
    let transport = FakeTransport::unreachable();
    let monitor = ConnectivityMonitor::new(StaticProbe::new(false), true);
    monitor.check_now().await;
    let store = memory_store();
    let interceptor = interceptor(Arc::clone(&transport), store.clone(), monitor);

    let request = Request::post_json(url("/api/feedback"), &json!({"message": "Fix the road"}));
    let response = interceptor.handle(request).await.unwrap();

    assert_eq!(response.status, 202);
    let body: Value = response.json_body().unwrap();
    assert_eq!(body["message"], OfflineReason::Server.queued_message());
    assert!(transport.requests().is_empty());

    let pending = store.list_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, 1);
    let queued = QueuedRequest::from_payload(&pending[0].payload).unwrap();
    assert_eq!(queued.body["message"], "Fix the road");
  }

  #[tokio::test]
  async fn test_write_failing_while_online_is_returned_as_error() {
    let probe = StaticProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    monitor.check_now().await;
    let store = memory_store();
    let interceptor = interceptor(FakeTransport::unreachable(), store.clone(), monitor.clone());

    let request = Request::post_json(url("/api/feedback"), &json!({"message": "hello"}));
    let err = interceptor.handle(request).await.unwrap_err();

    assert!(matches!(err, FetchError::Network { .. }));
    assert!(store.list_mutations().await.unwrap().is_empty());

    // The failure schedules a fresh check
    for _ in 0..100 {
      if probe.calls() >= 2 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(probe.calls(), 2);
    assert_eq!(monitor.state(), ConnectionState::Online);
  }

  #[tokio::test]
  async fn test_write_queued_while_reconnecting() {
    let transport = FakeTransport::new(|req| Ok(Response::new(201, req.url.clone())));
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), true);
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    let store = memory_store();
    let interceptor = interceptor(Arc::clone(&transport), store.clone(), monitor);

    let request = Request::post_json(url("/api/feedback"), &json!({"message": "early"}));
    let response = interceptor.handle(request).await.unwrap();

    assert_eq!(response.status, 202);
    let body: Value = response.json_body().unwrap();
    assert_eq!(body["message"], OfflineReason::Server.queued_message());
    assert!(transport.requests().is_empty());
    assert_eq!(store.list_mutations().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_write_to_other_endpoint_is_not_queued() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(false), true);
    monitor.check_now().await;
    let store = memory_store();
    let interceptor = interceptor(FakeTransport::unreachable(), store.clone(), monitor);

    let request = Request::post_json(url("/api/news"), &json!({"title": "x"}));
    assert!(interceptor.handle(request).await.is_err());
    assert!(store.list_mutations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cross_origin_passes_through_uncached() {
    let transport = FakeTransport::new(|req| Ok(Response::new(200, req.url.clone())));
    let monitor = online_monitor().await;
    monitor.device_offline();
    let store = memory_store();
    let interceptor = interceptor(Arc::clone(&transport), store.clone(), monitor);

    let font = Url::parse("https://fonts.other.test/inter.woff2").unwrap();
    interceptor.handle(Request::get(font.clone())).await.unwrap();
    interceptor.flush().await;

    assert_eq!(transport.requests().len(), 1);
    assert!(store.get(font.as_str()).await.is_none());
  }

  #[tokio::test]
  async fn test_head_request_leaves_cached_get_intact() {
    let transport = news_server();
    let monitor = online_monitor().await;
    let interceptor = interceptor(Arc::clone(&transport), memory_store(), monitor.clone());

    let live = interceptor.handle(Request::get(url("/api/news"))).await.unwrap();
    interceptor.flush().await;

    transport.respond_with(|req| Ok(Response::new(200, req.url.clone())));
    let head = interceptor
      .handle(Request::new(Method::HEAD, url("/api/news")))
      .await
      .unwrap();
    assert!(head.body.is_empty());
    interceptor.flush().await;

    monitor.device_offline();
    let cached = interceptor.handle(Request::get(url("/api/news"))).await.unwrap();
    assert!(cached.is_from_cache());
    assert_eq!(cached.body, live.body);
  }

  #[tokio::test]
  async fn test_late_success_still_updates_cache() {
    let transport = news_server();
    transport.set_delay(Duration::from_millis(50));
    let monitor = online_monitor().await;
    let store = memory_store();
    let interceptor = interceptor(transport, store.clone(), monitor.clone());

    let pending = tokio::spawn({
      let interceptor = interceptor.clone();
      async move { interceptor.handle(Request::get(url("/api/news"))).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.device_offline();

    assert!(pending.await.unwrap().is_ok());
    interceptor.flush().await;
    assert!(store.get(url("/api/news").as_str()).await.is_some());
  }

  #[tokio::test]
  async fn test_install_precaches_all_or_nothing() {
    let store = memory_store();
    let transport = FakeTransport::new(|req| {
      let status = if req.url.path() == "/manifest.json" { 404 } else { 200 };
      Ok(Response::new(status, req.url.clone()))
    });
    let interceptor = interceptor(Arc::clone(&transport), store.clone(), online_monitor().await);

    assert!(interceptor.install().await.is_err());
    assert!(store.get(url("/offline.html").as_str()).await.is_none());

    transport.respond_with(|req| Ok(Response::new(200, req.url.clone())));
    let report = interceptor.install().await.unwrap();
    assert_eq!(report.cached, 5);
    assert!(store.get(url("/offline.html").as_str()).await.is_some());
  }
}
