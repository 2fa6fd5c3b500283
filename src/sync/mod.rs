//! Replay of queued writes.
//!
//! Writes to designated endpoints that cannot reach the server are stored as
//! [`QueuedRequest`]s in the cache store's mutation queue. The
//! [`SyncProcessor`] replays them in enqueue order whenever connectivity
//! comes back.

mod processor;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::Request;

pub use processor::{SyncProcessor, SyncReport};

/// The structured content of a pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
  pub method: String,
  /// Path plus query, relative to the portal origin
  pub path: String,
  pub body: serde_json::Value,
}

impl QueuedRequest {
  /// Capture a write for later replay. `None` when the body is not JSON.
  pub fn from_request(request: &Request) -> Option<Self> {
    let body = match request.body.as_deref() {
      None | Some([]) => serde_json::Value::Null,
      Some(bytes) => serde_json::from_slice(bytes).ok()?,
    };

    let mut path = request.url.path().to_string();
    if let Some(query) = request.url.query() {
      path.push('?');
      path.push_str(query);
    }

    Some(Self {
      method: request.method.as_str().to_string(),
      path,
      body,
    })
  }

  pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(self)
  }

  pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
    serde_json::from_slice(payload)
  }

  /// Rebuild the request against `base`.
  pub fn to_request(&self, base: &Url) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;
    let url = base
      .join(&self.path)
      .map_err(|e| eyre!("Invalid path '{}': {}", self.path, e))?;

    let mut request = Request::new(method, url);
    if !self.body.is_null() {
      request = request
        .with_header("Content-Type", "application/json")
        .with_body(self.body.to_string().into_bytes());
    }
    Ok(request)
  }
}
