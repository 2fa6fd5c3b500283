//! Cache envelopes and locally generated responses.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::cache::CacheEntry;
use crate::connectivity::OfflineReason;
use crate::http::{Response, ResponseSource};

/// Header marking a response replayed from the cache.
pub const FROM_CACHE_HEADER: &str = "X-From-Cache";

/// What gets stored for a mirrored response.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
  status: u16,
  content_type: Option<String>,
  /// Base64 so binary assets survive the JSON envelope
  body: String,
}

pub fn encode_response(response: &Response) -> Vec<u8> {
  let cached = CachedResponse {
    status: response.status,
    content_type: response.content_type().map(str::to_string),
    body: STANDARD.encode(&response.body),
  };
  // Serializing a struct of strings and integers cannot fail
  serde_json::to_vec(&cached).unwrap_or_default()
}

/// Rebuild a response from a cache entry. `None` if the envelope is unreadable.
pub fn decode_entry(entry: &CacheEntry, url: Url) -> Option<Response> {
  let cached: CachedResponse = serde_json::from_slice(&entry.payload).ok()?;
  let body = STANDARD.decode(cached.body).ok()?;

  let mut response = Response::new(cached.status, url)
    .with_body(body)
    .with_header(FROM_CACHE_HEADER, "true")
    .with_source(ResponseSource::Cache {
      stored_at: entry.stored_at,
    });
  if let Some(content_type) = cached.content_type {
    response = response.with_header("Content-Type", &content_type);
  }
  Some(response)
}

/// Placeholder for API data that is neither reachable nor cached.
pub fn offline_api(url: Url, reason: OfflineReason) -> Response {
  let body = json!({
    "status": "offline",
    "message": reason.uncached_message(),
    "data": [],
  });
  Response::json(200, url, &body).with_source(ResponseSource::Synthetic)
}

/// Acceptance of a write into the replay queue.
pub fn queued(url: Url, id: i64, reason: OfflineReason) -> Response {
  let body = json!({
    "status": "queued",
    "message": reason.queued_message(),
    "id": id,
  });
  Response::json(202, url, &body).with_source(ResponseSource::Queued { id })
}

/// Built-in page for navigations when not even the offline page is cached.
pub fn offline_page(url: Url, reason: OfflineReason) -> Response {
  let html = format!(
    "<!DOCTYPE html>\n<html lang=\"en\">\n\
     <head><meta charset=\"utf-8\"><title>Offline</title></head>\n\
     <body>\n<h1>{}</h1>\n<p>This page is not available offline. Previously visited pages \
     can still be opened.</p>\n</body>\n</html>\n",
    reason.message()
  );
  Response::new(200, url)
    .with_header("Content-Type", "text/html; charset=utf-8")
    .with_body(html.into_bytes())
    .with_source(ResponseSource::Synthetic)
}
