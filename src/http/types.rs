use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

/// An outgoing request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level page navigation rather than a subresource fetch
  pub navigate: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation, which accepts HTML.
  pub fn navigate(url: Url) -> Self {
    let mut request = Self::get(url).with_header("Accept", "text/html");
    request.navigate = true;
    request
  }

  /// A POST carrying a JSON document.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Self {
    Self::new(Method::POST, url)
      .with_header("Content-Type", "application/json")
      .with_body(body.to_string().into_bytes())
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  /// Whether the request changes server state (anything but GET/HEAD/OPTIONS/TRACE).
  pub fn is_mutating(&self) -> bool {
    !self.method.is_safe()
  }

  pub fn accepts_html(&self) -> bool {
    self
      .header("Accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Canonical request identity used as the cache key: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the server
  Network,
  /// Replayed from the persistent cache
  Cache { stored_at: DateTime<Utc> },
  /// Generated locally because neither network nor cache could answer
  Synthetic,
  /// Accepted into the replay queue instead of being sent
  Queued { id: i64 },
}

/// A response handed back to the caller.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  /// Final URL, after redirects
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, url: Url) -> Self {
    Self {
      status,
      url,
      headers: Vec::new(),
      body: Vec::new(),
      source: ResponseSource::Network,
    }
  }

  pub fn json(status: u16, url: Url, value: &serde_json::Value) -> Self {
    Self::new(status, url)
      .with_header("Content-Type", "application/json")
      .with_body(value.to_string().into_bytes())
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  /// Any 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("Content-Type")
  }

  pub fn is_from_cache(&self) -> bool {
    matches!(self.source, ResponseSource::Cache { .. })
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json_body<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }
}
