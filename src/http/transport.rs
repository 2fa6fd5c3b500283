use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;

use super::types::{Request, Response, ResponseSource};

/// Failure to get any HTTP response at all.
///
/// A response with an error status is not a transport failure: it means the
/// server is reachable and answered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("request failed: {0}")]
  Request(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      TransportError::Timeout
    } else if e.is_connect() {
      TransportError::Connect(e.to_string())
    } else {
      TransportError::Request(e.to_string())
    }
  }
}

/// Sends requests over the network.
pub trait Transport: Send + Sync {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("outpost/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TransportError>> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder.send().await?;

      let status = response.status().as_u16();
      let url = response.url().clone();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await?.to_vec();

      Ok(Response {
        status,
        url,
        headers,
        body,
        source: ResponseSource::Network,
      })
    })
  }
}
