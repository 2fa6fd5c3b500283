use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use url::Url;

use crate::http::{Request, Transport};

/// Result of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
  Reachable,
  /// Carries a short description of what went wrong, for logs only
  Unreachable(String),
}

impl ProbeOutcome {
  pub fn is_reachable(&self) -> bool {
    matches!(self, ProbeOutcome::Reachable)
  }
}

/// A lightweight server reachability check.
///
/// Implementations need not bound their own duration; the monitor applies
/// a hard timeout around every check.
pub trait LivenessProbe: Send + Sync {
  fn check(&self) -> BoxFuture<'_, ProbeOutcome>;
}

/// Probe that GETs the ping endpoint with a cache-busting timestamp.
///
/// Any 2xx counts as reachable; other statuses and transport errors don't.
pub struct HttpProbe {
  transport: Arc<dyn Transport>,
  endpoint: Url,
}

impl HttpProbe {
  pub fn new(transport: Arc<dyn Transport>, endpoint: Url) -> Self {
    Self {
      transport,
      endpoint,
    }
  }

  fn probe_url(&self) -> Url {
    let mut url = self.endpoint.clone();
    url
      .query_pairs_mut()
      .append_pair("t", &Utc::now().timestamp_millis().to_string());
    url
  }
}

impl LivenessProbe for HttpProbe {
  fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
    Box::pin(async move {
      let request = Request::get(self.probe_url()).with_header("Cache-Control", "no-store");

      match self.transport.send(&request).await {
        Ok(response) if response.is_success() => ProbeOutcome::Reachable,
        Ok(response) => ProbeOutcome::Unreachable(format!("status {}", response.status)),
        Err(e) => ProbeOutcome::Unreachable(e.to_string()),
      }
    })
  }
}
